use tether_core::wire::MULTICAST_GROUP;
use tether_services::PathKind;

use crate::*;

/// Two nodes on one LAN find each other through multicast announcements.
#[tokio::test]
async fn multicast_announcements_register_local_paths() -> Result<()> {
    let mut net = SimNetwork::new();
    let a = net.add_node(|c| c.local_discovery = true)?;
    let b = net.add_node(|c| c.local_discovery = true)?;

    net.tick(a);
    net.tick(b);
    let frames = net.pump();
    assert_eq!(frames.len(), 2);
    assert!(frames.iter().all(|f| f.to == SocketAddr::V4(MULTICAST_GROUP)));

    assert!(net.node(a).registry.has_path(&net.key(b), PathKind::LocalNetwork));
    assert!(net.node(b).registry.has_path(&net.key(a), PathKind::LocalNetwork));

    net.node(a).node.send(net.key(b), Bytes::from_static(b"over the lan"))?;
    let frames = net.pump();
    assert_eq!(frames[0].to, net.node(b).addr);
    assert_eq!(net.deliveries(b)[0].payload, Bytes::from_static(b"over the lan"));
    Ok(())
}

#[tokio::test]
async fn quiet_local_peer_is_forgotten() -> Result<()> {
    let mut net = SimNetwork::new();
    let a = net.add_node(|c| c.local_discovery = true)?;
    let b = net.add_node(|c| c.local_discovery = true)?;

    net.tick(b);
    net.pump();
    assert!(net.node(a).registry.has_path(&net.key(b), PathKind::LocalNetwork));

    net.node(b).node.stop();
    net.clock.advance(test_config().ping_timeout_ms + 1);
    net.tick(a);
    net.pump();

    assert!(net.node(a).registry.is_empty());
    let err = net
        .node(a)
        .node
        .send(net.key(b), Bytes::from_static(b"anyone?"))
        .unwrap_err();
    assert_eq!(err, PipelineError::NoRouteToPeer(net.key(b)));
    Ok(())
}
