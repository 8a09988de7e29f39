use tether_core::MessageType;
use tether_services::{PathKind, PeersManager};

use crate::*;

/// A pings its super peer S; S answers; A promotes S.
#[tokio::test]
async fn super_peer_ack_promotes_super_peer() -> Result<()> {
    let mut net = SimNetwork::new();
    let s = net.add_node(|_| {})?;
    let super_peer = net.endpoint(s);
    let a = net.add_node(|c| c.super_peers = vec![super_peer])?;

    net.tick(a);
    assert_eq!(net.node(a).node.discovery().open_ping_count(), 1);

    let frames = net.pump();
    assert_eq!(frames.len(), 2);
    assert_eq!(net.message_type(&frames[0]), Some(MessageType::Discovery));
    assert_eq!(net.message_type(&frames[1]), Some(MessageType::Acknowledgement));

    let sim = net.node(a);
    assert_eq!(sim.node.discovery().open_ping_count(), 0);
    assert_eq!(sim.node.discovery().best_super_peer(), Some(net.key(s)));
    assert_eq!(sim.registry.super_peer_key(), Some(net.key(s)));
    assert!(sim.registry.has_path(&net.key(s), PathKind::Internet));
    let peer = sim.node.discovery().peer(&net.key(s)).context("super peer unknown")?;
    assert_eq!(peer.address, Some(net.node(s).addr));

    // the ping asked S to adopt A as a child
    assert!(net.node(s).registry.is_child(&net.key(a)));
    assert!(net.rejections.is_empty());
    Ok(())
}

/// A super peer that stops answering is demoted after the ping timeout.
#[tokio::test]
async fn silent_super_peer_is_demoted() -> Result<()> {
    let mut net = SimNetwork::new();
    let s = net.add_node(|_| {})?;
    let super_peer = net.endpoint(s);
    let a = net.add_node(|c| c.super_peers = vec![super_peer])?;

    net.tick(a);
    net.pump();
    assert_eq!(net.node(a).registry.super_peer_key(), Some(net.key(s)));

    net.node(s).node.stop();
    net.clock.advance(test_config().ping_timeout_ms + 1);
    net.tick(a);
    net.pump();

    assert_eq!(net.node(a).registry.super_peer_key(), None);
    assert_eq!(net.node(a).node.discovery().best_super_peer(), None);
    assert!(net
        .rejections
        .iter()
        .any(|(idx, e)| *idx == s && *e == PipelineError::Stopped));
    Ok(())
}

/// A's super peer M has a super peer of its own, S. M relays only to peers
/// it can reach, so traffic for a stranger dies at M instead of climbing to S.
#[tokio::test]
async fn intermediate_super_peer_drops_traffic_for_unknown_peer() -> Result<()> {
    let mut net = SimNetwork::new();
    let s = net.add_node(|_| {})?;
    let top = net.endpoint(s);
    let m = net.add_node(|c| c.super_peers = vec![top])?;
    let middle = net.endpoint(m);
    let a = net.add_node(|c| c.super_peers = vec![middle])?;

    net.tick(m);
    net.tick(a);
    net.pump();
    assert_eq!(net.node(m).node.discovery().best_super_peer(), Some(net.key(s)));
    assert_eq!(net.node(a).node.discovery().best_super_peer(), Some(net.key(m)));

    let stranger = crypto::Keypair::generate().public_key();
    net.node(a).node.send(stranger, Bytes::from_static(b"anyone?"))?;
    let frames = net.pump();

    assert!(frames
        .iter()
        .any(|f| f.from == a && net.recipient(f) == Some(stranger)));
    assert!(!frames
        .iter()
        .any(|f| f.from == m && net.recipient(f) == Some(stranger)));
    assert!(net
        .rejections
        .iter()
        .any(|(idx, e)| *idx == m && *e == PipelineError::NoRouteToPeer(stranger)));
    Ok(())
}
