use tether_core::crypto::CryptoError;

use crate::*;

/// Static route entry pointing at `target`.
fn route_to(net: &SimNetwork, target: usize) -> (String, String) {
    (net.key(target).to_string(), net.node(target).addr.to_string())
}

#[tokio::test]
async fn static_route_carries_traffic() -> Result<()> {
    let mut net = SimNetwork::new();
    let b = net.add_node(|_| {})?;
    let (key, addr) = route_to(&net, b);
    let a = net.add_node(|c| {
        c.static_routes.insert(key, addr);
    })?;

    net.node(a).node.send(net.key(b), Bytes::from_static(b"fixed"))?;
    net.pump();
    let delivered = net.deliveries(b);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].sender, net.key(a));
    Ok(())
}

#[tokio::test]
async fn other_network_is_rejected() -> Result<()> {
    let mut net = SimNetwork::new();
    let b = net.add_node(|_| {})?;
    let (key, addr) = route_to(&net, b);
    let intruder = net.add_node(|c| {
        c.network_id = 7;
        c.static_routes.insert(key, addr);
    })?;

    net.node(intruder).node.send(net.key(b), Bytes::from_static(b"hello?"))?;
    net.pump();

    assert!(net.deliveries(b).is_empty());
    assert_eq!(net.rejections, vec![(b, PipelineError::OtherNetwork(7))]);
    Ok(())
}

#[tokio::test]
async fn unarmed_message_is_refused_by_arming_node() -> Result<()> {
    let mut net = SimNetwork::new();
    let b = net.add_node(|_| {})?;
    let (key, addr) = route_to(&net, b);
    let a = net.add_node(|c| {
        c.message_arm_enabled = false;
        c.static_routes.insert(key, addr);
    })?;

    net.node(a).node.send(net.key(b), Bytes::from_static(b"in the clear"))?;
    net.pump();

    assert!(net.deliveries(b).is_empty());
    assert!(matches!(
        net.rejections.as_slice(),
        [(idx, PipelineError::Crypto(CryptoError::DisarmingFailed(_)))] if *idx == b
    ));
    Ok(())
}

#[tokio::test]
async fn oversized_message_is_refused_before_sending() -> Result<()> {
    let mut net = SimNetwork::new();
    let b = net.add_node(|_| {})?;
    let (key, addr) = route_to(&net, b);
    let a = net.add_node(|c| {
        c.message_max_content_length = 4 * MTU;
        c.static_routes.insert(key, addr);
    })?;

    let err = net
        .node(a)
        .node
        .send(net.key(b), Bytes::from(vec![0u8; 4 * MTU]))
        .unwrap_err();
    assert!(matches!(err, PipelineError::MessageTooLarge { .. }));
    assert!(net.pump().is_empty());

    // below the limit the message is chunked and reassembled
    net.node(a).node.send(net.key(b), Bytes::from(vec![7u8; 3 * MTU]))?;
    let frames = net.pump();
    assert!(frames.len() > 1);
    assert!(frames.iter().all(|f| net.is_chunk(f)));
    assert_eq!(net.deliveries(b)[0].payload.len(), 3 * MTU);
    Ok(())
}
