use tether_core::MessageType;

use crate::*;

struct Rendezvous {
    net: SimNetwork,
    s: usize,
    a: usize,
    b: usize,
}

/// S is the top-level super peer; A and B have both joined it.
fn joined() -> Result<Rendezvous> {
    let mut net = SimNetwork::new();
    let s = net.add_node(|_| {})?;
    let super_peer = net.endpoint(s);
    let a = net.add_node(|c| c.super_peers = vec![super_peer.clone()])?;
    let b = net.add_node(|c| c.super_peers = vec![super_peer])?;
    net.tick(a);
    net.tick(b);
    net.pump();
    net.clock.advance(1_000);
    Ok(Rendezvous { net, s, a, b })
}

fn payload() -> Bytes {
    Bytes::from(vec![0x5a; 2 * MTU])
}

#[tokio::test]
async fn relay_delivers_chunks_and_unites_once_per_cooldown() -> Result<()> {
    let Rendezvous { mut net, s, a, b } = joined()?;
    // hole punching between A and B fails
    net.block(a, b);

    net.node(a).node.send(net.key(b), payload())?;
    let frames = net.pump();

    let from_s: Vec<&Frame> = frames.iter().filter(|f| f.from == s).collect();
    let relayed: Vec<&&Frame> = from_s.iter().filter(|f| net.is_chunk(f)).collect();
    assert_eq!(relayed.len(), 3);
    assert!(relayed.iter().all(|f| f.to == net.node(b).addr));

    let unites: Vec<&&Frame> = from_s
        .iter()
        .filter(|f| net.message_type(f) == Some(MessageType::Unite))
        .collect();
    assert_eq!(unites.len(), 2);
    assert!(unites.iter().any(|f| net.recipient(f) == Some(net.key(a))));
    assert!(unites.iter().any(|f| net.recipient(f) == Some(net.key(b))));

    let delivered = net.deliveries(b);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].sender, net.key(a));
    assert_eq!(delivered[0].payload, payload());

    // still inside the unite cool-down: relayed again, no new unites
    net.clock.advance(1_000);
    net.node(a).node.send(net.key(b), payload())?;
    let frames = net.pump();
    let from_s: Vec<&Frame> = frames.iter().filter(|f| f.from == s).collect();
    assert_eq!(from_s.iter().filter(|f| net.is_chunk(f)).count(), 3);
    assert_eq!(
        from_s
            .iter()
            .filter(|f| net.message_type(f) == Some(MessageType::Unite))
            .count(),
        0
    );
    assert_eq!(net.deliveries(b).len(), 1);
    Ok(())
}

#[tokio::test]
async fn united_peers_talk_directly() -> Result<()> {
    let Rendezvous { mut net, s, a, b } = joined()?;

    net.node(a).node.send(net.key(b), Bytes::from_static(b"first"))?;
    net.pump();
    assert_eq!(net.deliveries(b).len(), 1);
    assert!(net.node(a).node.discovery().is_rendezvous_peer(&net.key(b)));
    assert!(net.node(b).node.discovery().is_rendezvous_peer(&net.key(a)));

    net.clock.advance(1_000);
    net.node(a).node.send(net.key(b), payload())?;
    let frames = net.pump();
    let s_addr = net.node(s).addr;
    assert!(!frames.is_empty());
    assert!(frames.iter().all(|f| f.from != s && f.to != s_addr));

    let delivered = net.deliveries(b);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].payload, payload());

    // and back
    net.node(b).node.send(net.key(a), Bytes::from_static(b"reply"))?;
    let frames = net.pump();
    assert!(frames.iter().all(|f| f.to != s_addr));
    assert_eq!(net.deliveries(a)[0].payload, Bytes::from_static(b"reply"));
    Ok(())
}
