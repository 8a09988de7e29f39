//! tether integration test harness.
//!
//! Scenarios run whole nodes against an in-memory network. Frames are
//! moved between nodes synchronously by [`SimNetwork::pump`], and all
//! nodes share one [`ManualClock`]. Heartbeats are driven by hand: the
//! configured ping interval is an hour and scenarios never await, so the
//! nodes' own heartbeat tasks never run.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedReceiver;

use tether_core::config::RemoteConfig;
use tether_core::crypto;
use tether_core::wire::MULTICAST_GROUP;
use tether_core::{Envelope, Identity, MessageType, PublicKey};
use tether_services::{Delivery, ManualClock, Node, Outgoing, PeerRegistry, PipelineError};

mod admission;
mod discovery;
mod local;
mod rendezvous;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const PORT: u16 = 22527;
pub const MTU: usize = 1432;

/// Base configuration for every simulated node.
pub fn test_config() -> RemoteConfig {
    RemoteConfig {
        ping_interval_ms: 3_600_000,
        pow_difficulty: 1,
        local_discovery: false,
        message_mtu: MTU,
        ..RemoteConfig::default()
    }
}

pub struct SimNode {
    pub node: Node,
    pub identity: Arc<Identity>,
    pub registry: PeerRegistry,
    pub addr: SocketAddr,
    outgoing: UnboundedReceiver<Outgoing>,
    deliveries: UnboundedReceiver<Delivery>,
}

/// A frame as it left a node.
#[derive(Debug, Clone)]
pub struct Frame {
    pub from: usize,
    pub to: SocketAddr,
    pub bytes: Bytes,
}

pub struct SimNetwork {
    pub clock: Arc<ManualClock>,
    nodes: Vec<SimNode>,
    blocked: HashSet<(usize, usize)>,
    /// Errors returned by `Node::receive`, with the receiving node.
    pub rejections: Vec<(usize, PipelineError)>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self {
            clock: ManualClock::new(1_000),
            nodes: Vec::new(),
            blocked: HashSet::new(),
            rejections: Vec::new(),
        }
    }

    /// Add and start a node at `10.0.0.<n>:22527`. Must run inside a
    /// tokio runtime.
    pub fn add_node(&mut self, configure: impl FnOnce(&mut RemoteConfig)) -> Result<usize> {
        let mut config = test_config();
        configure(&mut config);

        let idx = self.nodes.len();
        let octet = u8::try_from(idx + 1).context("too many nodes")?;
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, octet), PORT));
        let identity = Arc::new(Identity::generate(config.pow_difficulty));
        let registry = PeerRegistry::new();
        let (node, handles) = Node::new(
            &config,
            identity.clone(),
            Arc::new(registry.clone()),
            self.clock.clone(),
        )?;
        node.start();

        self.nodes.push(SimNode {
            node,
            identity,
            registry,
            addr,
            outgoing: handles.outgoing,
            deliveries: handles.deliveries,
        });
        Ok(idx)
    }

    pub fn node(&self, idx: usize) -> &SimNode {
        &self.nodes[idx]
    }

    pub fn key(&self, idx: usize) -> PublicKey {
        self.nodes[idx].identity.public_key()
    }

    /// `public_key@address`, as used in `super_peers`.
    pub fn endpoint(&self, idx: usize) -> String {
        format!("{}@{}", self.key(idx), self.nodes[idx].addr)
    }

    /// Drop all frames between `a` and `b`, both ways.
    pub fn block(&mut self, a: usize, b: usize) {
        self.blocked.insert((a, b));
        self.blocked.insert((b, a));
    }

    pub fn tick(&self, idx: usize) {
        self.nodes[idx].node.tick();
    }

    /// Deliver queued frames until the network is quiet. Returns every
    /// frame sent, in order.
    pub fn pump(&mut self) -> Vec<Frame> {
        let mut sent = Vec::new();
        for _ in 0..64 {
            let mut batch = Vec::new();
            for (idx, sim) in self.nodes.iter_mut().enumerate() {
                while let Ok(Outgoing { to, bytes }) = sim.outgoing.try_recv() {
                    batch.push(Frame { from: idx, to, bytes });
                }
            }
            if batch.is_empty() {
                return sent;
            }
            for frame in &batch {
                self.deliver(frame);
            }
            sent.extend(batch);
        }
        panic!("network did not settle");
    }

    fn deliver(&mut self, frame: &Frame) {
        let source = self.nodes[frame.from].addr;
        let targets: Vec<usize> = if frame.to == SocketAddr::V4(MULTICAST_GROUP) {
            (0..self.nodes.len()).filter(|&i| i != frame.from).collect()
        } else {
            self.nodes.iter().position(|n| n.addr == frame.to).into_iter().collect()
        };
        for idx in targets {
            if self.blocked.contains(&(frame.from, idx)) {
                continue;
            }
            if let Err(e) = self.nodes[idx].node.receive(source, frame.bytes.clone()) {
                self.rejections.push((idx, e));
            }
        }
    }

    pub fn deliveries(&mut self, idx: usize) -> Vec<Delivery> {
        let mut out = Vec::new();
        while let Ok(delivery) = self.nodes[idx].deliveries.try_recv() {
            out.push(delivery);
        }
        out
    }

    pub fn is_chunk(&self, frame: &Frame) -> bool {
        Envelope::decode(frame.bytes.clone()).is_ok_and(|e| e.is_chunk())
    }

    /// Type of a whole (non-chunk) frame, disarmed with the recipient's
    /// key when armed.
    pub fn message_type(&self, frame: &Frame) -> Option<MessageType> {
        let envelope = Envelope::decode(frame.bytes.clone()).ok()?;
        if envelope.is_chunk() {
            return None;
        }
        if envelope.is_armed() {
            let recipient = self
                .nodes
                .iter()
                .find(|n| n.identity.public_key() == envelope.recipient())?;
            let disarmed = crypto::disarm(envelope, recipient.identity.keypair()).ok()?;
            return disarmed.message_type().ok();
        }
        envelope.message_type().ok()
    }

    /// Recipient key of a frame, if it decodes.
    pub fn recipient(&self, frame: &Frame) -> Option<PublicKey> {
        Envelope::decode(frame.bytes.clone()).ok().map(|e| e.recipient())
    }
}
