//! Local network discovery over IP multicast.
//!
//! Each heartbeat announces this node to the well-known multicast group
//! with an unarmed Discovery that has no recipient. Announcements from
//! other nodes register a `LocalNetwork` path to the announcing key at the
//! frame's source address. Entries not refreshed within the ping timeout
//! are removed.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tether_core::wire::MULTICAST_GROUP;
use tether_core::{Body, Envelope, Identity, PublicKey};

use crate::clock::SharedClock;
use crate::error::PipelineError;
use crate::peers::{PathKind, SharedPeersManager};
use crate::pipeline::{Action, Address, Message, NodeEvent, Stage};

#[derive(Debug, Clone, Copy)]
struct LocalPeer {
    address: SocketAddr,
    last_seen: u64,
}

pub struct LocalNetworkDiscovery {
    identity: Arc<Identity>,
    network_id: i32,
    ping_timeout_ms: u64,
    group: SocketAddr,
    peers_manager: SharedPeersManager,
    clock: SharedClock,
    peers: DashMap<PublicKey, LocalPeer>,
}

impl LocalNetworkDiscovery {
    pub fn new(
        identity: Arc<Identity>,
        network_id: i32,
        ping_timeout_ms: u64,
        peers_manager: SharedPeersManager,
        clock: SharedClock,
    ) -> Self {
        Self {
            identity,
            network_id,
            ping_timeout_ms,
            group: SocketAddr::V4(MULTICAST_GROUP),
            peers_manager,
            clock,
            peers: DashMap::new(),
        }
    }

    pub fn local_address(&self, key: &PublicKey) -> Option<SocketAddr> {
        self.peers.get(key).map(|p| p.address)
    }

    fn announcement(&self) -> Envelope {
        Envelope::new(
            self.network_id,
            self.identity.public_key(),
            self.identity.proof_of_work(),
            PublicKey::NONE,
            Body::Discovery { children_time: 0 },
        )
    }

    fn remove_stale(&self, now: u64) {
        let stale: Vec<PublicKey> = self
            .peers
            .iter()
            .filter(|entry| now.saturating_sub(entry.last_seen) > self.ping_timeout_ms)
            .map(|entry| *entry.key())
            .collect();
        for key in stale {
            tracing::debug!(peer = %key, "local peer went quiet");
            self.peers.remove(&key);
            self.peers_manager.remove_path(key, PathKind::LocalNetwork);
        }
    }

    fn clear(&self) {
        let keys: Vec<PublicKey> = self.peers.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            self.peers.remove(&key);
            self.peers_manager.remove_path(key, PathKind::LocalNetwork);
        }
    }
}

impl Stage for LocalNetworkDiscovery {
    fn name(&self) -> &'static str {
        "local-network-discovery"
    }

    fn on_inbound(&self, from: Address, message: Message) -> Result<Vec<Action>, PipelineError> {
        let announcement = match (&from, &message) {
            (Address::Socket(src), Message::Envelope(envelope)) if envelope.recipient().is_none() => {
                Some((*src, envelope.sender(), envelope.body()?.clone()))
            }
            _ => None,
        };
        let Some((src, sender, Body::Discovery { .. })) = announcement else {
            return Ok(vec![Action::Inbound { from, message }]);
        };
        if sender == self.identity.public_key() {
            return Ok(Vec::new());
        }

        let previous = self.peers.insert(
            sender,
            LocalPeer {
                address: src,
                last_seen: self.clock.now_ms(),
            },
        );
        if previous.is_none() {
            tracing::debug!(peer = %sender, %src, "local peer discovered");
            self.peers_manager.add_path(sender, PathKind::LocalNetwork);
        }
        Ok(Vec::new())
    }

    fn on_outbound(&self, to: Address, message: Message) -> Result<Vec<Action>, PipelineError> {
        if let Address::Peer(key) = to {
            if let Some(address) = self.local_address(&key) {
                tracing::trace!(peer = %key, %address, "via local network");
                return Ok(vec![Action::Outbound {
                    to: Address::Socket(address),
                    message,
                }]);
            }
        }
        Ok(vec![Action::Outbound { to, message }])
    }

    fn on_tick(&self) -> Result<Vec<Action>, PipelineError> {
        self.remove_stale(self.clock.now_ms());
        Ok(vec![Action::detached(
            Address::Socket(self.group),
            self.announcement(),
        )])
    }

    fn on_event(&self, event: NodeEvent) -> Result<Vec<Action>, PipelineError> {
        if event.is_shutdown() {
            self.clear();
        }
        Ok(Vec::new())
    }
}
