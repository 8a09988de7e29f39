//! Internet discovery: super peers, relaying, and rendezvous.
//!
//! Every heartbeat pings the configured super peers (as children-join
//! pings) and the rendezvous peers that still carry application traffic.
//! Peers without control traffic inside the ping timeout are removed.
//!
//! Routing, in order of preference:
//!
//! 1. the recipient is reachable directly: send to its observed address.
//!    When relaying between two peers this node can reach, and this node
//!    is itself a top-level super peer, also send each side a `Unite`
//!    naming the other's address (at most once per pair and cool-down);
//! 2. own traffic goes to the best super peer, when one is known;
//! 3. otherwise own traffic passes through and relayed traffic is dropped
//!    with `NoRouteToPeer`.
//!
//! Only `Discovery` announcements may leave the recipient unset. Any other
//! unaddressed envelope is refused here.

use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tether_core::config::{Endpoint, RemoteConfig};
use tether_core::{Body, Envelope, Identity, MessageType, Nonce, PublicKey, WireError};

use super::peer::{Peer, Ping};
use crate::clock::SharedClock;
use crate::error::PipelineError;
use crate::peers::{PathKind, SharedPeersManager};
use crate::pipeline::{Action, Address, Message, NodeEvent, Stage};

const MAX_UNITE_ATTEMPTS: usize = 1_000;

pub struct InternetDiscovery {
    identity: Arc<Identity>,
    network_id: i32,
    ping_timeout_ms: u64,
    communication_timeout_ms: u64,
    ping_max_peers: usize,
    unite_min_interval_ms: u64,
    super_peers: Vec<Endpoint>,
    peers_manager: SharedPeersManager,
    clock: SharedClock,

    peers: DashMap<PublicKey, Peer>,
    open_pings: DashMap<Nonce, Ping>,
    unite_attempts: DashMap<(PublicKey, PublicKey), u64>,
    rendezvous: DashSet<PublicKey>,
    best_super_peer: RwLock<Option<PublicKey>>,
}

impl InternetDiscovery {
    pub fn new(
        identity: Arc<Identity>,
        config: &RemoteConfig,
        super_peers: Vec<Endpoint>,
        peers_manager: SharedPeersManager,
        clock: SharedClock,
    ) -> Self {
        Self {
            identity,
            network_id: config.network_id,
            ping_timeout_ms: config.ping_timeout_ms,
            communication_timeout_ms: config.ping_communication_timeout_ms,
            ping_max_peers: config.ping_max_peers,
            unite_min_interval_ms: config.unite_min_interval_ms,
            super_peers,
            peers_manager,
            clock,
            peers: DashMap::new(),
            open_pings: DashMap::new(),
            unite_attempts: DashMap::new(),
            rendezvous: DashSet::new(),
            best_super_peer: RwLock::new(None),
        }
    }

    // ── Inspection ───────────────────────────────────────────────────────────

    pub fn peer(&self, key: &PublicKey) -> Option<Peer> {
        self.peers.get(key).map(|p| *p)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn open_ping_count(&self) -> usize {
        self.open_pings.len()
    }

    pub fn is_rendezvous_peer(&self, key: &PublicKey) -> bool {
        self.rendezvous.contains(key)
    }

    pub fn best_super_peer(&self) -> Option<PublicKey> {
        *self
            .best_super_peer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn is_super_peer(&self, key: &PublicKey) -> bool {
        self.super_peers.iter().any(|e| e.public_key == *key)
    }

    fn envelope(&self, recipient: PublicKey, body: Body) -> Envelope {
        Envelope::new(
            self.network_id,
            self.identity.public_key(),
            self.identity.proof_of_work(),
            recipient,
            body,
        )
    }

    // ── Heartbeat ────────────────────────────────────────────────────────────

    fn heartbeat(&self) -> Vec<Action> {
        let now = self.clock.now_ms();
        self.evict_expired(now);
        self.remove_stale_peers(now);

        let mut actions: Vec<Action> = self
            .super_peers
            .iter()
            .map(|endpoint| self.send_ping(endpoint.public_key, endpoint.address))
            .collect();
        actions.extend(self.ping_rendezvous_peers(now));
        actions
    }

    fn evict_expired(&self, now: u64) {
        self.open_pings
            .retain(|_, ping| now.saturating_sub(ping.sent_ms) < self.ping_timeout_ms);
        self.unite_attempts
            .retain(|_, at| now.saturating_sub(*at) < self.unite_min_interval_ms);
    }

    fn remove_stale_peers(&self, now: u64) {
        let stale: Vec<PublicKey> = self
            .peers
            .iter()
            .filter(|entry| !entry.has_control_traffic(now, self.ping_timeout_ms))
            .map(|entry| *entry.key())
            .collect();
        if stale.is_empty() {
            return;
        }

        let best = self.best_super_peer();
        for key in &stale {
            tracing::debug!(peer = %key, "no control traffic within ping timeout, removing peer");
            self.remove_peer(*key);
        }
        if best.is_some_and(|best| stale.contains(&best)) {
            tracing::info!(peer = ?best, "super peer went stale");
            if let Some(next) = self.determine_best_super_peer() {
                self.peers_manager
                    .add_path_and_super_peer(next, PathKind::Internet);
            }
        }
    }

    fn remove_peer(&self, key: PublicKey) {
        self.peers.remove(&key);
        self.rendezvous.remove(&key);
        if self.is_super_peer(&key) {
            self.peers_manager
                .remove_super_peer_and_path(key, PathKind::Internet);
        } else {
            self.peers_manager
                .remove_children_and_path(key, PathKind::Internet);
        }
    }

    fn ping_rendezvous_peers(&self, now: u64) -> Vec<Action> {
        let keys: Vec<PublicKey> = self.rendezvous.iter().map(|key| *key).collect();
        let mut actions = Vec::new();
        for key in keys {
            let address = self
                .peer(&key)
                .filter(|p| p.has_application_traffic(now, self.communication_timeout_ms))
                .and_then(|p| p.address);
            match address {
                Some(address) => actions.push(self.send_ping(key, address)),
                None => {
                    tracing::debug!(peer = %key, "no application traffic, leaving rendezvous");
                    self.rendezvous.remove(&key);
                    self.peers_manager
                        .remove_children_and_path(key, PathKind::Internet);
                }
            }
        }
        actions
    }

    fn send_ping(&self, recipient: PublicKey, address: SocketAddr) -> Action {
        let now = self.clock.now_ms();
        let children_time = if self.is_super_peer(&recipient) {
            now.max(1)
        } else {
            0
        };
        let ping = self.envelope(recipient, Body::Discovery { children_time });
        self.remember_ping(
            ping.id(),
            Ping {
                recipient,
                address,
                sent_ms: now,
            },
        );
        tracing::trace!(peer = %recipient, %address, "ping");
        Action::detached(Address::Socket(address), ping)
    }

    fn remember_ping(&self, id: Nonce, ping: Ping) {
        if self.open_pings.len() >= self.ping_max_peers {
            let oldest = self
                .open_pings
                .iter()
                .min_by_key(|entry| entry.sent_ms)
                .map(|entry| *entry.key());
            if let Some(oldest) = oldest {
                self.open_pings.remove(&oldest);
            }
        }
        self.open_pings.insert(id, ping);
    }

    fn determine_best_super_peer(&self) -> Option<PublicKey> {
        let now = self.clock.now_ms();
        let best = self
            .super_peers
            .iter()
            .filter_map(|e| {
                let peer = self
                    .peer(&e.public_key)
                    .filter(|p| p.is_reachable(now, self.ping_timeout_ms))?;
                let latency = peer.latency()?;
                Some((latency, e.public_key))
            })
            .min_by_key(|(latency, _)| *latency)
            .map(|(_, key)| key);

        let mut current = self
            .best_super_peer
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if *current != best {
            let old = *current;
            tracing::info!(?old, new = ?best, "best super peer changed");
            *current = best;
        }
        best
    }

    fn best_super_peer_address(&self) -> Option<SocketAddr> {
        self.best_super_peer()
            .and_then(|key| self.peers.get(&key).and_then(|p| p.address))
    }

    // ── Inbound control traffic ──────────────────────────────────────────────

    fn handle_own(&self, src: SocketAddr, envelope: Envelope) -> Result<Vec<Action>, PipelineError> {
        let sender = envelope.sender();
        match envelope.body()?.clone() {
            Body::Discovery { children_time } => Ok(self.handle_ping(src, &envelope, children_time)),
            Body::Acknowledgement { corresponding_id } => {
                self.handle_pong(src, sender, corresponding_id);
                Ok(Vec::new())
            }
            Body::Unite { public_key, address } => Ok(self.handle_unite(sender, public_key, address)),
            Body::Application(_) => Ok(self.handle_application(envelope)),
        }
    }

    fn handle_ping(&self, src: SocketAddr, ping: &Envelope, children_time: u64) -> Vec<Action> {
        let now = self.clock.now_ms();
        let sender = ping.sender();
        let children_join = children_time > 0;
        {
            let mut peer = self.peers.entry(sender).or_default();
            peer.address = Some(src);
            peer.control_traffic_occurred(now);
            if children_join {
                peer.children_ping_occurred(now);
            }
        }
        if children_join {
            self.peers_manager.add_children(sender);
        }

        tracing::trace!(peer = %sender, %src, children_join, "pong");
        let ack = self.envelope(
            sender,
            Body::Acknowledgement {
                corresponding_id: ping.id(),
            },
        );
        vec![Action::detached(Address::Socket(src), ack)]
    }

    fn handle_pong(&self, src: SocketAddr, sender: PublicKey, corresponding_id: Nonce) {
        let Some((_, ping)) = self
            .open_pings
            .remove_if(&corresponding_id, |_, ping| ping.recipient == sender)
        else {
            tracing::trace!(peer = %sender, id = %corresponding_id, "unmatched ack ignored");
            return;
        };

        let now = self.clock.now_ms();
        {
            let mut peer = self.peers.entry(sender).or_default();
            peer.address = Some(src);
            peer.control_traffic_occurred(now);
            peer.pong_occurred(now, ping.sent_ms);
        }

        if self.is_super_peer(&sender) {
            let best = self.determine_best_super_peer();
            tracing::trace!(peer = %sender, latency_ms = now.saturating_sub(ping.sent_ms), "super peer ack");
            if best == Some(sender) {
                self.peers_manager
                    .add_path_and_super_peer(sender, PathKind::Internet);
                return;
            }
        }
        self.peers_manager.add_path(sender, PathKind::Internet);
    }

    fn handle_unite(&self, sender: PublicKey, public_key: PublicKey, address: SocketAddr) -> Vec<Action> {
        if !self.is_super_peer(&sender) {
            tracing::debug!(peer = %sender, "unite from a peer that is not a super peer, ignored");
            return Vec::new();
        }
        if public_key == self.identity.public_key() {
            return Vec::new();
        }

        let now = self.clock.now_ms();
        {
            let mut peer = self.peers.entry(public_key).or_default();
            peer.address = Some(address);
            peer.control_traffic_occurred(now);
            peer.application_traffic_occurred(now);
        }
        self.rendezvous.insert(public_key);
        tracing::debug!(peer = %public_key, %address, "rendezvous");
        vec![self.send_ping(public_key, address)]
    }

    fn handle_application(&self, envelope: Envelope) -> Vec<Action> {
        let sender = envelope.sender();
        if let Some(mut peer) = self.peers.get_mut(&sender) {
            peer.application_traffic_occurred(self.clock.now_ms());
        }
        vec![Action::inbound(Address::Peer(sender), envelope)]
    }

    // ── Routing ──────────────────────────────────────────────────────────────

    /// Send own `envelope` directly or, failing that, via the best super
    /// peer. Gives the envelope back when neither is known.
    fn route_own(&self, envelope: Envelope) -> Result<Vec<Action>, Envelope> {
        let envelope = match self.route_direct(envelope) {
            Ok(actions) => return Ok(actions),
            Err(envelope) => envelope,
        };
        match self.best_super_peer_address() {
            Some(address) => {
                tracing::trace!(peer = %envelope.recipient(), %address, "no direct path, via super peer");
                Ok(vec![Action::outbound(Address::Socket(address), envelope)])
            }
            None => Err(envelope),
        }
    }

    /// Send `envelope` to the recipient's observed address. Gives the
    /// envelope back when the recipient is not reachable.
    fn route_direct(&self, envelope: Envelope) -> Result<Vec<Action>, Envelope> {
        let now = self.clock.now_ms();
        let recipient = envelope.recipient();
        let direct = self
            .peer(&recipient)
            .filter(|p| p.is_reachable(now, self.ping_timeout_ms))
            .and_then(|p| p.address);

        if let Some(address) = direct {
            let sender = envelope.sender();
            tracing::trace!(peer = %recipient, %address, "direct");
            let mut actions = vec![Action::outbound(Address::Socket(address), envelope)];
            actions.extend(self.unite(sender, recipient, address, now));
            return Ok(actions);
        }
        Err(envelope)
    }

    fn unite(&self, sender: PublicKey, recipient: PublicKey, recipient_address: SocketAddr, now: u64) -> Vec<Action> {
        if sender == self.identity.public_key() || self.best_super_peer().is_some() {
            return Vec::new();
        }
        let Some(sender_address) = self.peers.get(&sender).and_then(|p| p.address) else {
            return Vec::new();
        };
        if !self.should_try_unite(sender, recipient, now) {
            return Vec::new();
        }

        tracing::debug!(%sender, %recipient, "uniting peers");
        vec![
            Action::detached(
                Address::Socket(sender_address),
                self.envelope(
                    sender,
                    Body::Unite {
                        public_key: recipient,
                        address: recipient_address,
                    },
                ),
            ),
            Action::detached(
                Address::Socket(recipient_address),
                self.envelope(
                    recipient,
                    Body::Unite {
                        public_key: sender,
                        address: sender_address,
                    },
                ),
            ),
        ]
    }

    fn should_try_unite(&self, a: PublicKey, b: PublicKey, now: u64) -> bool {
        if self.unite_min_interval_ms == 0 {
            return false;
        }
        if self.unite_attempts.len() >= MAX_UNITE_ATTEMPTS {
            self.unite_attempts
                .retain(|_, at| now.saturating_sub(*at) < self.unite_min_interval_ms);
            if self.unite_attempts.len() >= MAX_UNITE_ATTEMPTS {
                return false;
            }
        }

        let pair = if a < b { (a, b) } else { (b, a) };
        match self.unite_attempts.entry(pair) {
            Entry::Occupied(mut at) => {
                if now.saturating_sub(*at.get()) < self.unite_min_interval_ms {
                    return false;
                }
                at.insert(now);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    fn clear(&self) {
        self.open_pings.clear();
        self.unite_attempts.clear();
        let keys: Vec<PublicKey> = self.peers.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            self.remove_peer(key);
        }
        self.rendezvous.clear();
        *self
            .best_super_peer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl Stage for InternetDiscovery {
    fn name(&self) -> &'static str {
        "internet-discovery"
    }

    fn on_inbound(&self, from: Address, message: Message) -> Result<Vec<Action>, PipelineError> {
        let Address::Socket(src) = from else {
            return Ok(vec![Action::Inbound { from, message }]);
        };
        let envelope = match message {
            Message::Envelope(envelope) => envelope,
            other => return Ok(vec![Action::Inbound { from, message: other }]),
        };
        if envelope.recipient().is_none() {
            // only announcements go unaddressed
            if matches!(envelope.message_type(), Ok(MessageType::Discovery)) {
                return Ok(vec![Action::inbound(from, envelope)]);
            }
            tracing::debug!(%src, peer = %envelope.sender(), "unaddressed message, dropped");
            return Err(WireError::InvalidMessageFormat("message without recipient".to_string()).into());
        }

        let recipient = envelope.recipient();
        if recipient == self.identity.public_key() {
            return self.handle_own(src, envelope);
        }

        let sender = envelope.sender();
        self.route_direct(envelope).map_err(|_| {
            tracing::debug!(peer = %recipient, %sender, "no route for relayed message, dropped");
            PipelineError::NoRouteToPeer(recipient)
        })
    }

    fn on_outbound(&self, to: Address, message: Message) -> Result<Vec<Action>, PipelineError> {
        match (to, message) {
            (Address::Peer(recipient), Message::Envelope(envelope)) => {
                let is_application = matches!(envelope.message_type(), Ok(MessageType::Application));
                if is_application && self.rendezvous.contains(&recipient) {
                    if let Some(mut peer) = self.peers.get_mut(&recipient) {
                        peer.application_traffic_occurred(self.clock.now_ms());
                    }
                }
                match self.route_own(envelope) {
                    Ok(actions) => Ok(actions),
                    Err(envelope) => {
                        tracing::trace!(peer = %recipient, "no path known, passing through");
                        Ok(vec![Action::outbound(to, envelope)])
                    }
                }
            }
            (to, message) => Ok(vec![Action::Outbound { to, message }]),
        }
    }

    fn on_tick(&self) -> Result<Vec<Action>, PipelineError> {
        Ok(self.heartbeat())
    }

    fn on_event(&self, event: NodeEvent) -> Result<Vec<Action>, PipelineError> {
        if event.is_shutdown() {
            self.clear();
        }
        Ok(Vec::new())
    }
}
