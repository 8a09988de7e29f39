//! Discovery table entries.

use std::net::SocketAddr;

use tether_core::PublicKey;

/// What discovery knows about one peer. All times are clock milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Peer {
    pub address: Option<SocketAddr>,
    pub last_control: Option<u64>,
    pub last_pong: Option<u64>,
    pub last_application: Option<u64>,
    pub last_outbound_ping: Option<u64>,
}

impl Peer {
    pub fn control_traffic_occurred(&mut self, now: u64) {
        self.last_control = Some(now);
    }

    pub fn application_traffic_occurred(&mut self, now: u64) {
        self.last_application = Some(now);
    }

    /// An ack for a ping sent at `ping_sent`.
    pub fn pong_occurred(&mut self, now: u64, ping_sent: u64) {
        self.last_pong = Some(now);
        self.last_outbound_ping = Some(self.last_outbound_ping.map_or(ping_sent, |t| t.max(ping_sent)));
    }

    /// A children-join ping counts like a pong: the child is reachable.
    pub fn children_ping_occurred(&mut self, now: u64) {
        self.last_pong = Some(now);
    }

    pub fn has_control_traffic(&self, now: u64, ping_timeout_ms: u64) -> bool {
        within(self.last_control, now, ping_timeout_ms)
    }

    pub fn has_application_traffic(&self, now: u64, communication_timeout_ms: u64) -> bool {
        within(self.last_application, now, communication_timeout_ms)
    }

    pub fn is_reachable(&self, now: u64, ping_timeout_ms: u64) -> bool {
        self.address.is_some() && within(self.last_pong, now, ping_timeout_ms)
    }

    /// Round trip of the latest answered ping. `None` until the first pong.
    pub fn latency(&self) -> Option<u64> {
        match (self.last_pong, self.last_outbound_ping) {
            (Some(pong), Some(ping)) => Some(pong.saturating_sub(ping)),
            _ => None,
        }
    }
}

fn within(at: Option<u64>, now: u64, timeout_ms: u64) -> bool {
    at.is_some_and(|t| now.saturating_sub(t) <= timeout_ms)
}

/// An outstanding Discovery ping, keyed by its message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub recipient: PublicKey,
    pub address: SocketAddr,
    pub sent_ms: u64,
}
