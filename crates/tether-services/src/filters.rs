//! Admission filters and the hop-count guard.
//!
//! The network and proof-of-work filters read only the public header, so
//! they run on every inbound frame, chunks and relayed traffic included.
//! Rejections are dropped by the caller without a reply.

use crate::error::PipelineError;
use crate::pipeline::{Action, Address, Message, Stage};

// ── Network Filter ────────────────────────────────────────────────────────────

/// Drops traffic from other overlays sharing the same transport.
pub struct OtherNetworkFilter {
    network_id: i32,
}

impl OtherNetworkFilter {
    pub fn new(network_id: i32) -> Self {
        Self { network_id }
    }
}

impl Stage for OtherNetworkFilter {
    fn name(&self) -> &'static str {
        "other-network-filter"
    }

    fn on_inbound(&self, from: Address, message: Message) -> Result<Vec<Action>, PipelineError> {
        if let Some(envelope) = message.envelope() {
            if envelope.network_id() != self.network_id {
                tracing::debug!(%from, network_id = envelope.network_id(), "message from other network dropped");
                return Err(PipelineError::OtherNetwork(envelope.network_id()));
            }
        }
        Ok(vec![Action::Inbound { from, message }])
    }
}

// ── Proof of Work Filter ──────────────────────────────────────────────────────

pub struct ProofOfWorkFilter {
    difficulty: u8,
}

impl ProofOfWorkFilter {
    pub fn new(difficulty: u8) -> Self {
        Self { difficulty }
    }
}

impl Stage for ProofOfWorkFilter {
    fn name(&self) -> &'static str {
        "proof-of-work-filter"
    }

    fn on_inbound(&self, from: Address, message: Message) -> Result<Vec<Action>, PipelineError> {
        if let Some(envelope) = message.envelope() {
            let sender = envelope.sender();
            if !envelope.proof_of_work().is_valid(&sender, self.difficulty) {
                tracing::debug!(%from, peer = %sender, "invalid proof of work, dropped");
                return Err(PipelineError::InvalidProofOfWork(sender));
            }
        }
        Ok(vec![Action::Inbound { from, message }])
    }
}

// ── Hop Count Guard ───────────────────────────────────────────────────────────

/// Bounds how often a message can be forwarded. Applies on the way out,
/// to originated and relayed traffic alike.
pub struct HopCountGuard {
    limit: u8,
}

impl HopCountGuard {
    pub fn new(limit: u8) -> Self {
        Self { limit }
    }
}

impl Stage for HopCountGuard {
    fn name(&self) -> &'static str {
        "hop-count-guard"
    }

    fn on_outbound(&self, to: Address, message: Message) -> Result<Vec<Action>, PipelineError> {
        let message = match message {
            Message::Envelope(envelope) => {
                if envelope.hop_count() >= self.limit {
                    tracing::debug!(%to, hop_count = envelope.hop_count(), "hop limit reached, dropped");
                    return Err(PipelineError::HopLimitExceeded(envelope.hop_count()));
                }
                Message::Envelope(envelope.increment_hop_count())
            }
            bytes => bytes,
        };
        Ok(vec![Action::Outbound { to, message }])
    }
}
