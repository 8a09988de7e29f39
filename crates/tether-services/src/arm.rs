//! End-to-end arming. Messages this node originates are armed on the way
//! out; messages addressed to this node are disarmed on the way in.
//! Everything else is relay traffic and passes untouched.

use std::sync::Arc;

use tether_core::crypto::{self, CryptoError};
use tether_core::{Envelope, Identity};

use crate::error::PipelineError;
use crate::pipeline::{Action, Address, Message, Stage};

pub struct ArmStage {
    identity: Arc<Identity>,
    enabled: bool,
}

impl ArmStage {
    pub fn new(identity: Arc<Identity>, enabled: bool) -> Self {
        Self { identity, enabled }
    }

    fn disarm(&self, envelope: Envelope) -> Result<Envelope, PipelineError> {
        if envelope.is_armed() {
            return Ok(crypto::disarm(envelope, self.identity.keypair())?);
        }
        if self.enabled {
            return Err(CryptoError::DisarmingFailed("message is not armed").into());
        }
        Ok(envelope)
    }
}

impl Stage for ArmStage {
    fn name(&self) -> &'static str {
        "arm"
    }

    fn on_inbound(&self, from: Address, message: Message) -> Result<Vec<Action>, PipelineError> {
        let message = match message {
            Message::Envelope(envelope)
                if envelope.recipient() == self.identity.public_key() && !envelope.is_chunk() =>
            {
                let sender = envelope.sender();
                let disarmed = self.disarm(envelope).map_err(|e| {
                    tracing::debug!(%from, peer = %sender, error = %e, "disarming failed");
                    e
                })?;
                Message::Envelope(disarmed)
            }
            other => other,
        };
        Ok(vec![Action::Inbound { from, message }])
    }

    fn on_outbound(&self, to: Address, message: Message) -> Result<Vec<Action>, PipelineError> {
        let message = match message {
            Message::Envelope(envelope)
                if self.enabled
                    && envelope.sender() == self.identity.public_key()
                    && !envelope.recipient().is_none()
                    && !envelope.is_armed()
                    && !envelope.is_chunk() =>
            {
                Message::Envelope(crypto::arm(envelope, self.identity.keypair())?)
            }
            other => other,
        };
        Ok(vec![Action::Outbound { to, message }])
    }
}
