//! Frame codec: raw datagrams below, envelopes above.

use tether_core::Envelope;

use crate::error::PipelineError;
use crate::pipeline::{Action, Address, Message, Stage};

/// Parses the public header of every inbound frame and serializes every
/// outbound envelope. Private headers stay undecoded until a stage asks.
pub struct WireCodec;

impl Stage for WireCodec {
    fn name(&self) -> &'static str {
        "wire-codec"
    }

    fn on_inbound(&self, from: Address, message: Message) -> Result<Vec<Action>, PipelineError> {
        let envelope = match message {
            Message::Bytes(bytes) => Envelope::decode(bytes).map_err(|e| {
                tracing::debug!(%from, error = %e, "malformed frame dropped");
                e
            })?,
            Message::Envelope(envelope) => envelope,
        };
        Ok(vec![Action::inbound(from, envelope)])
    }

    fn on_outbound(&self, to: Address, message: Message) -> Result<Vec<Action>, PipelineError> {
        let bytes = match message {
            Message::Envelope(envelope) => envelope.encode(),
            Message::Bytes(bytes) => bytes,
        };
        Ok(vec![Action::Outbound {
            to,
            message: Message::Bytes(bytes),
        }])
    }
}
