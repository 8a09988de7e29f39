//! Per-message pipeline errors.
//!
//! Every error here is isolated to the message that raised it. The chain
//! keeps running and other in-flight messages are unaffected.

use tether_core::crypto::CryptoError;
use tether_core::{MessageType, PublicKey, WireError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("message too large: {size} bytes exceeds {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("no route to peer {0}")]
    NoRouteToPeer(PublicKey),

    #[error("rate limited: {message_type:?} from {sender}")]
    RateLimited {
        message_type: MessageType,
        sender: PublicKey,
    },

    #[error("invalid proof of work from {0}")]
    InvalidProofOfWork(PublicKey),

    #[error("message from other network {0}")]
    OtherNetwork(i32),

    #[error("hop limit exceeded at hop count {0}")]
    HopLimitExceeded(u8),

    #[error("node is not running")]
    Stopped,
}

impl PipelineError {
    /// Admission rejections are dropped silently, without a reply.
    pub fn is_admission_rejection(&self) -> bool {
        matches!(
            self,
            PipelineError::RateLimited { .. }
                | PipelineError::InvalidProofOfWork(_)
                | PipelineError::OtherNetwork(_)
        )
    }
}
