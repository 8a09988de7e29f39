//! tether-core: wire format, identity, arming crypto, and configuration.
//! All other tether crates depend on this one.

pub mod config;
pub mod crypto;
pub mod envelope;
pub mod identity;
pub mod wire;

pub use envelope::{Body, Envelope};
pub use identity::Identity;
pub use wire::{MessageType, Nonce, ProofOfWork, PublicKey, WireError};
