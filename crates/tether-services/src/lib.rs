//! tether-services: the node's message stack.
//!
//! Inbound frames climb a fixed chain of stages from the transport to the
//! application; outbound messages descend it. See [`node::Node`] for how
//! the chain is assembled.

pub mod arm;
pub mod chunking;
pub mod clock;
pub mod codec;
pub mod discovery;
pub mod error;
pub mod filters;
pub mod node;
pub mod peers;
pub mod pipeline;
pub mod rate_limit;
pub mod transport;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::PipelineError;
pub use node::{Node, NodeHandles};
pub use peers::{PathKind, PeerRegistry, PeersManager, SharedPeersManager};
pub use pipeline::{Address, Delivery, Message, NodeEvent, Outgoing};
pub use transport::{SendWorker, Transport, TransportError};
