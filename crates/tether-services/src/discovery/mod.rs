//! Discovery stages: internet rendezvous, local network multicast and
//! static routes. Each reports the paths it learns to the peer manager.

mod internet;
mod local;
mod peer;
mod static_routes;

pub use internet::InternetDiscovery;
pub use local::LocalNetworkDiscovery;
pub use peer::{Peer, Ping};
pub use static_routes::StaticRoutes;
