//! Fixed routes from configuration.

use tether_core::config::Endpoint;

use crate::error::PipelineError;
use crate::peers::{PathKind, SharedPeersManager};
use crate::pipeline::{Action, Address, Message, NodeEvent, Stage};

/// Routes traffic for configured keys to fixed addresses. The routes are
/// registered as `Static` paths while the node is up.
pub struct StaticRoutes {
    routes: Vec<Endpoint>,
    peers_manager: SharedPeersManager,
}

impl StaticRoutes {
    pub fn new(routes: Vec<Endpoint>, peers_manager: SharedPeersManager) -> Self {
        Self {
            routes,
            peers_manager,
        }
    }
}

impl Stage for StaticRoutes {
    fn name(&self) -> &'static str {
        "static-routes"
    }

    fn on_outbound(&self, to: Address, message: Message) -> Result<Vec<Action>, PipelineError> {
        let to = match to {
            Address::Peer(key) => self
                .routes
                .iter()
                .find(|route| route.public_key == key)
                .map_or(to, |route| Address::Socket(route.address)),
            socket => socket,
        };
        Ok(vec![Action::Outbound { to, message }])
    }

    fn on_event(&self, event: NodeEvent) -> Result<Vec<Action>, PipelineError> {
        for route in &self.routes {
            match event {
                NodeEvent::NodeUp => {
                    tracing::debug!(peer = %route.public_key, address = %route.address, "static route");
                    self.peers_manager.add_path(route.public_key, PathKind::Static);
                }
                NodeEvent::NodeDown | NodeEvent::UnrecoverableError => {
                    self.peers_manager.remove_path(route.public_key, PathKind::Static)
                }
            }
        }
        Ok(Vec::new())
    }
}
