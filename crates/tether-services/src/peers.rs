//! Peer manager: which peers this node has a path to, and how.
//!
//! Discovery stages report paths here. A peer can be known over several
//! paths at once (internet rendezvous, local network, static route) and
//! disappears once its last path is removed.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use dashmap::{DashMap, DashSet};
use tether_core::PublicKey;

/// How a path to a peer was learned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathKind {
    Internet,
    LocalNetwork,
    Static,
}

/// Collaborator that discovery stages report path changes to.
pub trait PeersManager: Send + Sync {
    fn add_path(&self, key: PublicKey, path: PathKind);

    /// Add the path and make `key` this node's super peer.
    fn add_path_and_super_peer(&self, key: PublicKey, path: PathKind);

    fn remove_path(&self, key: PublicKey, path: PathKind);

    /// Remove the path and forget `key` as a child of this node.
    fn remove_children_and_path(&self, key: PublicKey, path: PathKind);

    /// Remove the path and, if `key` is the current super peer, unset it.
    fn remove_super_peer_and_path(&self, key: PublicKey, path: PathKind);

    fn super_peer_key(&self) -> Option<PublicKey>;

    /// Record `key` as a child: it joined this node as its super peer.
    /// Registers no path.
    fn add_children(&self, key: PublicKey);
}

pub type SharedPeersManager = Arc<dyn PeersManager>;

/// In-memory peer manager.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    paths: Arc<DashMap<PublicKey, HashSet<PathKind>>>,
    children: Arc<DashSet<PublicKey>>,
    super_peer: Arc<RwLock<Option<PublicKey>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paths(&self, key: &PublicKey) -> Vec<PathKind> {
        self.paths
            .get(key)
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_path(&self, key: &PublicKey, path: PathKind) -> bool {
        self.paths.get(key).is_some_and(|p| p.contains(&path))
    }

    pub fn is_child(&self, key: &PublicKey) -> bool {
        self.children.contains(key)
    }

    /// Number of peers with at least one path.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    fn insert_path(&self, key: PublicKey, path: PathKind) {
        let added = self.paths.entry(key).or_default().insert(path);
        if added {
            tracing::info!(peer = %key, ?path, "path to peer added");
        }
    }

    fn drop_path(&self, key: PublicKey, path: PathKind) {
        let now_empty = match self.paths.get_mut(&key) {
            Some(mut paths) => {
                if paths.remove(&path) {
                    tracing::info!(peer = %key, ?path, "path to peer removed");
                }
                paths.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.paths.remove_if(&key, |_, p| p.is_empty());
        }
    }
}

impl PeersManager for PeerRegistry {
    fn add_path(&self, key: PublicKey, path: PathKind) {
        self.insert_path(key, path);
    }

    fn add_path_and_super_peer(&self, key: PublicKey, path: PathKind) {
        self.insert_path(key, path);
        let mut super_peer = self.super_peer.write().unwrap_or_else(PoisonError::into_inner);
        if *super_peer != Some(key) {
            tracing::info!(peer = %key, "super peer selected");
            *super_peer = Some(key);
        }
    }

    fn remove_path(&self, key: PublicKey, path: PathKind) {
        self.drop_path(key, path);
    }

    fn remove_children_and_path(&self, key: PublicKey, path: PathKind) {
        self.children.remove(&key);
        self.drop_path(key, path);
    }

    fn remove_super_peer_and_path(&self, key: PublicKey, path: PathKind) {
        {
            let mut super_peer = self.super_peer.write().unwrap_or_else(PoisonError::into_inner);
            if *super_peer == Some(key) {
                tracing::info!(peer = %key, "super peer unset");
                *super_peer = None;
            }
        }
        self.drop_path(key, path);
    }

    fn super_peer_key(&self) -> Option<PublicKey> {
        *self.super_peer.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn add_children(&self, key: PublicKey) {
        if self.children.insert(key) {
            tracing::debug!(peer = %key, "child joined");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: PublicKey = PublicKey([0xaa; 32]);
    const B: PublicKey = PublicKey([0xbb; 32]);

    #[test]
    fn peer_disappears_with_last_path() {
        let registry = PeerRegistry::new();
        registry.add_path(A, PathKind::Internet);
        registry.add_path(A, PathKind::LocalNetwork);
        assert_eq!(registry.len(), 1);

        registry.remove_path(A, PathKind::Internet);
        assert!(registry.has_path(&A, PathKind::LocalNetwork));
        registry.remove_path(A, PathKind::LocalNetwork);
        assert!(registry.is_empty());
    }

    #[test]
    fn super_peer_follows_add_and_remove() {
        let registry = PeerRegistry::new();
        registry.add_path_and_super_peer(A, PathKind::Internet);
        assert_eq!(registry.super_peer_key(), Some(A));

        // removing another peer leaves the super peer alone
        registry.add_path(B, PathKind::Internet);
        registry.remove_super_peer_and_path(B, PathKind::Internet);
        assert_eq!(registry.super_peer_key(), Some(A));

        registry.remove_super_peer_and_path(A, PathKind::Internet);
        assert_eq!(registry.super_peer_key(), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_children_forgets_child() {
        let registry = PeerRegistry::new();
        registry.add_children(B);
        assert!(registry.is_child(&B));
        registry.add_path(B, PathKind::Internet);
        registry.remove_children_and_path(B, PathKind::Internet);
        assert!(!registry.is_child(&B));
        assert!(registry.paths(&B).is_empty());
    }

    #[test]
    fn removing_unknown_path_is_a_no_op() {
        let registry = PeerRegistry::new();
        registry.remove_path(A, PathKind::Static);
        assert!(registry.is_empty());
    }
}
