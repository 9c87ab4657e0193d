//! Rendezvous (highest random weight) routing.
//!
//! Every live node scores a key with a hash seeded by the node's id; the
//! highest score owns the key. When a node leaves, only the keys it owned
//! move. Ties go to the larger node id.

use std::sync::Arc;

use kestrel_common::NodeId;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::membership::Membership;

/// Score of `node` for `key`.
pub fn score(key: &[u8], node: NodeId) -> u64 {
    xxh3_64_with_seed(key, node.0)
}

/// Maps keys to their owning node.
#[derive(Clone)]
pub struct RendezvousRouter {
    membership: Arc<dyn Membership>,
}

impl RendezvousRouter {
    pub fn new(membership: Arc<dyn Membership>) -> Self {
        Self { membership }
    }

    pub fn local_node(&self) -> NodeId {
        self.membership.local_node()
    }

    /// Owner of `key` among the live nodes, or None if no node is live.
    pub fn owner(&self, key: &[u8]) -> Option<NodeId> {
        self.membership
            .live_nodes()
            .into_iter()
            .max_by_key(|node| (score(key, *node), *node))
    }

    /// True if this node owns `key`.
    pub fn is_local(&self, key: &[u8]) -> bool {
        self.owner(key) == Some(self.local_node())
    }
}

impl std::fmt::Debug for RendezvousRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendezvousRouter")
            .field("local", &self.local_node())
            .finish()
    }
}
