//! Cluster membership boundary.
//!
//! Failure detection and gossip live outside Kestrel. Routing only needs to
//! know who this node is and which nodes are currently alive.

use std::collections::BTreeSet;

use kestrel_common::NodeId;
use parking_lot::RwLock;

/// Source of the live node set.
pub trait Membership: Send + Sync {
    fn local_node(&self) -> NodeId;

    /// Every live node, this one included.
    fn live_nodes(&self) -> Vec<NodeId>;
}

/// Membership maintained by explicit join and leave calls.
#[derive(Debug)]
pub struct StaticMembership {
    local: NodeId,
    nodes: RwLock<BTreeSet<NodeId>>,
}

impl StaticMembership {
    /// Creates a membership of `local` plus `peers`.
    pub fn new(local: NodeId, peers: impl IntoIterator<Item = NodeId>) -> Self {
        let mut nodes: BTreeSet<NodeId> = peers.into_iter().collect();
        nodes.insert(local);
        Self {
            local,
            nodes: RwLock::new(nodes),
        }
    }

    /// Adds `node`. Returns false if it was already live.
    pub fn join(&self, node: NodeId) -> bool {
        self.nodes.write().insert(node)
    }

    /// Removes `node`. The local node cannot leave its own view.
    pub fn leave(&self, node: NodeId) -> bool {
        node != self.local && self.nodes.write().remove(&node)
    }
}

impl Membership for StaticMembership {
    fn local_node(&self) -> NodeId {
        self.local
    }

    fn live_nodes(&self) -> Vec<NodeId> {
        self.nodes.read().iter().copied().collect()
    }
}
