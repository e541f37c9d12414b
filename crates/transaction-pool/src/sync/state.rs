//! Peer membership state shared between the pool and the sync engine.

use grove_primitives::NodeId;
use parking_lot::RwLock;
use std::collections::HashSet;

/// Node lists the sync engine selects peers from.
///
/// Consensus, observer and connected lists are pushed in by the node's
/// membership and discovery services; readers copy the sets out under a
/// short lock to keep multithreading issues away.
#[derive(Debug)]
pub struct SyncPeers {
    node_id: NodeId,
    connected: RwLock<HashSet<NodeId>>,
    consensus: RwLock<Vec<NodeId>>,
    observers: RwLock<Vec<NodeId>>,
    /// Union of consensus and observer members.
    members: RwLock<HashSet<NodeId>>,
}

impl SyncPeers {
    /// Creates the state for the local node.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            connected: RwLock::new(HashSet::new()),
            consensus: RwLock::new(Vec::new()),
            observers: RwLock::new(Vec::new()),
            members: RwLock::new(HashSet::new()),
        }
    }

    /// The local node id.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The currently connected peers.
    pub fn connected(&self) -> HashSet<NodeId> {
        self.connected.read().clone()
    }

    /// Replaces the connected peer set.
    pub fn set_connected(&self, nodes: HashSet<NodeId>) {
        *self.connected.write() = nodes;
    }

    /// The consensus member list.
    pub fn consensus_node_list(&self) -> Vec<NodeId> {
        self.consensus.read().clone()
    }

    /// The observer member list.
    pub fn observer_node_list(&self) -> Vec<NodeId> {
        self.observers.read().clone()
    }

    /// Replaces the consensus member list.
    pub fn set_consensus_node_list(&self, nodes: Vec<NodeId>) {
        *self.consensus.write() = nodes;
        self.update_members();
    }

    /// Replaces the observer member list.
    pub fn set_observer_node_list(&self, nodes: Vec<NodeId>) {
        *self.observers.write() = nodes;
        self.update_members();
    }

    /// Whether the local node is a consensus or observer member of the
    /// group.
    pub fn exists_in_group(&self) -> bool {
        self.members.read().contains(&self.node_id)
    }

    fn update_members(&self) {
        let mut members: HashSet<NodeId> = self.consensus.read().iter().copied().collect();
        members.extend(self.observers.read().iter().copied());
        *self.members.write() = members;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_membership_follows_both_lists() {
        let me = NodeId::repeat_byte(1);
        let other = NodeId::repeat_byte(2);
        let peers = SyncPeers::new(me);
        assert!(!peers.exists_in_group());

        peers.set_consensus_node_list(vec![other, me]);
        assert!(peers.exists_in_group());

        peers.set_consensus_node_list(vec![other]);
        assert!(!peers.exists_in_group());

        peers.set_observer_node_list(vec![me]);
        assert!(peers.exists_in_group());
    }
}
