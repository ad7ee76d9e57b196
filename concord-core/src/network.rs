use crate::messages::ProtocolMessage;
use crate::{ConsensusError, NodeId, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::net::SocketAddr;

/// Static description of the expected cluster membership.
///
/// Quorum size is computed against the expected membership, never against
/// the live topology, so the protocol cannot make progress on a minority
/// partition. Membership is fixed for the lifetime of a run.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub self_id: NodeId,
    pub expected: BTreeSet<NodeId>,
    pub quorum_size: usize,
}

impl ClusterConfig {
    /// Builds and validates the cluster description.
    ///
    /// Fails when the expected membership is empty or does not contain this
    /// node; such configuration errors are fatal at startup.
    pub fn new(self_id: NodeId, expected: impl IntoIterator<Item = NodeId>) -> Result<Self> {
        let expected: BTreeSet<NodeId> = expected.into_iter().collect();
        if expected.is_empty() {
            return Err(ConsensusError::invalid_config("expected cluster is empty"));
        }
        if !expected.contains(&self_id) {
            return Err(ConsensusError::invalid_config(format!(
                "self node {} is not part of the expected cluster",
                self_id
            )));
        }
        let quorum_size = expected.len() / 2 + 1;
        Ok(Self {
            self_id,
            expected,
            quorum_size,
        })
    }

    /// True when the given live view intersects the expected membership in
    /// at least quorum-many nodes.
    pub fn has_quorum<'a>(&self, live: impl IntoIterator<Item = &'a NodeId>) -> bool {
        live.into_iter().filter(|n| self.expected.contains(*n)).count() >= self.quorum_size
    }

    pub fn is_majority(&self, count: usize) -> bool {
        count >= self.quorum_size
    }

    pub fn total_nodes(&self) -> usize {
        self.expected.len()
    }

    /// Expected peers, excluding this node.
    pub fn peers(&self) -> impl Iterator<Item = &NodeId> {
        self.expected.iter().filter(move |n| **n != self.self_id)
    }
}

/// Whether enough of the expected cluster is reachable for progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumState {
    Established,
    Disappeared,
}

/// Topology and quorum notifications, serialized per subscriber.
///
/// A quorum transition caused by a topology change is emitted before the
/// topology event itself, so subscribers reacting to a node event already
/// observe the post-transition quorum state.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    NodeAdded {
        node_id: NodeId,
        topology: Vec<NodeId>,
    },
    NodeRemoved {
        node_id: NodeId,
        topology: Vec<NodeId>,
    },
    NodeDown {
        node_id: NodeId,
        topology: Vec<NodeId>,
    },
    Quorum(QuorumState),
}

/// Directed, best-effort, unordered, loss-tolerant message channel between
/// named nodes.
///
/// `send_to` and `broadcast` never surface transport errors: delivery
/// failures are logged and dropped, and the protocol's retry behavior is
/// the recovery path. Inbound protocol messages are pushed into a single
/// dispatcher channel owned by the consumer; `Ping` is answered inside the
/// transport and `Pong` arrivals feed the liveness detector instead.
#[async_trait]
pub trait ClusterNetwork: Send + Sync {
    /// Delivers `message` to `target` if reachable; failures are dropped.
    async fn send_to(&self, target: NodeId, message: ProtocolMessage);

    /// Delivers `message` to every connected peer; per-peer failures are
    /// dropped.
    async fn broadcast(&self, message: ProtocolMessage);

    /// Adds a peer at `addr` to the peer set.
    async fn connect(&self, addr: SocketAddr) -> Result<()>;

    /// Removes a peer from the peer set.
    async fn disconnect(&self, node_id: NodeId) -> Result<()>;

    /// Currently connected peers.
    async fn list_nodes(&self) -> Vec<NodeId>;

    /// Starts the transport; idempotent.
    async fn start(&self) -> Result<()>;

    /// Stops the transport; idempotent.
    async fn stop(&self) -> Result<()>;
}

/// Submission of application commands into the consensus pipeline.
///
/// Implemented by the engine handle; lets collaborators (such as the
/// consensus-routed leader election) feed proposals without depending on
/// the engine crate.
#[async_trait]
pub trait CommandSubmitter: Send + Sync {
    /// Enqueues commands for batching and proposal. Fails when consensus is
    /// not ready to accept proposals (no quorum, shutting down).
    async fn submit(&self, commands: Vec<crate::Command>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_of(n: u64) -> ClusterConfig {
        ClusterConfig::new(NodeId::from(1u64), (1..=n).map(NodeId::from)).unwrap()
    }

    #[test]
    fn quorum_size_is_majority_of_expected() {
        assert_eq!(cluster_of(3).quorum_size, 2);
        assert_eq!(cluster_of(4).quorum_size, 3);
        assert_eq!(cluster_of(5).quorum_size, 3);
    }

    #[test]
    fn quorum_counts_only_expected_members() {
        let config = cluster_of(3);
        let stranger = NodeId::from(99u64);
        let live = vec![NodeId::from(1u64), stranger];
        assert!(!config.has_quorum(&live));

        let live = vec![NodeId::from(1u64), NodeId::from(2u64), stranger];
        assert!(config.has_quorum(&live));
    }

    #[test]
    fn rejects_empty_and_foreign_configurations() {
        assert!(ClusterConfig::new(NodeId::from(1u64), []).is_err());
        assert!(ClusterConfig::new(NodeId::from(9u64), (1..=3u64).map(NodeId::from)).is_err());
    }

    #[test]
    fn peers_excludes_self() {
        let config = cluster_of(3);
        let peers: Vec<NodeId> = config.peers().copied().collect();
        assert_eq!(peers, vec![NodeId::from(2u64), NodeId::from(3u64)]);
    }
}
