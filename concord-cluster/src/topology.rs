//! Cluster topology tracking and quorum detection.

use crate::ClusterEventBus;
use concord_core::{ClusterConfig, ClusterEvent, NodeId, QuorumState};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Statistics about topology operations
#[derive(Debug, Default, Clone)]
pub struct TopologyStats {
    pub nodes_added: u64,
    pub nodes_removed: u64,
    pub nodes_down: u64,
    pub quorum_established: u64,
    pub quorum_lost: u64,
}

#[derive(Debug)]
struct TopologyState {
    live: BTreeSet<NodeId>,
    quorum: QuorumState,
    stats: TopologyStats,
}

/// Tracks which nodes are currently reachable and derives the quorum state.
///
/// The live view always contains this node. Quorum is computed over the
/// intersection of the live view and the expected membership, and starts
/// `Disappeared`. Every mutation happens under one lock and its events are
/// published before the lock is released, so subscribers observe a total
/// order in which a quorum transition precedes the topology event that
/// caused it.
pub struct TopologyManager {
    cluster: ClusterConfig,
    state: Mutex<TopologyState>,
    bus: Arc<ClusterEventBus>,
}

impl TopologyManager {
    pub fn new(cluster: ClusterConfig, bus: Arc<ClusterEventBus>) -> Self {
        let mut live = BTreeSet::new();
        live.insert(cluster.self_id);
        Self {
            cluster,
            state: Mutex::new(TopologyState {
                live,
                quorum: QuorumState::Disappeared,
                stats: TopologyStats::default(),
            }),
            bus,
        }
    }

    /// Evaluates the initial quorum state; call once after wiring
    /// subscribers. Meaningful for single-node clusters, where the view
    /// never changes after startup.
    pub fn start(&self) {
        let mut state = self.state.lock();
        self.reconcile_quorum(&mut state);
    }

    /// Marks a peer reachable. New peers raise `NodeAdded`; a quorum
    /// transition is published first.
    pub fn node_up(&self, node_id: NodeId) {
        if !self.cluster.expected.contains(&node_id) {
            warn!("ignoring unexpected node {} reported up", node_id);
            return;
        }
        let mut state = self.state.lock();
        if !state.live.insert(node_id) {
            return;
        }
        state.stats.nodes_added += 1;
        info!("node {} joined the live topology", node_id);
        self.reconcile_quorum(&mut state);
        let topology = snapshot(&state.live);
        self.bus.publish(ClusterEvent::NodeAdded { node_id, topology });
    }

    /// Marks a peer unreachable after missed liveness probes.
    pub fn node_down(&self, node_id: NodeId) {
        if node_id == self.cluster.self_id {
            return;
        }
        let mut state = self.state.lock();
        if !state.live.remove(&node_id) {
            return;
        }
        state.stats.nodes_down += 1;
        warn!("node {} is down", node_id);
        self.reconcile_quorum(&mut state);
        let topology = snapshot(&state.live);
        self.bus.publish(ClusterEvent::NodeDown { node_id, topology });
    }

    /// Removes a peer administratively (disconnect).
    pub fn node_removed(&self, node_id: NodeId) {
        if node_id == self.cluster.self_id {
            return;
        }
        let mut state = self.state.lock();
        if !state.live.remove(&node_id) {
            return;
        }
        state.stats.nodes_removed += 1;
        info!("node {} removed from the live topology", node_id);
        self.reconcile_quorum(&mut state);
        let topology = snapshot(&state.live);
        self.bus
            .publish(ClusterEvent::NodeRemoved { node_id, topology });
    }

    /// Current live topology, ordered, including this node.
    pub fn topology(&self) -> Vec<NodeId> {
        snapshot(&self.state.lock().live)
    }

    pub fn quorum_state(&self) -> QuorumState {
        self.state.lock().quorum
    }

    pub fn has_quorum(&self) -> bool {
        self.quorum_state() == QuorumState::Established
    }

    pub fn stats(&self) -> TopologyStats {
        self.state.lock().stats.clone()
    }

    pub fn quorum_size(&self) -> usize {
        self.cluster.quorum_size
    }

    /// Recomputes the quorum state and publishes the transition, if any,
    /// while still holding the topology lock.
    fn reconcile_quorum(&self, state: &mut TopologyState) {
        let established = self.cluster.has_quorum(state.live.iter());
        let next = if established {
            QuorumState::Established
        } else {
            QuorumState::Disappeared
        };
        if next == state.quorum {
            return;
        }
        state.quorum = next;
        match next {
            QuorumState::Established => {
                state.stats.quorum_established += 1;
                info!(
                    "quorum established ({}/{} expected nodes live)",
                    state.live.iter().filter(|n| self.cluster.expected.contains(*n)).count(),
                    self.cluster.total_nodes()
                );
            }
            QuorumState::Disappeared => {
                state.stats.quorum_lost += 1;
                warn!("quorum disappeared");
            }
        }
        debug!("publishing quorum transition {:?}", next);
        self.bus.publish(ClusterEvent::Quorum(next));
    }
}

fn snapshot(live: &BTreeSet<NodeId>) -> Vec<NodeId> {
    live.iter().copied().collect()
}
