//! Leader management: naming a single proposal-submitting node per view.
//!
//! Two election modes exist. Local election is deterministic and publishes
//! synchronously from the notification task; consensus-routed election has
//! only the deterministic candidate submit a tagged leader proposal through
//! the consensus pipeline and publishes when the commit is observed.

use crate::{ClusterError, ClusterResult, LeaderChange, LeaderChangeBus};
use concord_core::{
    Batch, ClusterConfig, ClusterEvent, Command, CommandSubmitter, NodeId, QuorumState,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// How the leader role is assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionMode {
    /// Every node computes the minimum live NodeId locally.
    Local,
    /// The deterministic candidate routes its claim through consensus.
    Consensus,
}

/// Configuration for the leader manager.
#[derive(Debug, Clone)]
pub struct LeaderConfig {
    pub mode: ElectionMode,
    /// Delay before re-submitting a failed leader proposal.
    pub proposal_retry_delay: Duration,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            mode: ElectionMode::Local,
            proposal_retry_delay: Duration::from_millis(500),
        }
    }
}

/// A leadership claim carried as an ordinary consensus command.
///
/// The command payload is a tag followed by the binary encoding, so the
/// commit observer can pick leader proposals out of arbitrary batches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LeaderProposal {
    pub candidate: NodeId,
    pub view_sequence: u64,
}

const LEADER_PROPOSAL_TAG: &[u8; 4] = b"LDR1";

impl LeaderProposal {
    pub fn to_command(&self) -> Command {
        let mut data = LEADER_PROPOSAL_TAG.to_vec();
        data.extend(bincode::serialize(self).expect("leader proposal serializes"));
        Command::new(data)
    }

    pub fn from_command(command: &Command) -> Option<Self> {
        let payload = command.data.strip_prefix(LEADER_PROPOSAL_TAG.as_slice())?;
        bincode::deserialize(payload).ok()
    }
}

/// Statistics about leader management operations
#[derive(Debug, Default, Clone)]
pub struct LeaderStats {
    pub elections: u64,
    pub submissions: u64,
    pub retries: u64,
    pub stale_commits: u64,
    pub changes_published: u64,
}

/// The leader picture, mutated as one atomic unit.
#[derive(Debug)]
struct LeaderInner {
    current_leader: Option<NodeId>,
    view_sequence: u64,
    needs_reactivation: bool,
    topology: Vec<NodeId>,
    has_quorum: bool,
}

/// Assigns the proposer role from topology changes.
///
/// `(current_leader, view_sequence)` behaves as one atomic tuple: all
/// updates happen under a single lock. The `in_flight` flag deduplicates
/// concurrent proposal submissions and is cleared on commit or failure.
pub struct LeaderManager {
    cluster: ClusterConfig,
    config: LeaderConfig,
    submitter: Option<Arc<dyn CommandSubmitter>>,
    state: Mutex<LeaderInner>,
    in_flight: AtomicBool,
    changes: LeaderChangeBus,
    stats: Mutex<LeaderStats>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl LeaderManager {
    /// Creates the manager. Consensus mode requires a submitter.
    pub fn new(
        cluster: ClusterConfig,
        config: LeaderConfig,
        submitter: Option<Arc<dyn CommandSubmitter>>,
    ) -> ClusterResult<Arc<Self>> {
        if config.mode == ElectionMode::Consensus && submitter.is_none() {
            return Err(ClusterError::ConfigError {
                reason: "consensus-routed election requires a command submitter".into(),
            });
        }
        if config.proposal_retry_delay.is_zero() {
            return Err(ClusterError::ConfigError {
                reason: "proposal_retry_delay must be nonzero".into(),
            });
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let topology = vec![cluster.self_id];
        Ok(Arc::new(Self {
            cluster,
            config,
            submitter,
            state: Mutex::new(LeaderInner {
                current_leader: None,
                view_sequence: 0,
                needs_reactivation: false,
                topology,
                has_quorum: false,
            }),
            in_flight: AtomicBool::new(false),
            changes: LeaderChangeBus::new(),
            stats: Mutex::new(LeaderStats::default()),
            shutdown_tx,
            shutdown_rx,
        }))
    }

    /// Consumes the cluster event bus; the single notification task.
    pub async fn run(self: Arc<Self>, mut events: broadcast::Receiver<ClusterEvent>) {
        info!("leader manager started for node {}", self.cluster.self_id);
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => self.on_cluster_event(event),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("leader manager lagged {} cluster events", missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("leader manager stopped");
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        self.state.lock().current_leader
    }

    pub fn is_leader(&self) -> bool {
        self.current_leader() == Some(self.cluster.self_id)
    }

    pub fn view_sequence(&self) -> u64 {
        self.state.lock().view_sequence
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LeaderChange> {
        self.changes.subscribe()
    }

    pub fn stats(&self) -> LeaderStats {
        self.stats.lock().clone()
    }

    /// Inspects a committed batch for leader proposals. Wire this to the
    /// engine's commit stream.
    pub fn observe_commit(&self, batch: &Batch) {
        for command in &batch.commands {
            if let Some(proposal) = LeaderProposal::from_command(command) {
                self.on_leader_committed(proposal.candidate, proposal.view_sequence);
            }
        }
    }

    /// Applies a committed leader claim. Stale views are rejected; a commit
    /// after a quorum flap re-publishes even an unchanged leader.
    pub fn on_leader_committed(&self, leader: NodeId, committed_view: u64) {
        let change = {
            let mut state = self.state.lock();
            if committed_view < state.view_sequence {
                debug!(
                    "rejecting stale leader commit: view {} < current {}",
                    committed_view, state.view_sequence
                );
                self.stats.lock().stale_commits += 1;
                None
            } else {
                state.view_sequence = committed_view;
                let changed = state.current_leader != Some(leader);
                let reactivate = state.needs_reactivation;
                state.current_leader = Some(leader);
                state.needs_reactivation = false;
                (changed || reactivate).then_some(LeaderChange {
                    leader: Some(leader),
                    is_self: leader == self.cluster.self_id,
                })
            }
        };
        self.in_flight.store(false, Ordering::Release);
        if let Some(change) = change {
            info!(
                "leader committed for view {}: {} (self: {})",
                committed_view,
                change.leader.expect("leader present"),
                change.is_self
            );
            self.publish(change);
        }
    }

    fn on_cluster_event(self: &Arc<Self>, event: ClusterEvent) {
        match event {
            ClusterEvent::Quorum(QuorumState::Established) => {
                // Quorum transitions precede the topology event that caused
                // them, so a single-entry view here is stale: the follow-up
                // node event will run the election with the fresh topology.
                let ready = {
                    let mut state = self.state.lock();
                    state.has_quorum = true;
                    state.topology.len() > 1 || self.cluster.total_nodes() == 1
                };
                if ready {
                    self.elect();
                }
            }
            ClusterEvent::Quorum(QuorumState::Disappeared) => self.on_quorum_lost(),
            ClusterEvent::NodeAdded { topology, .. }
            | ClusterEvent::NodeRemoved { topology, .. }
            | ClusterEvent::NodeDown { topology, .. } => {
                let quorum = {
                    let mut state = self.state.lock();
                    state.topology = topology.clone();
                    state.has_quorum
                };
                // A view with no peers left cannot carry a leader.
                if topology.len() <= 1 && self.cluster.total_nodes() > 1 {
                    self.clear_leader();
                } else if quorum {
                    self.elect();
                }
            }
        }
    }

    /// Quorum loss clears the leader and arms the reactivation flag so the
    /// next commit re-publishes even an unchanged leader.
    fn on_quorum_lost(&self) {
        {
            let mut state = self.state.lock();
            state.has_quorum = false;
        }
        self.clear_leader();
    }

    fn clear_leader(&self) {
        let publish = {
            let mut state = self.state.lock();
            state.needs_reactivation = true;
            state.current_leader.take().is_some()
        };
        self.in_flight.store(false, Ordering::Release);
        if publish {
            info!("leader cleared");
            self.publish(LeaderChange {
                leader: None,
                is_self: false,
            });
        }
    }

    /// Runs one election round against the current topology.
    fn elect(self: &Arc<Self>) {
        self.stats.lock().elections += 1;
        match self.config.mode {
            ElectionMode::Local => self.elect_local(),
            ElectionMode::Consensus => self.elect_consensus(),
        }
    }

    fn elect_local(&self) {
        let change = {
            let mut state = self.state.lock();
            let Some(candidate) = self.deterministic_candidate(&state.topology) else {
                return;
            };
            state.view_sequence += 1;
            let changed = state.current_leader != Some(candidate);
            let reactivate = state.needs_reactivation;
            if !changed && !reactivate {
                return;
            }
            state.current_leader = Some(candidate);
            state.needs_reactivation = false;
            LeaderChange {
                leader: Some(candidate),
                is_self: candidate == self.cluster.self_id,
            }
        };
        info!(
            "local election picked {} (self: {})",
            change.leader.expect("candidate present"),
            change.is_self
        );
        self.publish(change);
    }

    fn elect_consensus(self: &Arc<Self>) {
        let proposal = {
            let mut state = self.state.lock();
            let Some(candidate) = self.deterministic_candidate(&state.topology) else {
                return;
            };
            // Only the candidate itself routes the claim through consensus.
            if candidate != self.cluster.self_id {
                return;
            }
            if state.current_leader == Some(candidate) && !state.needs_reactivation {
                return;
            }
            if !state.has_quorum {
                return;
            }
            state.view_sequence += 1;
            LeaderProposal {
                candidate,
                view_sequence: state.view_sequence,
            }
        };
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("leader proposal already in flight; skipping");
            return;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.submit_with_retry(proposal).await;
        });
    }

    async fn submit_with_retry(self: Arc<Self>, proposal: LeaderProposal) {
        let Some(submitter) = self.submitter.as_ref().map(Arc::clone) else {
            self.in_flight.store(false, Ordering::Release);
            return;
        };
        loop {
            self.stats.lock().submissions += 1;
            match submitter.submit(vec![proposal.to_command()]).await {
                Ok(()) => {
                    debug!(
                        "leader proposal for view {} accepted by consensus",
                        proposal.view_sequence
                    );
                    // in_flight stays set until the commit is observed.
                    return;
                }
                Err(e) => {
                    warn!(
                        "leader proposal for view {} not accepted: {}",
                        proposal.view_sequence, e
                    );
                    self.in_flight.store(false, Ordering::Release);
                    tokio::time::sleep(self.config.proposal_retry_delay).await;

                    let still_wanted = {
                        let state = self.state.lock();
                        state.has_quorum
                            && state.view_sequence == proposal.view_sequence
                            && state.current_leader != Some(proposal.candidate)
                    };
                    if !still_wanted {
                        return;
                    }
                    if self
                        .in_flight
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        return;
                    }
                    self.stats.lock().retries += 1;
                }
            }
        }
    }

    /// Minimum NodeId of the expected members present in the live view;
    /// falls back to the minimum live node when the intersection is empty.
    fn deterministic_candidate(&self, topology: &[NodeId]) -> Option<NodeId> {
        topology
            .iter()
            .filter(|n| self.cluster.expected.contains(*n))
            .min()
            .or_else(|| topology.iter().min())
            .copied()
    }

    fn publish(&self, change: LeaderChange) {
        self.stats.lock().changes_published += 1;
        self.changes.publish(change);
    }
}
