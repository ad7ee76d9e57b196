//! Multi-node cluster assembly for integration tests.
//!
//! Each node gets its own in-memory network port, topology manager,
//! engine, and leader manager, wired exactly as a production process
//! would wire them: the engine subscribes to the cluster event bus, and
//! the commit stream is tapped by the leader manager before reaching the
//! test's application channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use concord_cluster::{
    ClusterEventBus, ElectionMode, LeaderChange, LeaderConfig, LeaderManager, TopologyManager,
};
use concord_core::{Batch, ClusterConfig, Command, CommandSubmitter, NodeId};
use concord_engine::{Committed, ConsensusConfig, EngineStats, RabiaCore, RabiaHandle};

use crate::memory::{InMemoryClusterNetwork, InMemoryRouter};

/// One assembled node of a test cluster.
pub struct TestNode {
    pub id: NodeId,
    pub network: Arc<InMemoryClusterNetwork>,
    pub handle: RabiaHandle,
    /// Ordered commit stream, after the leader manager's tap.
    pub commits: mpsc::UnboundedReceiver<Committed>,
    pub topology: Arc<TopologyManager>,
    pub leader: Arc<LeaderManager>,
    pub leader_changes: broadcast::Receiver<LeaderChange>,
    tasks: Vec<JoinHandle<()>>,
}

impl TestNode {
    /// Waits for the next commit at this node.
    pub async fn expect_commit(&mut self, within: Duration) -> Committed {
        timeout(within, self.commits.recv())
            .await
            .unwrap_or_else(|_| panic!("node {} timed out waiting for a commit", self.id))
            .expect("commit channel open")
    }

    pub async fn stats(&self) -> EngineStats {
        self.handle.stats().await.expect("engine running")
    }

    pub fn shutdown(&self) {
        self.handle.shutdown();
        self.leader.stop();
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// A full in-memory cluster plus its router.
pub struct TestCluster {
    pub router: InMemoryRouter,
    pub ids: Vec<NodeId>,
    pub nodes: HashMap<NodeId, TestNode>,
}

impl TestCluster {
    /// Builds and starts `n` nodes with ids 1..=n.
    pub async fn launch(n: u64, config: ConsensusConfig, mode: ElectionMode) -> Self {
        let ids: Vec<NodeId> = (1..=n).map(NodeId::from).collect();
        let router = InMemoryRouter::new();
        let mut nodes = HashMap::new();

        for id in &ids {
            let cluster = ClusterConfig::new(*id, ids.iter().copied()).expect("valid cluster");

            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let network =
                InMemoryClusterNetwork::new(*id, router.clone(), inbound_tx, None);

            let bus = Arc::new(ClusterEventBus::new());
            let topology = Arc::new(TopologyManager::new(cluster.clone(), Arc::clone(&bus)));

            let (engine, handle, mut commits_rx) = RabiaCore::new(
                cluster.clone(),
                config.clone(),
                Arc::clone(&network),
                inbound_rx,
                bus.subscribe(),
            )
            .expect("valid engine config");

            let leader = LeaderManager::new(
                cluster,
                LeaderConfig {
                    mode,
                    proposal_retry_delay: Duration::from_millis(50),
                },
                Some(Arc::new(handle.clone()) as Arc<dyn CommandSubmitter>),
            )
            .expect("valid leader config");

            let leader_changes = leader.subscribe();
            let leader_task = tokio::spawn(Arc::clone(&leader).run(bus.subscribe()));
            let engine_task = tokio::spawn(async move {
                let _ = engine.run().await;
            });

            // Commit tap: the leader manager inspects every committed batch
            // before the application sees it.
            let (app_tx, app_rx) = mpsc::unbounded_channel();
            let tap_leader = Arc::clone(&leader);
            let tap_task = tokio::spawn(async move {
                while let Some(committed) = commits_rx.recv().await {
                    if let Some(batch) = &committed.batch {
                        tap_leader.observe_commit(batch);
                    }
                    if app_tx.send(committed).is_err() {
                        break;
                    }
                }
            });

            nodes.insert(
                *id,
                TestNode {
                    id: *id,
                    network,
                    handle,
                    commits: app_rx,
                    topology,
                    leader,
                    leader_changes,
                    tasks: vec![leader_task, engine_task, tap_task],
                },
            );
        }

        Self { router, ids, nodes }
    }

    /// Marks every peer reachable at every node, establishing quorum
    /// cluster-wide. Tests drive topology directly for determinism; the
    /// liveness detector has its own coverage.
    pub fn establish_full_connectivity(&self) {
        for node in self.nodes.values() {
            for peer in &self.ids {
                if *peer != node.id {
                    node.topology.node_up(*peer);
                }
            }
        }
    }

    /// Reports `down` as unreachable at every other node.
    pub fn partition_node(&self, down: NodeId) {
        for node in self.nodes.values() {
            if node.id != down {
                node.topology.node_down(down);
            }
        }
    }

    /// Reports `up` as reachable again at every other node.
    pub fn heal_node(&self, up: NodeId) {
        for node in self.nodes.values() {
            if node.id != up {
                node.topology.node_up(up);
            }
        }
    }

    pub fn node_mut(&mut self, id: u64) -> &mut TestNode {
        self.nodes.get_mut(&NodeId::from(id)).expect("node exists")
    }

    pub fn node(&self, id: u64) -> &TestNode {
        self.nodes.get(&NodeId::from(id)).expect("node exists")
    }

    /// Submits commands at the given node.
    pub async fn submit(&self, id: u64, commands: Vec<Command>) -> concord_core::Result<()> {
        self.node(id).handle.submit_commands(commands).await
    }

    /// Waits for one commit at every node and asserts they are identical.
    pub async fn expect_agreed_commit(&mut self, within: Duration) -> Committed {
        let ids = self.ids.clone();
        let mut first: Option<Committed> = None;
        for id in ids {
            let committed = self
                .nodes
                .get_mut(&id)
                .expect("node exists")
                .expect_commit(within)
                .await;
            match &first {
                None => first = Some(committed),
                Some(expected) => {
                    assert_eq!(
                        expected.slot, committed.slot,
                        "nodes committed different slots"
                    );
                    assert_eq!(
                        expected.batch, committed.batch,
                        "nodes committed different batches at slot {}",
                        committed.slot
                    );
                }
            }
        }
        first.expect("at least one node")
    }

    pub fn shutdown(&self) {
        for node in self.nodes.values() {
            node.shutdown();
        }
    }
}

/// Convenience: a batch-equality-friendly view of a commit's payload.
pub fn committed_payloads(committed: &Committed) -> Vec<Vec<u8>> {
    committed
        .batch
        .as_ref()
        .map(|batch: &Batch| {
            batch
                .commands
                .iter()
                .map(|c| c.data.to_vec())
                .collect()
        })
        .unwrap_or_default()
}
