//! Ping/pong liveness detection.
//!
//! A tick task pings every expected peer; a peer whose pongs stop arriving
//! for `miss_threshold` consecutive checks is reported down to the
//! topology manager, and a returning pong reports it back up. The
//! transport answers pings itself and forwards pong arrivals into the
//! detector's channel.

use crate::{ClusterError, ClusterResult, TopologyManager};
use concord_core::messages::ProtocolMessage;
use concord_core::{ClusterConfig, ClusterNetwork, NodeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Liveness detector cadence and thresholds.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Interval between pings to each peer
    pub ping_interval: Duration,
    /// Silence window after which a check counts as a miss
    pub ping_timeout: Duration,
    /// Consecutive misses before a peer is reported down
    pub miss_threshold: u32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(1000),
            ping_timeout: Duration::from_millis(3000),
            miss_threshold: 3,
        }
    }
}

impl LivenessConfig {
    pub fn validate(&self) -> ClusterResult<()> {
        if self.ping_interval.is_zero() || self.ping_timeout.is_zero() {
            return Err(ClusterError::ConfigError {
                reason: "liveness intervals must be nonzero".into(),
            });
        }
        if self.miss_threshold == 0 {
            return Err(ClusterError::ConfigError {
                reason: "miss_threshold must be nonzero".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
struct PeerLiveness {
    last_pong: Instant,
    misses: u32,
    down: bool,
    /// No pong seen yet since startup or since the peer went down.
    unconfirmed: bool,
}

/// Sink half handed to the transport: every inbound pong's sender goes here.
pub type PongSender = mpsc::UnboundedSender<NodeId>;

/// Drives the ping cadence and miss counting for all expected peers.
pub struct LivenessDetector<N: ClusterNetwork> {
    config: LivenessConfig,
    cluster: ClusterConfig,
    network: Arc<N>,
    topology: Arc<TopologyManager>,
    pongs_rx: mpsc::UnboundedReceiver<NodeId>,
    shutdown_rx: watch::Receiver<bool>,
    peers: HashMap<NodeId, PeerLiveness>,
    nonce: u64,
}

impl<N: ClusterNetwork + 'static> LivenessDetector<N> {
    /// Builds the detector plus the pong sink for the transport and the
    /// shutdown trigger.
    pub fn new(
        config: LivenessConfig,
        cluster: ClusterConfig,
        network: Arc<N>,
        topology: Arc<TopologyManager>,
    ) -> ClusterResult<(Self, PongSender, watch::Sender<bool>)> {
        config.validate()?;
        let (pongs_tx, pongs_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let now = Instant::now();
        let peers = cluster
            .peers()
            .map(|peer| {
                (
                    *peer,
                    PeerLiveness {
                        last_pong: now,
                        misses: 0,
                        down: false,
                        unconfirmed: true,
                    },
                )
            })
            .collect();

        Ok((
            Self {
                config,
                cluster,
                network,
                topology,
                pongs_rx,
                shutdown_rx,
                peers,
                nonce: 0,
            },
            pongs_tx,
            shutdown_tx,
        ))
    }

    pub async fn run(mut self) {
        info!("liveness detector started for node {}", self.cluster.self_id);
        let mut ticker = interval(self.config.ping_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.send_pings().await;
                    self.check_misses();
                }
                pong = self.pongs_rx.recv() => {
                    match pong {
                        Some(node_id) => self.on_pong(node_id),
                        None => break,
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("liveness detector stopped");
    }

    async fn send_pings(&mut self) {
        self.nonce = self.nonce.wrapping_add(1);
        let ping = ProtocolMessage::ping(self.cluster.self_id, self.nonce);
        for peer in self.peers.keys() {
            self.network.send_to(*peer, ping.clone()).await;
        }
    }

    fn check_misses(&mut self) {
        let timeout = self.config.ping_timeout;
        let threshold = self.config.miss_threshold;
        for (peer, liveness) in &mut self.peers {
            if liveness.down {
                continue;
            }
            if liveness.last_pong.elapsed() > timeout {
                liveness.misses += 1;
                debug!("peer {} missed pong {}/{}", peer, liveness.misses, threshold);
                if liveness.misses >= threshold {
                    liveness.down = true;
                    liveness.misses = 0;
                    warn!("peer {} declared down after sustained pong loss", peer);
                    self.topology.node_down(*peer);
                }
            } else {
                liveness.misses = 0;
            }
        }
    }

    fn on_pong(&mut self, node_id: NodeId) {
        let Some(liveness) = self.peers.get_mut(&node_id) else {
            debug!("pong from unexpected node {}", node_id);
            return;
        };
        liveness.last_pong = Instant::now();
        liveness.misses = 0;
        if liveness.down || liveness.unconfirmed {
            liveness.down = false;
            liveness.unconfirmed = false;
            self.topology.node_up(node_id);
        }
    }
}
