//! Notification buses for topology and leadership changes.
//!
//! Each bus wraps one broadcast channel with a single logical publisher, so
//! every subscriber observes the same total order of events.

use concord_core::{ClusterEvent, NodeId};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

const DEFAULT_BUS_CAPACITY: usize = 256;

/// Cluster-wide topology/quorum event bus.
pub struct ClusterEventBus {
    tx: broadcast::Sender<ClusterEvent>,
    published: AtomicU64,
}

impl Default for ClusterEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterEventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            published: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.tx.subscribe()
    }

    /// Publishes one event to every subscriber. Lossy for subscribers that
    /// lag beyond the channel capacity.
    pub fn publish(&self, event: ClusterEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(event.clone()).is_err() {
            debug!("no cluster event subscribers for {:?}", event);
        }
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

/// Leadership notification delivered to the application layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderChange {
    pub leader: Option<NodeId>,
    /// True when this node is the leader named by `leader`.
    pub is_self: bool,
}

/// Bus carrying `LeaderChange` notifications.
pub struct LeaderChangeBus {
    tx: broadcast::Sender<LeaderChange>,
    published: AtomicU64,
}

impl Default for LeaderChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaderChangeBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_BUS_CAPACITY);
        Self {
            tx,
            published: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LeaderChange> {
        self.tx.subscribe()
    }

    pub fn publish(&self, change: LeaderChange) {
        self.published.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(change).is_err() {
            debug!("no leader change subscribers for {:?}", change);
        }
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}
