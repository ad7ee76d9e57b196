//! # Concord Cluster
//!
//! Cluster coordination for the Concord consensus protocol:
//!
//! - **TopologyManager**: tracks reachable nodes and the quorum state
//! - **LivenessDetector**: ping/pong cadence with miss counting
//! - **LeaderManager**: names a single proposal-submitting node per view,
//!   locally or routed through consensus itself
//! - **Notification buses**: serialized topology and leadership events
//!
//! The consensus engine subscribes to the cluster event bus; the leader
//! manager taps the engine's commit stream for committed leader proposals.

pub mod errors;
pub mod leader;
pub mod liveness;
pub mod notifications;
pub mod topology;

pub use errors::{ClusterError, ClusterResult};
pub use leader::{ElectionMode, LeaderConfig, LeaderManager, LeaderProposal, LeaderStats};
pub use liveness::{LivenessConfig, LivenessDetector, PongSender};
pub use notifications::{ClusterEventBus, LeaderChange, LeaderChangeBus};
pub use topology::{TopologyManager, TopologyStats};
