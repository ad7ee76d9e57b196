//! # Concord Core
//!
//! Core types and abstractions for the Concord consensus protocol, a
//! leaderless randomized binary agreement (Rabia) over a crash-fault
//! tolerant cluster.
//!
//! ## Key Components
//!
//! - **Types**: NodeId, Slot, Phase, StateValue, Batch, CorrelationId
//! - **Messages**: the field-exact wire envelopes exchanged between nodes
//! - **Network**: the `ClusterNetwork` abstraction and cluster events
//! - **Coin**: the deterministic common coin that breaks round-2 ties
//! - **Batching**: proposer-side command batching policy
//! - **Wire**: binary/JSON codecs with bijective round-trips
//!
//! ## Example Usage
//!
//! ```rust
//! use concord_core::{Batch, Command, NodeId, Slot};
//!
//! let batch = Batch::new(vec![Command::new("SET key value")]);
//! let node = NodeId::new();
//! let slot = Slot::ZERO;
//! assert_eq!(slot.next().value(), 1);
//! # let _ = (batch, node);
//! ```

pub mod batching;
pub mod coin;
pub mod error;
pub mod messages;
pub mod network;
pub mod types;
pub mod validation;
pub mod wire;

pub use error::*;
pub use network::*;
pub use types::*;
pub use validation::*;
