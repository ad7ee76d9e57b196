//! # Concord Testing
//!
//! Simulation utilities for the Concord consensus protocol: an in-memory
//! cluster network with crash and drop-rule fault injection, and a
//! harness assembling full multi-node clusters for integration tests.

pub mod harness;
pub mod memory;

pub use harness::{committed_payloads, TestCluster, TestNode};
pub use memory::{DropRule, InMemoryClusterNetwork, InMemoryRouter, MessageKind, RuleId};
