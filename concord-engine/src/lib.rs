//! # Concord Engine
//!
//! The consensus engine implementing per-slot randomized binary agreement
//! (Rabia) for the Concord protocol.
//!
//! The engine is a single task owning all per-slot state: inbound votes,
//! proposals, decisions, and command submissions are serialized through its
//! run loop, and decided slots flow through a dedicated sequencer task that
//! emits commits in strict slot order.
//!
//! ## Key Components
//!
//! - **RabiaCore**: the engine task driving the per-slot phase machines
//! - **SlotState**: one consensus instance's round-1/round-2/coin machine
//! - **CommitSequencer**: ordered commit emission across slots
//! - **RabiaHandle**: command submission and introspection
//! - **ConsensusConfig**: engine tunables

pub mod config;
pub mod engine;
pub mod sequencer;
pub mod slot;
pub mod state;

pub use config::ConsensusConfig;
pub use engine::RabiaCore;
pub use sequencer::{CommitReceiver, Committed};
pub use slot::{SlotDecision, SlotEffect, SlotState};
pub use state::{EngineStats, RabiaHandle};
