//! # Core Types
//!
//! Fundamental types used throughout the Concord consensus protocol.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Unique identifier for a node in the consensus cluster.
///
/// Node identifiers are stable for the lifetime of a run and carry a total
/// order, which the protocol relies on for deterministic tie-breaking
/// (value selection under dissenting proposals, local leader election).
///
/// # Examples
///
/// ```rust
/// use concord_core::NodeId;
///
/// let a = NodeId::from(1u32);
/// let b = NodeId::from(2u32);
/// assert!(a < b);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Creates a new random node identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<u32> for NodeId {
    /// Creates a deterministic NodeId from a u32, for tests and examples
    /// where predictable, ordered node identities are needed.
    fn from(value: u32) -> Self {
        Self::from(value as u64)
    }
}

impl From<u64> for NodeId {
    /// Creates a deterministic NodeId from a u64 by repeating its big-endian
    /// byte pattern, so the numeric order matches the NodeId order.
    fn from(value: u64) -> Self {
        let be = value.to_be_bytes();
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&be);
        bytes[8..].copy_from_slice(&be);
        Self(Uuid::from_bytes(bytes))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordinal index of one consensus instance.
///
/// Slots commit in strictly increasing order at every node; slot `K + 1` is
/// only driven once slot `K` has decided locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Slot(pub u64);

impl Slot {
    /// The first slot.
    pub const ZERO: Slot = Slot(0);

    pub fn new(index: u64) -> Self {
        Self(index)
    }

    /// Returns the next slot in sequence.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One round-1/round-2 pass within a slot.
///
/// Phases start at 0 and are strictly ordered; additional phases are entered
/// only when the round-2 decision rule falls through to a coin flip.
///
/// # Examples
///
/// ```rust
/// use concord_core::Phase;
///
/// let p = Phase::ZERO;
/// assert!(p.next() > p);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Phase(pub u64);

impl Phase {
    /// The initial phase of every slot.
    pub const ZERO: Phase = Phase(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the successor phase.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Vote values exchanged by the randomized binary agreement rounds.
///
/// `V0` and `V1` span the binary decision space; `VQuestion` marks
/// "undecided, use the coin" and may only appear in round-2 votes. Round-1
/// votes and coin outputs are always binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateValue {
    /// No value for this slot.
    V0,
    /// Commit the slot's value.
    V1,
    /// Undecided; defer to the common coin.
    VQuestion,
}

impl StateValue {
    /// True for `V0`/`V1`, false for `VQuestion`.
    pub fn is_binary(&self) -> bool {
        !matches!(self, StateValue::VQuestion)
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::V0 => write!(f, "V0"),
            StateValue::V1 => write!(f, "V1"),
            StateValue::VQuestion => write!(f, "V?"),
        }
    }
}

/// Opaque unique identifier of a command batch.
///
/// The correlation ID is the batch's identity across the whole cluster:
/// votes and decisions reference it instead of carrying the batch body, and
/// batch equality is defined by it alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single application command.
///
/// Command payloads are opaque to the consensus core; only the application
/// layer interprets them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Unique identifier for this command
    pub id: Uuid,
    /// Opaque command payload
    pub data: bytes::Bytes,
}

impl Command {
    /// Creates a new command with the given payload and a fresh identifier.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use concord_core::Command;
    ///
    /// let cmd = Command::new("SET key value");
    /// assert!(!cmd.data.is_empty());
    /// ```
    pub fn new(data: impl Into<bytes::Bytes>) -> Self {
        Self {
            id: Uuid::new_v4(),
            data: data.into(),
        }
    }
}

/// A correlation-ID-tagged ordered sequence of commands.
///
/// Batch boundaries are a local proposer policy and carry no semantic
/// weight; the correlation ID does. Two batches are equal iff their
/// correlation IDs are equal, regardless of contents.
///
/// # Examples
///
/// ```rust
/// use concord_core::{Batch, Command};
///
/// let batch = Batch::new(vec![Command::new("SET a 1")]);
/// assert_eq!(batch.commands.len(), 1);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    /// Cluster-wide unique identity of this batch
    pub correlation_id: CorrelationId,
    /// Commands included in this batch
    pub commands: Vec<Command>,
    /// Creation time, milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl Batch {
    /// Creates a new batch with a fresh correlation ID.
    pub fn new(commands: Vec<Command>) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            commands,
            timestamp: unix_millis(),
        }
    }

    /// Recreates a batch under a known correlation ID, as when a body
    /// arrives through the catch-up protocol.
    pub fn with_correlation_id(correlation_id: CorrelationId, commands: Vec<Command>) -> Self {
        Self {
            correlation_id,
            commands,
            timestamp: unix_millis(),
        }
    }

    /// Integrity checksum over the batch contents.
    pub fn checksum(&self) -> u32 {
        let serialized = serde_json::to_vec(&self.commands).unwrap_or_default();
        crc32fast::hash(&serialized)
    }
}

impl PartialEq for Batch {
    fn eq(&self, other: &Self) -> bool {
        self.correlation_id == other.correlation_id
    }
}

impl Eq for Batch {}

impl Hash for Batch {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.correlation_id.hash(state);
    }
}

pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_order_follows_numeric_order() {
        let ids: Vec<NodeId> = (0u64..10).map(NodeId::from).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn slot_and_phase_successors() {
        assert_eq!(Slot::ZERO.next(), Slot::new(1));
        assert_eq!(Phase::new(41).next().value(), 42);
        assert!(Phase::ZERO < Phase::ZERO.next());
    }

    #[test]
    fn state_value_binary_check() {
        assert!(StateValue::V0.is_binary());
        assert!(StateValue::V1.is_binary());
        assert!(!StateValue::VQuestion.is_binary());
    }

    #[test]
    fn batch_equality_is_by_correlation_id() {
        let a = Batch::new(vec![Command::new("SET a 1")]);
        let b = Batch::new(vec![Command::new("SET a 1")]);
        assert_ne!(a, b);

        let resurrected = Batch::with_correlation_id(a.correlation_id, vec![]);
        assert_eq!(a, resurrected);
    }

    #[test]
    fn batch_checksum_is_stable() {
        let batch = Batch::new(vec![Command::new("SET a 1"), Command::new("GET a")]);
        assert_eq!(batch.checksum(), batch.checksum());
    }
}
