use concord_core::{ConsensusError, Result};
use std::time::Duration;

/// Tunables of the consensus engine.
///
/// `phase_timeout` drives the re-broadcast of a stuck phase's votes;
/// `max_batch_size`/`max_batch_delay` set the proposer batching policy.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    pub phase_timeout: Duration,
    pub max_batch_size: usize,
    pub max_batch_delay: Duration,
    /// Committed slots retained behind the active slot for late-message
    /// idempotence before their state is discarded.
    pub max_slot_history: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            phase_timeout: Duration::from_millis(1000),
            max_batch_size: 100,
            max_batch_delay: Duration::from_millis(10),
            max_slot_history: 1024,
        }
    }
}

impl ConsensusConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_phase_timeout(mut self, timeout: Duration) -> Self {
        self.phase_timeout = timeout;
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_max_batch_delay(mut self, delay: Duration) -> Self {
        self.max_batch_delay = delay;
        self
    }

    pub fn with_max_slot_history(mut self, slots: usize) -> Self {
        self.max_slot_history = slots;
        self
    }

    /// Startup validation; violations are fatal.
    pub fn validate(&self) -> Result<()> {
        if self.phase_timeout.is_zero() {
            return Err(ConsensusError::invalid_config("phase_timeout must be nonzero"));
        }
        if self.max_batch_size == 0 {
            return Err(ConsensusError::invalid_config("max_batch_size must be nonzero"));
        }
        if self.max_slot_history == 0 {
            return Err(ConsensusError::invalid_config("max_slot_history must be nonzero"));
        }
        Ok(())
    }
}
