//! Proposer-side command batching.
//!
//! Commands are accumulated until either the size or the age threshold is
//! crossed; the resulting batch is the unit of consensus. Boundaries are a
//! purely local policy.

use crate::{Batch, Command};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Size/time thresholds for the proposer batching policy.
#[derive(Debug, Clone)]
pub struct BatchPolicy {
    /// Maximum number of commands per batch
    pub max_batch_size: usize,
    /// Maximum time to hold a partial batch before flushing it
    pub max_batch_delay: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_batch_delay: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchStats {
    pub total_commands: usize,
    pub total_batches: usize,
    pub flush_timeouts: usize,
}

/// Accumulates commands into correlation-ID-tagged batches.
#[derive(Debug)]
pub struct Batcher {
    policy: BatchPolicy,
    buffer: VecDeque<Command>,
    oldest: Option<Instant>,
    stats: BatchStats,
}

impl Batcher {
    pub fn new(policy: BatchPolicy) -> Self {
        Self {
            policy,
            buffer: VecDeque::new(),
            oldest: None,
            stats: BatchStats::default(),
        }
    }

    /// Appends a command; returns a full batch once the size threshold is
    /// reached.
    pub fn push(&mut self, command: Command) -> Option<Batch> {
        if self.buffer.is_empty() {
            self.oldest = Some(Instant::now());
        }
        self.buffer.push_back(command);

        if self.buffer.len() >= self.policy.max_batch_size {
            return Some(self.drain());
        }
        None
    }

    /// Flushes a partial batch whose oldest command exceeded the delay
    /// threshold. Meant to be called from a periodic tick.
    pub fn flush_due(&mut self) -> Option<Batch> {
        let oldest = self.oldest?;
        if oldest.elapsed() >= self.policy.max_batch_delay && !self.buffer.is_empty() {
            self.stats.flush_timeouts += 1;
            return Some(self.drain());
        }
        None
    }

    /// Flushes whatever is buffered, regardless of thresholds.
    pub fn flush(&mut self) -> Option<Batch> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.drain())
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> &BatchStats {
        &self.stats
    }

    fn drain(&mut self) -> Batch {
        let commands: Vec<Command> = self.buffer.drain(..).collect();
        self.oldest = None;
        self.stats.total_commands += commands.len();
        self.stats.total_batches += 1;
        Batch::new(commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flushes_on_size_threshold() {
        let mut batcher = Batcher::new(BatchPolicy {
            max_batch_size: 3,
            max_batch_delay: Duration::from_secs(60),
        });

        assert!(batcher.push(Command::new("a")).is_none());
        assert!(batcher.push(Command::new("b")).is_none());
        let batch = batcher.push(Command::new("c")).expect("size flush");
        assert_eq!(batch.commands.len(), 3);
        assert_eq!(batcher.buffered(), 0);
    }

    #[test]
    fn flushes_on_age() {
        let mut batcher = Batcher::new(BatchPolicy {
            max_batch_size: 100,
            max_batch_delay: Duration::from_millis(0),
        });

        assert!(batcher.push(Command::new("a")).is_none());
        let batch = batcher.flush_due().expect("age flush");
        assert_eq!(batch.commands.len(), 1);
        assert_eq!(batcher.stats().flush_timeouts, 1);
    }

    #[test]
    fn empty_batcher_never_flushes() {
        let mut batcher = Batcher::new(BatchPolicy::default());
        assert!(batcher.flush_due().is_none());
        assert!(batcher.flush().is_none());
    }

    #[test]
    fn batches_get_distinct_correlation_ids() {
        let mut batcher = Batcher::new(BatchPolicy {
            max_batch_size: 1,
            max_batch_delay: Duration::from_secs(60),
        });
        let a = batcher.push(Command::new("a")).unwrap();
        let b = batcher.push(Command::new("b")).unwrap();
        assert_ne!(a.correlation_id, b.correlation_id);
    }
}
