//! Ordered commit across slots.
//!
//! Decisions can land out of slot order; the sequencer buffers them and
//! releases the contiguous prefix, so the application sees commits in
//! strictly increasing slot order on a single-consumer FIFO channel.

use concord_core::{Batch, Slot};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One entry of the ordered commit stream delivered to the application.
///
/// `batch` is `None` for V0 (no-op) slots, which are emitted anyway to
/// preserve slot numbering.
#[derive(Debug, Clone, PartialEq)]
pub struct Committed {
    pub slot: Slot,
    pub batch: Option<Batch>,
}

pub type CommitSender = mpsc::UnboundedSender<Committed>;
pub type CommitReceiver = mpsc::UnboundedReceiver<Committed>;

pub(crate) type DecisionSender = mpsc::UnboundedSender<Committed>;

/// Buffers decided slots and drains the contiguous prefix in order.
pub struct CommitSequencer {
    decisions_rx: mpsc::UnboundedReceiver<Committed>,
    commits_tx: CommitSender,
    next: Slot,
    buffered: BTreeMap<Slot, Option<Batch>>,
}

impl CommitSequencer {
    /// Creates the sequencer plus its input and output endpoints.
    pub fn new() -> (Self, DecisionSender, CommitReceiver) {
        let (decisions_tx, decisions_rx) = mpsc::unbounded_channel();
        let (commits_tx, commits_rx) = mpsc::unbounded_channel();
        (
            Self {
                decisions_rx,
                commits_tx,
                next: Slot::ZERO,
                buffered: BTreeMap::new(),
            },
            decisions_tx,
            commits_rx,
        )
    }

    /// Runs until the decision channel closes.
    pub async fn run(mut self) {
        while let Some(committed) = self.decisions_rx.recv().await {
            self.accept(committed.slot, committed.batch);
            if self.drain().is_err() {
                // Application dropped its receiver; nothing left to order.
                break;
            }
        }
        debug!("commit sequencer stopped at slot {}", self.next);
    }

    fn accept(&mut self, slot: Slot, batch: Option<Batch>) {
        if slot < self.next {
            warn!("ignoring duplicate commit for already-emitted slot {}", slot);
            return;
        }
        if self.buffered.contains_key(&slot) {
            warn!("ignoring duplicate commit for buffered slot {}", slot);
            return;
        }
        self.buffered.insert(slot, batch);
    }

    fn drain(&mut self) -> Result<(), ()> {
        while let Some(batch) = self.buffered.remove(&self.next) {
            let committed = Committed {
                slot: self.next,
                batch,
            };
            debug!(
                "emitting commit for slot {} ({})",
                committed.slot,
                if committed.batch.is_some() { "batch" } else { "no-op" }
            );
            self.commits_tx.send(committed).map_err(|_| ())?;
            self.next = self.next.next();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::Command;

    fn batch() -> Batch {
        Batch::new(vec![Command::new("SET a 1")])
    }

    #[tokio::test]
    async fn emits_in_slot_order_despite_arrival_order() {
        let (sequencer, decisions, mut commits) = CommitSequencer::new();
        tokio::spawn(sequencer.run());

        let b2 = batch();
        let b0 = batch();
        decisions
            .send(Committed { slot: Slot::new(2), batch: Some(b2.clone()) })
            .unwrap();
        decisions
            .send(Committed { slot: Slot::new(1), batch: None })
            .unwrap();
        decisions
            .send(Committed { slot: Slot::ZERO, batch: Some(b0.clone()) })
            .unwrap();

        assert_eq!(commits.recv().await.unwrap(), Committed { slot: Slot::ZERO, batch: Some(b0) });
        assert_eq!(commits.recv().await.unwrap(), Committed { slot: Slot::new(1), batch: None });
        assert_eq!(commits.recv().await.unwrap(), Committed { slot: Slot::new(2), batch: Some(b2) });
    }

    #[tokio::test]
    async fn buffers_until_gap_is_filled() {
        let (sequencer, decisions, mut commits) = CommitSequencer::new();
        tokio::spawn(sequencer.run());

        decisions
            .send(Committed { slot: Slot::new(1), batch: None })
            .unwrap();
        // Slot 0 is missing, so nothing may be emitted yet.
        tokio::task::yield_now().await;
        assert!(commits.try_recv().is_err());

        decisions
            .send(Committed { slot: Slot::ZERO, batch: None })
            .unwrap();
        assert_eq!(commits.recv().await.unwrap().slot, Slot::ZERO);
        assert_eq!(commits.recv().await.unwrap().slot, Slot::new(1));
    }

    #[tokio::test]
    async fn duplicate_slots_commit_once() {
        let (sequencer, decisions, mut commits) = CommitSequencer::new();
        tokio::spawn(sequencer.run());

        let b = batch();
        decisions
            .send(Committed { slot: Slot::ZERO, batch: Some(b.clone()) })
            .unwrap();
        decisions
            .send(Committed { slot: Slot::ZERO, batch: Some(b) })
            .unwrap();
        decisions
            .send(Committed { slot: Slot::new(1), batch: None })
            .unwrap();

        assert_eq!(commits.recv().await.unwrap().slot, Slot::ZERO);
        assert_eq!(commits.recv().await.unwrap().slot, Slot::new(1));
        assert!(commits.try_recv().is_err());
    }
}
