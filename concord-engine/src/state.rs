use async_trait::async_trait;
use concord_core::{Command, CommandSubmitter, ConsensusError, Result};
use tokio::sync::{mpsc, oneshot};

/// Counters maintained by the engine task; snapshotted on request.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EngineStats {
    pub decided_slots: u64,
    pub proposals_sent: u64,
    pub candidate_echoes: u64,
    pub stale_messages: u64,
    pub protocol_violations: u64,
    pub coin_flips: u64,
    pub batch_fetches_sent: u64,
}

/// Requests accepted by the engine task.
#[derive(Debug)]
pub enum EngineCommand {
    /// Enqueue commands for batching and proposal. The ack reports whether
    /// the submission was accepted, not whether it committed.
    Submit {
        commands: Vec<Command>,
        ack: oneshot::Sender<Result<()>>,
    },
    GetStats(oneshot::Sender<EngineStats>),
    Shutdown,
}

pub type EngineCommandSender = mpsc::UnboundedSender<EngineCommand>;
pub type EngineCommandReceiver = mpsc::UnboundedReceiver<EngineCommand>;

/// Cloneable handle to a running engine.
#[derive(Debug, Clone)]
pub struct RabiaHandle {
    tx: EngineCommandSender,
}

impl RabiaHandle {
    pub(crate) fn new(tx: EngineCommandSender) -> Self {
        Self { tx }
    }

    /// Submits commands for consensus. Fails when the engine has no quorum
    /// or has shut down; callers retry per their own policy.
    pub async fn submit_commands(&self, commands: Vec<Command>) -> Result<()> {
        let (ack, ack_rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Submit { commands, ack })
            .map_err(|_| ConsensusError::internal("engine stopped"))?;
        ack_rx
            .await
            .map_err(|_| ConsensusError::internal("engine dropped submission"))?
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::GetStats(tx))
            .map_err(|_| ConsensusError::internal("engine stopped"))?;
        rx.await
            .map_err(|_| ConsensusError::internal("engine stopped"))
    }

    /// Requests engine shutdown; outstanding proposals are abandoned.
    pub fn shutdown(&self) {
        let _ = self.tx.send(EngineCommand::Shutdown);
    }
}

#[async_trait]
impl CommandSubmitter for RabiaHandle {
    async fn submit(&self, commands: Vec<Command>) -> Result<()> {
        self.submit_commands(commands).await
    }
}
