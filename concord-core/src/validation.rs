use crate::messages::{MessageBody, ProtocolMessage};
use crate::{ConsensusError, Result};

/// Structural validation of inbound data before it reaches protocol state.
pub trait Validator {
    fn validate(&self) -> Result<()>;
}

impl Validator for ProtocolMessage {
    /// Checks the constraints the wire format itself cannot express.
    ///
    /// Round-1 votes and decisions carry binary values only; `VQuestion` in
    /// either is a protocol violation regardless of what else the message
    /// says.
    fn validate(&self) -> Result<()> {
        match &self.body {
            MessageBody::Round1Vote(vote) => {
                if !vote.value.is_binary() {
                    return Err(ConsensusError::violation(format!(
                        "round-1 vote from {} for slot {} phase {} carries V?",
                        vote.node_id, vote.slot, vote.phase
                    )));
                }
                if vote.node_id != self.from {
                    return Err(ConsensusError::violation("round-1 voter/sender mismatch"));
                }
                Ok(())
            }
            MessageBody::Round2Vote(vote) => {
                if vote.node_id != self.from {
                    return Err(ConsensusError::violation("round-2 voter/sender mismatch"));
                }
                Ok(())
            }
            MessageBody::Decision(decision) => {
                if !decision.value.is_binary() {
                    return Err(ConsensusError::violation(format!(
                        "decision for slot {} carries V?",
                        decision.slot
                    )));
                }
                Ok(())
            }
            MessageBody::Proposal(proposal) => {
                if proposal.node_id != self.from {
                    return Err(ConsensusError::violation("proposal owner/sender mismatch"));
                }
                Ok(())
            }
            MessageBody::BatchFetchRequest(_)
            | MessageBody::BatchFetchResponse(_)
            | MessageBody::Ping(_)
            | MessageBody::Pong(_) => Ok(()),
        }
    }
}
