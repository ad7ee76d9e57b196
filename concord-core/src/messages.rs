use crate::{Command, CorrelationId, NodeId, Phase, Slot, StateValue};
use serde::{Deserialize, Serialize};

/// Envelope around every message exchanged between cluster nodes.
///
/// The envelope names the sender; routing (directed vs. broadcast) is the
/// transport's concern. Equal logical messages decode to equal structured
/// values, which is all the consensus core requires of the wire layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub from: NodeId,
    pub body: MessageBody,
}

impl ProtocolMessage {
    pub fn new(from: NodeId, body: MessageBody) -> Self {
        Self { from, body }
    }

    pub fn proposal(from: NodeId, proposal: ProposalMessage) -> Self {
        Self::new(from, MessageBody::Proposal(proposal))
    }

    pub fn round1_vote(from: NodeId, vote: Round1VoteMessage) -> Self {
        Self::new(from, MessageBody::Round1Vote(vote))
    }

    pub fn round2_vote(from: NodeId, vote: Round2VoteMessage) -> Self {
        Self::new(from, MessageBody::Round2Vote(vote))
    }

    pub fn decision(from: NodeId, decision: DecisionMessage) -> Self {
        Self::new(from, MessageBody::Decision(decision))
    }

    pub fn batch_fetch_request(from: NodeId, request: BatchFetchRequestMessage) -> Self {
        Self::new(from, MessageBody::BatchFetchRequest(request))
    }

    pub fn batch_fetch_response(from: NodeId, response: BatchFetchResponseMessage) -> Self {
        Self::new(from, MessageBody::BatchFetchResponse(response))
    }

    pub fn ping(from: NodeId, nonce: u64) -> Self {
        Self::new(from, MessageBody::Ping(PingMessage { node_id: from, nonce }))
    }

    pub fn pong(from: NodeId, nonce: u64) -> Self {
        Self::new(from, MessageBody::Pong(PongMessage { node_id: from, nonce }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    Proposal(ProposalMessage),
    Round1Vote(Round1VoteMessage),
    Round2Vote(Round2VoteMessage),
    Decision(DecisionMessage),
    BatchFetchRequest(BatchFetchRequestMessage),
    BatchFetchResponse(BatchFetchResponseMessage),
    Ping(PingMessage),
    Pong(PongMessage),
}

/// Announces that `node_id` proposes the batch identified by
/// `correlation_id` for `slot`. At most one proposal per node per slot.
///
/// The batch body travels separately: peers that lack it request it by
/// correlation ID from the proposer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalMessage {
    pub slot: Slot,
    pub node_id: NodeId,
    pub correlation_id: CorrelationId,
}

/// A node's preliminary binary signal for one phase. Never `VQuestion`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round1VoteMessage {
    pub slot: Slot,
    pub phase: Phase,
    pub node_id: NodeId,
    pub value: StateValue,
}

/// A node's refined signal derived from the round-1 quorum it observed.
/// May carry `VQuestion` iff no strict round-1 majority existed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round2VoteMessage {
    pub slot: Slot,
    pub phase: Phase,
    pub node_id: NodeId,
    pub value: StateValue,
}

/// Gossiped once a node decides a slot, to speed catch-up. Absorbing and
/// idempotent at the receiver. `correlation_id` is present for `V1`
/// decisions whose value is known to the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionMessage {
    pub slot: Slot,
    pub value: StateValue,
    pub correlation_id: Option<CorrelationId>,
}

/// Asks the receiver for the body of the batch with `correlation_id`;
/// `from_node` is the requester the response should be sent to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFetchRequestMessage {
    pub correlation_id: CorrelationId,
    pub from_node: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFetchResponseMessage {
    pub correlation_id: CorrelationId,
    pub commands: Vec<Command>,
}

/// Liveness probe; elicits a `Pong` carrying the same nonce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingMessage {
    pub node_id: NodeId,
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PongMessage {
    pub node_id: NodeId,
    pub nonce: u64,
}
