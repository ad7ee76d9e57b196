use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use concord_core::batching::{BatchPolicy, Batcher};
use concord_core::messages::{
    BatchFetchRequestMessage, BatchFetchResponseMessage, DecisionMessage, MessageBody,
    ProposalMessage, ProtocolMessage, Round1VoteMessage, Round2VoteMessage,
};
use concord_core::{
    Batch, ClusterConfig, ClusterEvent, ClusterNetwork, CorrelationId, NodeId, QuorumState,
    Result, Slot, StateValue, Validator,
};

use crate::config::ConsensusConfig;
use crate::sequencer::{CommitReceiver, CommitSequencer, Committed, DecisionSender};
use crate::slot::{SlotEffect, SlotState};
use crate::state::{EngineCommand, EngineCommandReceiver, EngineStats, RabiaHandle};

/// Outbound traffic produced while handling one input, sent after the
/// state mutation completes.
enum Outgoing {
    Broadcast(ProtocolMessage),
    Send(NodeId, ProtocolMessage),
}

/// The consensus engine: one task owning every live slot's state.
///
/// All slot reads and writes happen on this task, which is the per-slot
/// serialization domain; ordered commit runs in the separate sequencer
/// task. Inbound messages, command submissions, cluster events, and the
/// timeout tick are multiplexed by the run loop.
pub struct RabiaCore<N: ClusterNetwork> {
    cluster: ClusterConfig,
    config: ConsensusConfig,
    network: Arc<N>,
    command_rx: EngineCommandReceiver,
    inbound_rx: mpsc::UnboundedReceiver<ProtocolMessage>,
    events_rx: broadcast::Receiver<ClusterEvent>,
    sequencer: Option<CommitSequencer>,
    decisions_tx: DecisionSender,

    slots: HashMap<Slot, SlotState>,
    /// First local sighting of each slot, for the valueless-activation
    /// grace period.
    first_seen: HashMap<Slot, Instant>,
    /// Batch bodies by identity, own and fetched.
    batches: HashMap<CorrelationId, Batch>,
    /// Bodies we still need, with the slots whose commit they block.
    awaiting_body: HashMap<CorrelationId, BTreeSet<Slot>>,
    /// Last node known to hold each body.
    fetch_hints: HashMap<CorrelationId, NodeId>,
    /// Own batches not yet bound to a slot.
    pending_own: VecDeque<Batch>,
    batcher: Batcher,

    /// Lowest locally-undecided slot; the only one this node drives.
    active_slot: Slot,
    has_quorum: bool,
    live_count: usize,
    events_open: bool,
    inbound_open: bool,
    stats: EngineStats,
}

impl<N: ClusterNetwork + 'static> RabiaCore<N> {
    /// Builds the engine plus its handle and the ordered commit stream.
    ///
    /// `inbound_rx` is the dispatcher channel fed by the transport;
    /// `events_rx` subscribes to the topology manager's event bus.
    pub fn new(
        cluster: ClusterConfig,
        config: ConsensusConfig,
        network: Arc<N>,
        inbound_rx: mpsc::UnboundedReceiver<ProtocolMessage>,
        events_rx: broadcast::Receiver<ClusterEvent>,
    ) -> Result<(Self, RabiaHandle, CommitReceiver)> {
        config.validate()?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (sequencer, decisions_tx, commits_rx) = CommitSequencer::new();
        let batcher = Batcher::new(BatchPolicy {
            max_batch_size: config.max_batch_size,
            max_batch_delay: config.max_batch_delay,
        });

        let engine = Self {
            cluster,
            config,
            network,
            command_rx,
            inbound_rx,
            events_rx,
            sequencer: Some(sequencer),
            decisions_tx,
            slots: HashMap::new(),
            first_seen: HashMap::new(),
            batches: HashMap::new(),
            awaiting_body: HashMap::new(),
            fetch_hints: HashMap::new(),
            pending_own: VecDeque::new(),
            batcher,
            active_slot: Slot::ZERO,
            has_quorum: false,
            live_count: 1,
            events_open: true,
            inbound_open: true,
            stats: EngineStats::default(),
        };
        Ok((engine, RabiaHandle::new(command_tx), commits_rx))
    }

    /// Runs until shutdown is requested or every input channel closes.
    pub async fn run(mut self) -> Result<()> {
        info!("starting consensus engine for node {}", self.cluster.self_id);

        if let Some(sequencer) = self.sequencer.take() {
            tokio::spawn(sequencer.run());
        }

        let mut phase_tick = interval(self.config.phase_timeout);
        let mut batch_tick = interval(self.config.max_batch_delay.max(Duration::from_millis(1)));

        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(EngineCommand::Shutdown) | None => break,
                        Some(command) => self.on_command(command).await,
                    }
                }
                message = self.inbound_rx.recv(), if self.inbound_open => {
                    match message {
                        Some(message) => self.on_message(message).await,
                        None => self.inbound_open = false,
                    }
                }
                event = self.events_rx.recv(), if self.events_open => {
                    match event {
                        Ok(event) => self.on_cluster_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("engine lagged {} cluster events", missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => self.events_open = false,
                    }
                }
                _ = phase_tick.tick() => self.on_phase_tick().await,
                _ = batch_tick.tick() => self.on_batch_tick().await,
            }
        }

        // Outstanding proposals are abandoned and per-slot state discarded.
        self.slots.clear();
        self.pending_own.clear();
        info!("consensus engine for node {} stopped", self.cluster.self_id);
        Ok(())
    }

    async fn on_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Submit { commands, ack } => {
                if !self.has_quorum {
                    let _ = ack.send(Err(concord_core::ConsensusError::QuorumNotAvailable {
                        current: self.live_count,
                        required: self.cluster.quorum_size,
                    }));
                    return;
                }
                for command in commands {
                    if let Some(batch) = self.batcher.push(command) {
                        self.pending_own.push_back(batch);
                    }
                }
                let _ = ack.send(Ok(()));
                let mut outbox = Vec::new();
                self.advance_cycle(&mut outbox);
                self.flush(outbox).await;
            }
            EngineCommand::GetStats(tx) => {
                let _ = tx.send(self.stats);
            }
            EngineCommand::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    async fn on_message(&mut self, message: ProtocolMessage) {
        if let Err(e) = message.validate() {
            error!("invalid message from {}: {}", message.from, e);
            self.stats.protocol_violations += 1;
            return;
        }
        let from = message.from;
        match message.body {
            MessageBody::Proposal(proposal) => self.on_proposal(proposal).await,
            MessageBody::Round1Vote(vote) => self.on_round1(vote).await,
            MessageBody::Round2Vote(vote) => self.on_round2(vote).await,
            MessageBody::Decision(decision) => self.on_decision(from, decision).await,
            MessageBody::BatchFetchRequest(request) => self.on_fetch_request(request).await,
            MessageBody::BatchFetchResponse(response) => self.on_fetch_response(response).await,
            // Liveness traffic is consumed by the transport layer.
            MessageBody::Ping(_) | MessageBody::Pong(_) => {}
        }
    }

    async fn on_proposal(&mut self, proposal: ProposalMessage) {
        debug!(
            "candidate from {} for slot {} ({})",
            proposal.node_id, proposal.slot, proposal.correlation_id
        );
        self.touch_slot(proposal.slot)
            .observe_candidate(proposal.node_id, proposal.correlation_id);
        self.drain_counters(proposal.slot);

        let mut outbox = Vec::new();
        if !self.batches.contains_key(&proposal.correlation_id) {
            self.fetch_hints
                .insert(proposal.correlation_id, proposal.node_id);
            self.queue_fetch(proposal.correlation_id, Some(proposal.node_id), &mut outbox);
        }
        self.advance_cycle(&mut outbox);
        self.flush(outbox).await;
    }

    async fn on_round1(&mut self, vote: Round1VoteMessage) {
        let effects = self
            .touch_slot(vote.slot)
            .record_round1(vote.node_id, vote.phase, vote.value);
        self.pump(vote.slot, effects, true).await;
    }

    async fn on_round2(&mut self, vote: Round2VoteMessage) {
        let effects = self
            .touch_slot(vote.slot)
            .record_round2(vote.node_id, vote.phase, vote.value);
        self.pump(vote.slot, effects, true).await;
    }

    async fn on_decision(&mut self, from: NodeId, decision: DecisionMessage) {
        debug!(
            "decision gossip from {} for slot {}: {}",
            from, decision.slot, decision.value
        );
        if let Some(cid) = decision.correlation_id {
            // The sender decided with this value, so it likely holds the body.
            self.fetch_hints.entry(cid).or_insert(from);
        }
        let effects = self
            .touch_slot(decision.slot)
            .observe_decision(decision.value, decision.correlation_id);
        // Absorbed decisions are not re-gossiped.
        self.pump(decision.slot, effects, false).await;
    }

    async fn on_fetch_request(&mut self, request: BatchFetchRequestMessage) {
        match self.batches.get(&request.correlation_id) {
            Some(batch) => {
                let response = ProtocolMessage::batch_fetch_response(
                    self.cluster.self_id,
                    BatchFetchResponseMessage {
                        correlation_id: request.correlation_id,
                        commands: batch.commands.clone(),
                    },
                );
                self.network.send_to(request.from_node, response).await;
            }
            None => debug!(
                "no body for fetch of {} from {}",
                request.correlation_id, request.from_node
            ),
        }
    }

    async fn on_fetch_response(&mut self, response: BatchFetchResponseMessage) {
        if self.batches.contains_key(&response.correlation_id) {
            return;
        }
        debug!("batch body for {} arrived", response.correlation_id);
        self.batches.insert(
            response.correlation_id,
            Batch::with_correlation_id(response.correlation_id, response.commands),
        );

        let mut outbox = Vec::new();
        if let Some(blocked) = self.awaiting_body.remove(&response.correlation_id) {
            for slot in blocked {
                self.emit_commit_if_ready(slot, &mut outbox);
            }
        }
        // The body may be what the active slot was waiting on to vote V1.
        self.advance_cycle(&mut outbox);
        self.flush(outbox).await;
    }

    async fn on_cluster_event(&mut self, event: ClusterEvent) {
        match event {
            ClusterEvent::Quorum(QuorumState::Established) => {
                info!("quorum established; consensus may progress");
                self.has_quorum = true;
                let mut outbox = Vec::new();
                self.advance_cycle(&mut outbox);
                self.flush(outbox).await;
            }
            ClusterEvent::Quorum(QuorumState::Disappeared) => {
                warn!("quorum disappeared; pausing proposals");
                self.has_quorum = false;
            }
            ClusterEvent::NodeAdded { topology, .. }
            | ClusterEvent::NodeRemoved { topology, .. }
            | ClusterEvent::NodeDown { topology, .. } => {
                self.live_count = topology.len();
            }
        }
    }

    /// Timeout tick: valueless activation after the grace period, vote
    /// re-broadcast for the stuck phase, and re-issue of pending fetches.
    async fn on_phase_tick(&mut self) {
        if !self.has_quorum {
            return;
        }
        let mut outbox = Vec::new();

        let active = self.active_slot;
        let (exists, started, decided) = match self.slots.get(&active) {
            Some(state) => (true, state.is_started(), state.is_decided()),
            None => (false, false, false),
        };
        if exists && !decided {
            if !started {
                let unpinned = self
                    .slots
                    .get(&active)
                    .map(|s| s.pinned().is_none())
                    .unwrap_or(false);
                let grace_over = self
                    .first_seen
                    .get(&active)
                    .map(|t| t.elapsed() >= self.config.phase_timeout)
                    .unwrap_or(false);
                if unpinned && grace_over {
                    // The candidate exchange pinned nothing in time: vote
                    // "no value yet".
                    let effects = self
                        .slots
                        .get_mut(&active)
                        .map(|s| s.activate(StateValue::V0))
                        .unwrap_or_default();
                    self.collect_effects(active, effects, true, &mut outbox);
                    self.drain_counters(active);
                    self.emit_commit_if_ready(active, &mut outbox);
                }
            } else {
                let effects = self
                    .slots
                    .get(&active)
                    .map(|s| s.rebroadcast_votes())
                    .unwrap_or_default();
                if !effects.is_empty() {
                    debug!("re-broadcasting votes for stuck slot {}", active);
                }
                self.collect_effects(active, effects, false, &mut outbox);
                // The candidate announcement is repeated too; receivers
                // treat the duplicate as a no-op.
                let own = self.slots.get(&active).and_then(|s| s.own_candidate());
                if let Some(cid) = own {
                    self.queue_announcement(active, cid, &mut outbox);
                }
            }
        }

        // Re-fetch pending bodies from everyone: the original holder may
        // be the node that crashed.
        let pending: Vec<CorrelationId> = self.awaiting_body.keys().copied().collect();
        for cid in pending {
            self.queue_fetch(cid, None, &mut outbox);
        }

        self.prune_retired_slots();
        self.advance_cycle(&mut outbox);
        self.flush(outbox).await;
    }

    /// Drops committed slots that fell behind the idempotence window. Late
    /// messages for pruned slots recreate empty state and are answered
    /// through decision gossip rather than the archived record.
    fn prune_retired_slots(&mut self) {
        let horizon = self.config.max_slot_history as u64;
        if self.active_slot.value() <= horizon {
            return;
        }
        let cutoff = Slot::new(self.active_slot.value() - horizon);
        let before = self.slots.len();
        self.slots
            .retain(|slot, state| *slot >= cutoff || !state.commit_emitted);
        let slots = &self.slots;
        self.first_seen
            .retain(|slot, _| *slot >= cutoff || slots.contains_key(slot));
        let removed = before - self.slots.len();
        if removed > 0 {
            debug!("pruned {} retired slots below {}", removed, cutoff);
        }
    }

    async fn on_batch_tick(&mut self) {
        if let Some(batch) = self.batcher.flush_due() {
            self.pending_own.push_back(batch);
            let mut outbox = Vec::new();
            self.advance_cycle(&mut outbox);
            self.flush(outbox).await;
        }
    }

    /// Applies effects for one slot, then settles commits and the active
    /// boundary, then sends the produced traffic.
    async fn pump(&mut self, slot_idx: Slot, effects: Vec<SlotEffect>, gossip: bool) {
        let mut outbox = Vec::new();
        self.collect_effects(slot_idx, effects, gossip, &mut outbox);
        self.drain_counters(slot_idx);
        self.emit_commit_if_ready(slot_idx, &mut outbox);
        self.advance_cycle(&mut outbox);
        self.flush(outbox).await;
    }

    /// Turns slot effects into outbound messages and counters.
    fn collect_effects(
        &mut self,
        slot_idx: Slot,
        effects: Vec<SlotEffect>,
        gossip: bool,
        outbox: &mut Vec<Outgoing>,
    ) {
        let self_id = self.cluster.self_id;
        for effect in effects {
            match effect {
                SlotEffect::CastRound1 { phase, value } => {
                    outbox.push(Outgoing::Broadcast(ProtocolMessage::round1_vote(
                        self_id,
                        Round1VoteMessage {
                            slot: slot_idx,
                            phase,
                            node_id: self_id,
                            value,
                        },
                    )));
                }
                SlotEffect::CastRound2 { phase, value } => {
                    outbox.push(Outgoing::Broadcast(ProtocolMessage::round2_vote(
                        self_id,
                        Round2VoteMessage {
                            slot: slot_idx,
                            phase,
                            node_id: self_id,
                            value,
                        },
                    )));
                }
                SlotEffect::Decided(decision) => {
                    self.stats.decided_slots += 1;
                    if gossip {
                        outbox.push(Outgoing::Broadcast(ProtocolMessage::decision(
                            self_id,
                            DecisionMessage {
                                slot: slot_idx,
                                value: decision.value,
                                correlation_id: decision.correlation_id,
                            },
                        )));
                    }
                }
            }
        }
    }

    /// Retires decided slots at the active boundary and drives the next
    /// one through the candidate exchange: binds a pending own batch,
    /// echoes a candidate whose body is in hand, and votes V1 once the
    /// exchange pins a value.
    fn advance_cycle(&mut self, outbox: &mut Vec<Outgoing>) {
        loop {
            if let Some(state) = self.slots.get(&self.active_slot) {
                if state.is_decided() {
                    self.retire_active(outbox);
                    self.active_slot = self.active_slot.next();
                    continue;
                }
            }

            if !self.has_quorum {
                break;
            }

            let active = self.active_slot;
            let (has_candidate, pinned, started) = match self.slots.get(&active) {
                Some(state) => (
                    state.own_candidate().is_some(),
                    state.pinned(),
                    state.is_started(),
                ),
                None => (false, None, false),
            };

            // Bind a pending own batch as this node's candidate, unless the
            // exchange already pinned another value for this slot.
            if !has_candidate && pinned.is_none() && !self.pending_own.is_empty() {
                let batch = self.pending_own.pop_front().expect("nonempty queue");
                let cid = batch.correlation_id;
                self.batches.insert(cid, batch);
                let accepted = self.touch_slot(active).announce_candidate(cid, true);
                if !accepted {
                    // The slot decided in the meantime; keep the batch queued.
                    if let Some(batch) = self.batches.get(&cid).cloned() {
                        self.pending_own.push_front(batch);
                    }
                    continue;
                }
                self.queue_announcement(active, cid, outbox);
                self.stats.proposals_sent += 1;
                debug!("proposing batch {} for slot {}", cid, active);
                continue;
            }

            // Echo a candidate whose body is in hand, preferring the pinned
            // value. An echo certifies possession of the body, so a pinned
            // value is always fetchable from a majority.
            if !has_candidate {
                let echo = self.slots.get(&active).and_then(|state| {
                    pinned
                        .filter(|cid| self.batches.contains_key(cid))
                        .or_else(|| {
                            state
                                .observed_candidates()
                                .map(|(_, cid)| cid)
                                .find(|cid| self.batches.contains_key(cid))
                        })
                });
                if let Some(cid) = echo {
                    if self.touch_slot(active).announce_candidate(cid, false) {
                        self.queue_announcement(active, cid, outbox);
                        self.stats.candidate_echoes += 1;
                        debug!("echoing candidate {} for slot {}", cid, active);
                        continue;
                    }
                }
            }

            // Vote V1 once a majority of announcers agree on one value.
            if !started && pinned.is_some() {
                let effects = self
                    .slots
                    .get_mut(&active)
                    .map(|s| s.activate(StateValue::V1))
                    .unwrap_or_default();
                self.collect_effects(active, effects, true, outbox);
                self.drain_counters(active);
                self.emit_commit_if_ready(active, outbox);
                continue;
            }

            break;
        }
    }

    fn queue_announcement(&mut self, slot_idx: Slot, cid: CorrelationId, outbox: &mut Vec<Outgoing>) {
        let self_id = self.cluster.self_id;
        outbox.push(Outgoing::Broadcast(ProtocolMessage::proposal(
            self_id,
            ProposalMessage {
                slot: slot_idx,
                node_id: self_id,
                correlation_id: cid,
            },
        )));
    }

    /// Requeues an own batch the decision passed over, then emits the
    /// retiring slot's commit if it is complete. Echoed candidates are not
    /// requeued; only batches this node originated.
    fn retire_active(&mut self, outbox: &mut Vec<Outgoing>) {
        let slot_idx = self.active_slot;
        let (own, decided_cid) = match self.slots.get(&slot_idx) {
            Some(state) => (
                state.own_origin(),
                state.decision().and_then(|d| d.correlation_id),
            ),
            None => (None, None),
        };
        if let Some(own_cid) = own {
            if Some(own_cid) != decided_cid {
                if let Some(batch) = self.batches.get(&own_cid).cloned() {
                    debug!(
                        "requeueing batch {} passed over at slot {}",
                        own_cid, slot_idx
                    );
                    self.pending_own.push_front(batch);
                }
            }
        }
        self.emit_commit_if_ready(slot_idx, outbox);
    }

    /// Feeds a decided slot into the commit sequencer once its value is
    /// materialized; V1 decisions with a missing body queue a fetch.
    fn emit_commit_if_ready(&mut self, slot_idx: Slot, outbox: &mut Vec<Outgoing>) {
        let Some(state) = self.slots.get(&slot_idx) else {
            return;
        };
        if state.commit_emitted {
            return;
        }
        let Some(decision) = state.decision().copied() else {
            return;
        };

        match decision.value {
            StateValue::V0 => {
                self.send_commit(slot_idx, None);
            }
            StateValue::V1 => {
                let Some(cid) = decision.correlation_id else {
                    // Value unknown; adopted later from decision gossip.
                    return;
                };
                match self.batches.get(&cid).cloned() {
                    Some(batch) => self.send_commit(slot_idx, Some(batch)),
                    None => {
                        self.awaiting_body.entry(cid).or_default().insert(slot_idx);
                        let hint = self
                            .fetch_hints
                            .get(&cid)
                            .copied()
                            .or_else(|| self.slots.get(&slot_idx).and_then(|s| s.announcer_of(cid)));
                        self.queue_fetch(cid, hint, outbox);
                    }
                }
            }
            StateValue::VQuestion => {
                error!("slot {} holds a V? decision; refusing to commit", slot_idx);
                self.stats.protocol_violations += 1;
            }
        }
    }

    fn send_commit(&mut self, slot_idx: Slot, batch: Option<Batch>) {
        if self
            .decisions_tx
            .send(Committed {
                slot: slot_idx,
                batch,
            })
            .is_err()
        {
            warn!("commit sequencer is gone; dropping commit for slot {}", slot_idx);
            return;
        }
        if let Some(state) = self.slots.get_mut(&slot_idx) {
            state.commit_emitted = true;
        }
    }

    fn queue_fetch(&mut self, cid: CorrelationId, hint: Option<NodeId>, outbox: &mut Vec<Outgoing>) {
        let request = ProtocolMessage::batch_fetch_request(
            self.cluster.self_id,
            BatchFetchRequestMessage {
                correlation_id: cid,
                from_node: self.cluster.self_id,
            },
        );
        self.stats.batch_fetches_sent += 1;
        match hint {
            Some(node) => outbox.push(Outgoing::Send(node, request)),
            None => outbox.push(Outgoing::Broadcast(request)),
        }
    }

    fn touch_slot(&mut self, slot_idx: Slot) -> &mut SlotState {
        self.first_seen.entry(slot_idx).or_insert_with(Instant::now);
        let self_id = self.cluster.self_id;
        let quorum = self.cluster.quorum_size;
        self.slots
            .entry(slot_idx)
            .or_insert_with(|| SlotState::new(slot_idx, self_id, quorum))
    }

    fn drain_counters(&mut self, slot_idx: Slot) {
        if let Some(state) = self.slots.get_mut(&slot_idx) {
            let counters = state.take_counters();
            self.stats.stale_messages += counters.stale_dropped;
            self.stats.protocol_violations += counters.violations;
            self.stats.coin_flips += counters.coin_flips;
        }
    }

    async fn flush(&mut self, outbox: Vec<Outgoing>) {
        for outgoing in outbox {
            match outgoing {
                Outgoing::Broadcast(message) => self.network.broadcast(message).await,
                Outgoing::Send(node, message) => self.network.send_to(node, message).await,
            }
        }
    }
}
