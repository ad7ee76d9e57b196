//! Per-slot phase state machine.
//!
//! One `SlotState` tracks a single consensus instance through its round-1 /
//! round-2 / coin phases. The type is pure: observations go in, effects come
//! out, and the engine task performs the actual I/O. All mutation happens
//! from the engine task, which is the slot's serialization domain.
//!
//! Value agreement rides on the candidate exchange: every participating
//! node announces exactly one candidate batch per slot (its own, or an
//! echo of one it holds the body for), and a value counts as *pinned* only
//! when a majority of the expected cluster announced the same correlation
//! ID. Two values can never both reach that count, so every V1 decision
//! across the cluster resolves to the same batch.

use concord_core::coin::common_coin;
use concord_core::{CorrelationId, NodeId, Phase, Slot, StateValue};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error, warn};

/// Side effects requested by the state machine, executed by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotEffect {
    /// Broadcast this node's round-1 vote for `phase`.
    CastRound1 { phase: Phase, value: StateValue },
    /// Broadcast this node's round-2 vote for `phase`.
    CastRound2 { phase: Phase, value: StateValue },
    /// The slot decided; gossip and feed the commit pipeline.
    Decided(SlotDecision),
}

/// Terminal outcome of a slot's binary agreement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotDecision {
    pub value: StateValue,
    /// The pinned batch identity; present for V1 decisions when this node
    /// observed the pinning majority itself.
    pub correlation_id: Option<CorrelationId>,
    pub phase: Phase,
}

/// Counters for dropped and anomalous observations, drained by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SlotCounters {
    pub stale_dropped: u64,
    pub violations: u64,
    pub coin_flips: u64,
}

#[derive(Debug)]
pub struct SlotState {
    slot: Slot,
    self_id: NodeId,
    quorum_size: usize,
    /// The candidate this node announced for the slot, if any.
    own_candidate: Option<CorrelationId>,
    /// Whether the announced candidate is this node's own batch rather
    /// than an echo of a peer's.
    own_is_origin: bool,
    /// Every candidate announcement observed for the slot, own included,
    /// keyed by announcer.
    candidates: BTreeMap<NodeId, CorrelationId>,
    current_phase: Phase,
    /// Whether this node is driving the slot (casting its own votes).
    started: bool,
    round1: HashMap<Phase, BTreeMap<NodeId, StateValue>>,
    round2: HashMap<Phase, BTreeMap<NodeId, StateValue>>,
    own_round1: HashMap<Phase, StateValue>,
    own_round2: HashMap<Phase, StateValue>,
    coin: HashMap<Phase, StateValue>,
    decision: Option<SlotDecision>,
    /// Set once the decision has been handed to the commit pipeline.
    pub commit_emitted: bool,
    counters: SlotCounters,
}

impl SlotState {
    pub fn new(slot: Slot, self_id: NodeId, quorum_size: usize) -> Self {
        Self {
            slot,
            self_id,
            quorum_size,
            own_candidate: None,
            own_is_origin: false,
            candidates: BTreeMap::new(),
            current_phase: Phase::ZERO,
            started: false,
            round1: HashMap::new(),
            round2: HashMap::new(),
            own_round1: HashMap::new(),
            own_round2: HashMap::new(),
            coin: HashMap::new(),
            decision: None,
            commit_emitted: false,
            counters: SlotCounters::default(),
        }
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn current_phase(&self) -> Phase {
        self.current_phase
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_decided(&self) -> bool {
        self.decision.is_some()
    }

    pub fn decision(&self) -> Option<&SlotDecision> {
        self.decision.as_ref()
    }

    /// The candidate this node announced, origin or echo.
    pub fn own_candidate(&self) -> Option<CorrelationId> {
        self.own_candidate
    }

    /// This node's own batch bound to the slot, if the announcement was an
    /// origin proposal rather than an echo.
    pub fn own_origin(&self) -> Option<CorrelationId> {
        self.own_is_origin.then_some(self.own_candidate).flatten()
    }

    /// Every candidate announcement observed for this slot, in announcer
    /// order.
    pub fn observed_candidates(&self) -> impl Iterator<Item = (NodeId, CorrelationId)> + '_ {
        self.candidates.iter().map(|(node, cid)| (*node, *cid))
    }

    /// An announcer of `correlation_id`, if any; announcers hold the batch
    /// body, so this doubles as a fetch hint.
    pub fn announcer_of(&self, correlation_id: CorrelationId) -> Option<NodeId> {
        self.candidates
            .iter()
            .find(|(_, cid)| **cid == correlation_id)
            .map(|(node, _)| *node)
    }

    /// The value pinned by the candidate exchange: the correlation ID a
    /// majority of the expected cluster announced. At most one value can
    /// ever qualify, since each node announces once.
    pub fn pinned(&self) -> Option<CorrelationId> {
        let mut tally: HashMap<CorrelationId, usize> = HashMap::new();
        for cid in self.candidates.values() {
            *tally.entry(*cid).or_insert(0) += 1;
        }
        tally
            .into_iter()
            .find(|(_, count)| *count >= self.quorum_size)
            .map(|(cid, _)| cid)
    }

    /// Drains the drop/violation counters accumulated since the last call.
    pub fn take_counters(&mut self) -> SlotCounters {
        std::mem::take(&mut self.counters)
    }

    /// Registers this node's candidate announcement, own batch (`origin`)
    /// or echo. At most one per slot; a second registration is ignored.
    pub fn announce_candidate(&mut self, correlation_id: CorrelationId, origin: bool) -> bool {
        if self.own_candidate.is_some() || self.decision.is_some() {
            return false;
        }
        self.own_candidate = Some(correlation_id);
        self.own_is_origin = origin;
        self.candidates.insert(self.self_id, correlation_id);
        true
    }

    /// Records a peer's candidate announcement. Returns true when it is new.
    pub fn observe_candidate(&mut self, node: NodeId, correlation_id: CorrelationId) -> bool {
        match self.candidates.get(&node) {
            Some(existing) if *existing == correlation_id => false,
            Some(existing) => {
                error!(
                    "conflicting candidate from {} for slot {}: kept {}, dropped {}",
                    node, self.slot, existing, correlation_id
                );
                self.counters.violations += 1;
                false
            }
            None => {
                self.candidates.insert(node, correlation_id);
                true
            }
        }
    }

    /// Begins driving the slot: casts the phase-0 round-1 vote and advances
    /// as far as buffered votes allow.
    ///
    /// The caller picks `initial`: V1 when the candidate exchange pinned a
    /// value ("I want some value"), V0 otherwise ("I see no value yet").
    /// `initial` must be binary.
    pub fn activate(&mut self, initial: StateValue) -> Vec<SlotEffect> {
        if self.started || self.decision.is_some() {
            return Vec::new();
        }
        debug_assert!(initial.is_binary());
        self.started = true;

        debug!("slot {} activated, initial round-1 vote {}", self.slot, initial);

        let mut effects = self.cast_round1(Phase::ZERO, initial);
        effects.extend(self.try_advance());
        effects
    }

    /// Records an inbound round-1 vote. Duplicates are idempotent,
    /// conflicts are dropped, votes for a decided slot are stale.
    pub fn record_round1(&mut self, node: NodeId, phase: Phase, value: StateValue) -> Vec<SlotEffect> {
        if self.decision.is_some() {
            self.counters.stale_dropped += 1;
            return Vec::new();
        }
        if !value.is_binary() {
            error!(
                "round-1 vote from {} for slot {} phase {} carries V?",
                node, self.slot, phase
            );
            self.counters.violations += 1;
            return Vec::new();
        }
        if !self.record_vote(Round::One, node, phase, value) {
            return Vec::new();
        }
        if self.started {
            self.try_advance()
        } else {
            Vec::new()
        }
    }

    /// Records an inbound round-2 vote; same drop rules as round 1, except
    /// `VQuestion` is admissible here.
    pub fn record_round2(&mut self, node: NodeId, phase: Phase, value: StateValue) -> Vec<SlotEffect> {
        if self.decision.is_some() {
            self.counters.stale_dropped += 1;
            return Vec::new();
        }
        if !self.record_vote(Round::Two, node, phase, value) {
            return Vec::new();
        }
        if self.started {
            self.try_advance()
        } else {
            Vec::new()
        }
    }

    /// Absorbs a decision observed elsewhere (gossip or catch-up). The slot
    /// fast-forwards without completing its local phases. Idempotent; a
    /// contradicting decision is a protocol violation and is dropped.
    pub fn observe_decision(
        &mut self,
        value: StateValue,
        correlation_id: Option<CorrelationId>,
    ) -> Vec<SlotEffect> {
        if let Some(existing) = &mut self.decision {
            if existing.value != value {
                error!(
                    "conflicting decision for slot {}: recorded {}, received {}",
                    self.slot, existing.value, value
                );
                self.counters.violations += 1;
            } else if existing.correlation_id.is_none() && correlation_id.is_some() {
                // Late-arriving value for a V1 decided without a known pin.
                existing.correlation_id = correlation_id;
            }
            return Vec::new();
        }

        let correlation_id = match value {
            StateValue::V1 => correlation_id.or_else(|| self.pinned()),
            _ => None,
        };
        let decision = SlotDecision {
            value,
            correlation_id,
            phase: self.current_phase,
        };
        self.decision = Some(decision);
        vec![SlotEffect::Decided(decision)]
    }

    /// The votes this node last cast, for idempotent re-broadcast when a
    /// phase stalls.
    pub fn rebroadcast_votes(&self) -> Vec<SlotEffect> {
        if self.decision.is_some() || !self.started {
            return Vec::new();
        }
        let phase = self.current_phase;
        let mut effects = Vec::new();
        if let Some(value) = self.own_round1.get(&phase) {
            effects.push(SlotEffect::CastRound1 { phase, value: *value });
        }
        if let Some(value) = self.own_round2.get(&phase) {
            effects.push(SlotEffect::CastRound2 { phase, value: *value });
        }
        effects
    }

    fn record_vote(&mut self, round: Round, node: NodeId, phase: Phase, value: StateValue) -> bool {
        let votes = match round {
            Round::One => self.round1.entry(phase).or_default(),
            Round::Two => self.round2.entry(phase).or_default(),
        };
        match votes.get(&node) {
            Some(existing) if *existing == value => false,
            Some(existing) => {
                error!(
                    "conflicting {} vote from {} at slot {} phase {}: kept {}, dropped {}",
                    round, node, self.slot, phase, existing, value
                );
                self.counters.violations += 1;
                false
            }
            None => {
                votes.insert(node, value);
                true
            }
        }
    }

    fn cast_round1(&mut self, phase: Phase, value: StateValue) -> Vec<SlotEffect> {
        if self.own_round1.contains_key(&phase) {
            return Vec::new();
        }
        self.own_round1.insert(phase, value);
        self.round1.entry(phase).or_default().insert(self.self_id, value);
        vec![SlotEffect::CastRound1 { phase, value }]
    }

    fn cast_round2(&mut self, phase: Phase, value: StateValue) -> Vec<SlotEffect> {
        if self.own_round2.contains_key(&phase) {
            return Vec::new();
        }
        self.own_round2.insert(phase, value);
        self.round2.entry(phase).or_default().insert(self.self_id, value);
        vec![SlotEffect::CastRound2 { phase, value }]
    }

    /// Runs the phase machine as far as the collected votes allow. May span
    /// several phases when buffered votes are already waiting.
    fn try_advance(&mut self) -> Vec<SlotEffect> {
        let mut effects = Vec::new();

        loop {
            if self.decision.is_some() {
                break;
            }
            let phase = self.current_phase;

            // Round 1 -> round 2: once a quorum of round-1 votes arrived,
            // the round-2 intent is the value backed by a majority of the
            // expected cluster, counted over everything collected. The
            // absolute threshold means V1 and V0 round-2 intents can never
            // coexist within one phase.
            if !self.own_round2.contains_key(&phase) {
                let collected = self.round1.get(&phase).map(|v| v.len()).unwrap_or(0);
                if collected >= self.quorum_size {
                    let intent = self.round2_intent(phase);
                    effects.extend(self.cast_round2(phase, intent));
                }
            }

            // Round 2 -> decision, adoption, or coin.
            let round2_count = self.round2.get(&phase).map(|v| v.len()).unwrap_or(0);
            if round2_count < self.quorum_size {
                break;
            }

            let votes = self.round2.get(&phase).expect("round-2 quorum present");
            let v1 = votes.values().filter(|v| **v == StateValue::V1).count();
            let v0 = votes.values().filter(|v| **v == StateValue::V0).count();

            // Deciding takes a majority of the expected cluster voting the
            // same way in round 2; a decided value is then visible in every
            // other node's quorum, which adopts it instead of coining.
            if v1 >= self.quorum_size {
                effects.extend(self.decide(StateValue::V1, phase));
                break;
            }
            if v0 >= self.quorum_size {
                effects.extend(self.decide(StateValue::V0, phase));
                break;
            }

            let next_vote = if v1 > 0 && v0 > 0 {
                // Impossible among correct peers once round-2 intents carry
                // the absolute threshold; treat as a faulty sender and fall
                // back to the shared coin.
                error!(
                    "slot {} phase {} carries both V1 and V0 round-2 votes",
                    self.slot, phase
                );
                self.counters.violations += 1;
                self.flip_coin(phase)
            } else if v1 > 0 {
                StateValue::V1
            } else if v0 > 0 {
                StateValue::V0
            } else {
                self.flip_coin(phase)
            };

            self.current_phase = phase.next();
            debug!(
                "slot {} phase {} undecided, next round-1 vote {} -> phase {}",
                self.slot, phase, next_vote, self.current_phase
            );
            effects.extend(self.cast_round1(self.current_phase, next_vote));
            // Loop: buffered votes for the new phase may let us advance
            // further immediately.
        }

        effects
    }

    fn flip_coin(&mut self, phase: Phase) -> StateValue {
        let flip = common_coin(self.slot, phase);
        self.coin.insert(phase, flip);
        self.counters.coin_flips += 1;
        flip
    }

    /// Round-2 intent: `v` iff at least a majority of the expected cluster
    /// voted `v` in round 1 among the collected votes, else `VQuestion`.
    fn round2_intent(&self, phase: Phase) -> StateValue {
        let votes = match self.round1.get(&phase) {
            Some(votes) => votes,
            None => return StateValue::VQuestion,
        };
        let v1 = votes.values().filter(|v| **v == StateValue::V1).count();
        let v0 = votes.values().filter(|v| **v == StateValue::V0).count();

        if v1 >= self.quorum_size {
            StateValue::V1
        } else if v0 >= self.quorum_size {
            StateValue::V0
        } else {
            StateValue::VQuestion
        }
    }

    fn decide(&mut self, value: StateValue, phase: Phase) -> Vec<SlotEffect> {
        let correlation_id = match value {
            StateValue::V1 => {
                let pinned = self.pinned();
                if pinned.is_none() {
                    warn!(
                        "slot {} decided V1 without observing the pin; awaiting catch-up",
                        self.slot
                    );
                }
                pinned
            }
            _ => None,
        };
        let decision = SlotDecision {
            value,
            correlation_id,
            phase,
        };
        self.decision = Some(decision);
        debug!("slot {} decided {} at phase {}", self.slot, value, phase);
        vec![SlotEffect::Decided(decision)]
    }
}

#[derive(Debug, Clone, Copy)]
enum Round {
    One,
    Two,
}

impl std::fmt::Display for Round {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Round::One => write!(f, "round-1"),
            Round::Two => write!(f, "round-2"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::coin::common_coin;
    use proptest::prelude::*;

    const QUORUM: usize = 2;

    fn node(n: u64) -> NodeId {
        NodeId::from(n)
    }

    /// A slot whose candidate exchange already pinned this node's own
    /// batch: the own announcement plus one echo.
    fn pinned_slot() -> (SlotState, CorrelationId) {
        let mut state = SlotState::new(Slot::ZERO, node(1), QUORUM);
        let cid = CorrelationId::new();
        assert!(state.announce_candidate(cid, true));
        assert!(state.observe_candidate(node(2), cid));
        assert_eq!(state.pinned(), Some(cid));
        (state, cid)
    }

    fn decided_of(effects: &[SlotEffect]) -> Option<SlotDecision> {
        effects.iter().find_map(|e| match e {
            SlotEffect::Decided(d) => Some(*d),
            _ => None,
        })
    }

    #[test]
    fn activation_casts_the_initial_round1_vote() {
        let (mut state, _) = pinned_slot();
        let effects = state.activate(StateValue::V1);
        assert_eq!(
            effects,
            vec![SlotEffect::CastRound1 {
                phase: Phase::ZERO,
                value: StateValue::V1
            }]
        );

        // A second activation is a no-op.
        assert!(state.activate(StateValue::V1).is_empty());
    }

    #[test]
    fn valueless_activation_votes_v0() {
        let mut state = SlotState::new(Slot::ZERO, node(1), QUORUM);
        let effects = state.activate(StateValue::V0);
        assert_eq!(
            effects,
            vec![SlotEffect::CastRound1 {
                phase: Phase::ZERO,
                value: StateValue::V0
            }]
        );
    }

    #[test]
    fn pin_requires_a_majority_of_announcers() {
        let mut state = SlotState::new(Slot::ZERO, node(3), QUORUM);
        let x = CorrelationId::new();
        let y = CorrelationId::new();

        // A lone announcement pins nothing.
        state.observe_candidate(node(1), x);
        assert_eq!(state.pinned(), None);

        // A one-one split pins nothing either.
        state.observe_candidate(node(2), y);
        assert_eq!(state.pinned(), None);

        // The echo that completes a majority pins its value.
        state.announce_candidate(x, false);
        assert_eq!(state.pinned(), Some(x));
    }

    #[test]
    fn decided_value_is_the_pinned_value() {
        // This node's own batch lost the exchange: the peers' value got
        // the majority, and the decision must resolve to it.
        let mut state = SlotState::new(Slot::ZERO, node(2), QUORUM);
        let own = CorrelationId::new();
        let other = CorrelationId::new();
        state.announce_candidate(own, true);
        state.observe_candidate(node(1), other);
        state.observe_candidate(node(3), other);
        assert_eq!(state.pinned(), Some(other));

        state.activate(StateValue::V1);
        state.record_round1(node(1), Phase::ZERO, StateValue::V1);
        let effects = state.record_round2(node(1), Phase::ZERO, StateValue::V1);
        let decision = decided_of(&effects).expect("decision");
        assert_eq!(decision.value, StateValue::V1);
        assert_eq!(decision.correlation_id, Some(other));
        assert_eq!(state.own_origin(), Some(own));
    }

    #[test]
    fn unanimous_v1_decides_in_one_phase() {
        let (mut state, cid) = pinned_slot();
        state.activate(StateValue::V1);

        // Peer's V1 completes the round-1 quorum; own round-2 V1 follows.
        let effects = state.record_round1(node(2), Phase::ZERO, StateValue::V1);
        assert!(effects.contains(&SlotEffect::CastRound2 {
            phase: Phase::ZERO,
            value: StateValue::V1
        }));

        // Peer's round-2 V1 completes the deciding majority.
        let effects = state.record_round2(node(2), Phase::ZERO, StateValue::V1);
        let decision = decided_of(&effects).expect("decision");
        assert_eq!(decision.value, StateValue::V1);
        assert_eq!(decision.correlation_id, Some(cid));
        assert_eq!(decision.phase, Phase::ZERO);
        assert!(state.is_decided());
    }

    #[test]
    fn unanimous_v0_decides_no_value() {
        let mut state = SlotState::new(Slot::ZERO, node(1), QUORUM);
        state.activate(StateValue::V0);

        state.record_round1(node(2), Phase::ZERO, StateValue::V0);
        let effects = state.record_round2(node(2), Phase::ZERO, StateValue::V0);
        let decision = decided_of(&effects).expect("decision");
        assert_eq!(decision.value, StateValue::V0);
        assert_eq!(decision.correlation_id, None);
    }

    #[test]
    fn split_round1_yields_question_intent() {
        // Quorum 2 of 3; own V1 plus peer V0 leaves neither value with a
        // cluster majority, so the round-2 vote must be V?.
        let (mut state, _) = pinned_slot();
        state.activate(StateValue::V1);

        let effects = state.record_round1(node(2), Phase::ZERO, StateValue::V0);
        assert!(effects.contains(&SlotEffect::CastRound2 {
            phase: Phase::ZERO,
            value: StateValue::VQuestion
        }));
    }

    #[test]
    fn round2_intent_needs_a_cluster_majority_not_a_collected_one() {
        // Quorum 3 of 5: two V1 votes are a majority of the collected
        // three but not of the cluster, so the intent stays V?.
        let mut state = SlotState::new(Slot::ZERO, node(1), 3);
        state.announce_candidate(CorrelationId::new(), true);
        state.activate(StateValue::V1);
        state.record_round1(node(2), Phase::ZERO, StateValue::V1);
        let effects = state.record_round1(node(3), Phase::ZERO, StateValue::V0);
        assert!(effects.contains(&SlotEffect::CastRound2 {
            phase: Phase::ZERO,
            value: StateValue::VQuestion
        }));
    }

    #[test]
    fn lone_round2_v1_adopts_instead_of_deciding() {
        // A single decisive vote in the quorum must not decide: the node
        // adopts V1 for the next phase and no coin is flipped.
        let (mut state, _) = pinned_slot();
        state.activate(StateValue::V1);
        state.record_round1(node(2), Phase::ZERO, StateValue::V1);
        assert_eq!(
            state.own_round2.get(&Phase::ZERO),
            Some(&StateValue::V1)
        );

        let effects = state.record_round2(node(2), Phase::ZERO, StateValue::VQuestion);
        assert!(decided_of(&effects).is_none());
        assert!(effects.contains(&SlotEffect::CastRound1 {
            phase: Phase::new(1),
            value: StateValue::V1
        }));
        assert_eq!(state.current_phase(), Phase::new(1));
        assert_eq!(state.take_counters().coin_flips, 0);
    }

    #[test]
    fn adopted_value_decides_in_the_next_phase() {
        let (mut state, cid) = pinned_slot();
        state.activate(StateValue::V1);
        state.record_round1(node(2), Phase::ZERO, StateValue::V1);
        state.record_round2(node(2), Phase::ZERO, StateValue::VQuestion);
        assert_eq!(state.current_phase(), Phase::new(1));

        // The peer adopted V1 too; phase 1 is unanimous and decides.
        state.record_round1(node(2), Phase::new(1), StateValue::V1);
        let effects = state.record_round2(node(2), Phase::new(1), StateValue::V1);
        let decision = decided_of(&effects).expect("decision");
        assert_eq!(decision.value, StateValue::V1);
        assert_eq!(decision.correlation_id, Some(cid));
    }

    #[test]
    fn question_quorum_flips_coin_and_advances() {
        let (mut state, _) = pinned_slot();
        state.activate(StateValue::V1);
        state.record_round1(node(2), Phase::ZERO, StateValue::V0);

        let effects = state.record_round2(node(2), Phase::ZERO, StateValue::VQuestion);
        let expected = common_coin(Slot::ZERO, Phase::ZERO);
        assert!(effects.contains(&SlotEffect::CastRound1 {
            phase: Phase::new(1),
            value: expected
        }));
        assert_eq!(state.current_phase(), Phase::new(1));
        assert!(!state.is_decided());
        assert_eq!(state.take_counters().coin_flips, 1);
    }

    #[test]
    fn mixed_binary_round2_votes_are_a_violation() {
        // Correct peers cannot produce both V1 and V0 round-2 votes in one
        // phase under the absolute intent threshold; the machine flags the
        // faulty sender and falls back to the coin.
        let mut state = SlotState::new(Slot::ZERO, node(1), 3);
        let cid = CorrelationId::new();
        state.announce_candidate(cid, true);
        state.observe_candidate(node(2), cid);
        state.observe_candidate(node(3), cid);
        state.activate(StateValue::V1);
        state.record_round1(node(2), Phase::ZERO, StateValue::V1);
        state.record_round1(node(3), Phase::ZERO, StateValue::V1);

        state.record_round2(node(2), Phase::ZERO, StateValue::V0);
        let effects = state.record_round2(node(3), Phase::ZERO, StateValue::VQuestion);
        assert!(decided_of(&effects).is_none());
        assert_eq!(state.current_phase(), Phase::new(1));
        let counters = state.take_counters();
        assert_eq!(counters.violations, 1);
        assert_eq!(counters.coin_flips, 1);
    }

    #[test]
    fn duplicate_votes_are_idempotent() {
        let (mut state, _) = pinned_slot();
        state.activate(StateValue::V1);

        let first = state.record_round1(node(2), Phase::ZERO, StateValue::V1);
        let second = state.record_round1(node(2), Phase::ZERO, StateValue::V1);
        assert!(!first.is_empty());
        assert!(second.is_empty());
        assert_eq!(state.take_counters().violations, 0);
    }

    #[test]
    fn conflicting_vote_from_same_sender_is_dropped() {
        let (mut state, _) = pinned_slot();
        state.activate(StateValue::V1);

        state.record_round1(node(2), Phase::ZERO, StateValue::V1);
        let effects = state.record_round1(node(2), Phase::ZERO, StateValue::V0);
        assert!(effects.is_empty());
        assert_eq!(state.take_counters().violations, 1);
    }

    #[test]
    fn votes_for_decided_slot_are_stale() {
        let (mut state, _) = pinned_slot();
        state.activate(StateValue::V1);
        state.record_round1(node(2), Phase::ZERO, StateValue::V1);
        state.record_round2(node(2), Phase::ZERO, StateValue::V1);
        assert!(state.is_decided());

        let effects = state.record_round1(node(3), Phase::ZERO, StateValue::V0);
        assert!(effects.is_empty());
        assert_eq!(state.take_counters().stale_dropped, 1);
    }

    #[test]
    fn question_round1_vote_is_a_violation() {
        let (mut state, _) = pinned_slot();
        state.activate(StateValue::V1);

        let effects = state.record_round1(node(2), Phase::ZERO, StateValue::VQuestion);
        assert!(effects.is_empty());
        assert_eq!(state.take_counters().violations, 1);
    }

    #[test]
    fn early_votes_are_buffered_until_activation() {
        let mut state = SlotState::new(Slot::new(1), node(1), QUORUM);
        assert!(state.record_round1(node(2), Phase::ZERO, StateValue::V0).is_empty());
        assert!(state.record_round2(node(2), Phase::ZERO, StateValue::V0).is_empty());
        assert!(!state.is_started());

        // Activation replays the buffered quorum: with own V0 the slot
        // reaches a V0 decision without further input.
        let effects = state.activate(StateValue::V0);
        let decision = decided_of(&effects).expect("decision from buffered votes");
        assert_eq!(decision.value, StateValue::V0);
    }

    #[test]
    fn observed_decision_is_absorbing() {
        let mut state = SlotState::new(Slot::ZERO, node(1), QUORUM);
        let cid = CorrelationId::new();

        let effects = state.observe_decision(StateValue::V1, Some(cid));
        let decision = decided_of(&effects).expect("absorbed decision");
        assert_eq!(decision.correlation_id, Some(cid));

        // Replays are idempotent.
        assert!(state.observe_decision(StateValue::V1, Some(cid)).is_empty());

        // A contradicting decision never overwrites.
        assert!(state.observe_decision(StateValue::V0, None).is_empty());
        assert_eq!(state.decision().unwrap().value, StateValue::V1);
        assert_eq!(state.take_counters().violations, 1);
    }

    #[test]
    fn decision_without_value_adopts_late_correlation_id() {
        let mut state = SlotState::new(Slot::ZERO, node(1), QUORUM);
        state.observe_decision(StateValue::V1, None);
        assert_eq!(state.decision().unwrap().correlation_id, None);

        let cid = CorrelationId::new();
        state.observe_decision(StateValue::V1, Some(cid));
        assert_eq!(state.decision().unwrap().correlation_id, Some(cid));
    }

    #[test]
    fn conflicting_candidate_from_same_node_is_dropped() {
        let mut state = SlotState::new(Slot::ZERO, node(1), QUORUM);
        assert!(state.observe_candidate(node(2), CorrelationId::new()));
        assert!(!state.observe_candidate(node(2), CorrelationId::new()));
        assert_eq!(state.take_counters().violations, 1);
    }

    #[test]
    fn rebroadcast_repeats_current_phase_votes() {
        let (mut state, _) = pinned_slot();
        state.activate(StateValue::V1);
        state.record_round1(node(2), Phase::ZERO, StateValue::V1);

        let effects = state.rebroadcast_votes();
        assert_eq!(
            effects,
            vec![
                SlotEffect::CastRound1 {
                    phase: Phase::ZERO,
                    value: StateValue::V1
                },
                SlotEffect::CastRound2 {
                    phase: Phase::ZERO,
                    value: StateValue::V1
                },
            ]
        );

        // Nothing to repeat once decided.
        state.record_round2(node(2), Phase::ZERO, StateValue::V1);
        assert!(state.rebroadcast_votes().is_empty());
    }

    #[test]
    fn phases_are_strictly_monotone() {
        let (mut state, _) = pinned_slot();
        state.activate(StateValue::V1);

        let mut last = state.current_phase();
        // Starve the slot of deciding majorities so it walks through
        // adopt/coin phases; each step must strictly increase the phase.
        for round in 0..5u64 {
            let phase = Phase::new(round);
            state.record_round1(node(2), phase, StateValue::V0);
            state.record_round2(node(2), phase, StateValue::VQuestion);
            if state.is_decided() {
                break;
            }
            assert!(state.current_phase() >= last);
            last = state.current_phase();
        }
    }

    proptest! {
        /// Applying any inbound vote twice leaves the machine in the same
        /// state as applying it once.
        #[test]
        fn vote_application_is_idempotent(
            sender in 2u64..8,
            phase in 0u64..4,
            value in 0u8..2,
            second_round in proptest::bool::ANY,
        ) {
            let value = if value == 0 { StateValue::V0 } else { StateValue::V1 };
            let (mut once, _) = pinned_slot();
            once.activate(StateValue::V1);
            let (mut twice, _) = pinned_slot();
            twice.activate(StateValue::V1);

            let apply = |state: &mut SlotState| {
                if second_round {
                    state.record_round2(node(sender), Phase::new(phase), value)
                } else {
                    state.record_round1(node(sender), Phase::new(phase), value)
                }
            };

            apply(&mut once);
            apply(&mut twice);
            let repeat_effects = apply(&mut twice);

            prop_assert!(repeat_effects.is_empty());
            prop_assert_eq!(once.current_phase(), twice.current_phase());
            prop_assert_eq!(once.is_decided(), twice.is_decided());
        }
    }
}
