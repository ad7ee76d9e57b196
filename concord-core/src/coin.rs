//! Common coin for breaking round-2 ties.
//!
//! The coin is a deterministic function of (slot, phase): every node derives
//! the same value without communication. It is consulted only when a
//! round-2 quorum carried no decisive value, and its output is always
//! binary.

use crate::{Phase, Slot, StateValue};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Mixes slot and phase into one seed. The multiplier spreads consecutive
/// phases across the seed space so adjacent flips are uncorrelated.
fn coin_seed(slot: Slot, phase: Phase) -> u64 {
    slot.value()
        .rotate_left(17)
        .wrapping_add(phase.value().wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// Flips the shared coin for (slot, phase). Never returns `VQuestion`.
pub fn common_coin(slot: Slot, phase: Phase) -> StateValue {
    let mut rng = StdRng::seed_from_u64(coin_seed(slot, phase));
    if rng.gen_bool(0.5) {
        StateValue::V1
    } else {
        StateValue::V0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coin_is_deterministic() {
        for slot in 0..50u64 {
            for phase in 0..10u64 {
                let s = Slot::new(slot);
                let p = Phase::new(phase);
                assert_eq!(common_coin(s, p), common_coin(s, p));
            }
        }
    }

    #[test]
    fn coin_is_always_binary() {
        for slot in 0..100u64 {
            let value = common_coin(Slot::new(slot), Phase::ZERO);
            assert!(value.is_binary());
        }
    }

    #[test]
    fn coin_produces_both_outcomes() {
        let flips: Vec<StateValue> = (0..100u64)
            .map(|p| common_coin(Slot::ZERO, Phase::new(p)))
            .collect();
        assert!(flips.contains(&StateValue::V0));
        assert!(flips.contains(&StateValue::V1));
    }
}
