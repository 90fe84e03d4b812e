//! Deterministic per-mutation random streams.
//!
//! Every mutation gets its own xorshift32 stream derived from the global
//! run seed and the mutation identity, so decision procedures can make
//! sampling choices that replay identically across invocations.

use std::time::{SystemTime, UNIX_EPOCH};

/// 32-bit xorshift mixing step.
fn xorshift32(mut x: u32) -> u32 {
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    x
}

/// Deterministic random stream for one mutation.
#[derive(Debug, Clone)]
pub struct MutationRng {
    state: u32,
}

impl MutationRng {
    /// Create the stream for `(seed, mutation_id)`.
    pub fn new(seed: u32, mutation_id: i64) -> Self {
        let mut state = xorshift32(xorshift32((mutation_id as u32).wrapping_add(seed)));
        state = xorshift32(xorshift32(state));
        Self { state }
    }

    /// Next value in `[0, n)`, advancing the stream.
    ///
    /// `n` must be nonzero; callers exposing this to untrusted input are
    /// expected to validate the bound first.
    pub fn draw(&mut self, n: u32) -> u32 {
        debug_assert!(n > 0, "draw bound must be nonzero");
        self.state = xorshift32(xorshift32(self.state));
        self.state % n
    }
}

/// Derive a fresh global seed from the wall clock.
///
/// Used once when no explicit seed is configured; the caller persists the
/// value so subsequent commands replay the same streams.
pub fn derive_time_seed() -> u32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    xorshift32(xorshift32(xorshift32(secs as u32))) % 1_000_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streams_replay_identically() {
        let mut a = MutationRng::new(42, 7);
        let mut b = MutationRng::new(42, 7);
        let first: Vec<u32> = (0..16).map(|_| a.draw(100)).collect();
        let second: Vec<u32> = (0..16).map(|_| b.draw(100)).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn distinct_mutations_diverge() {
        let mut a = MutationRng::new(42, 7);
        let mut b = MutationRng::new(42, 8);
        let first: Vec<u32> = (0..8).map(|_| a.draw(1_000_000)).collect();
        let second: Vec<u32> = (0..8).map(|_| b.draw(1_000_000)).collect();
        assert_ne!(first, second);
    }

    #[test]
    fn draws_stay_in_range() {
        let mut rng = MutationRng::new(1, 1);
        for n in [1u32, 2, 3, 10, 97] {
            for _ in 0..32 {
                assert!(rng.draw(n) < n);
            }
        }
    }

    #[test]
    #[should_panic(expected = "draw bound must be nonzero")]
    fn zero_draw_bound_is_rejected() {
        MutationRng::new(1, 1).draw(0);
    }

    #[test]
    fn mixing_matches_reference_values() {
        // xorshift32 with the 13/17/5 shift triple.
        assert_eq!(xorshift32(1), 270_369);
        assert_eq!(xorshift32(270_369), 67_634_689);
    }

    #[test]
    fn time_seed_is_bounded() {
        assert!(derive_time_seed() < 1_000_000_000);
    }
}
