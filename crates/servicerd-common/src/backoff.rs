//! Randomized exponential backoff
//!
//! The delay before retry `n` is drawn uniformly from
//! `{base, 2*base, 4*base, ..., 2^(n-1)*base}` and capped at `max`. Spreading
//! recoveries this way keeps many instances that lost the store at the same
//! moment from reconnecting in lockstep.

use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

pub struct Backoff {
    base: Duration,
    max: Duration,
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl Backoff {
    /// Backoff seeded from the operating system.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self::with_rng(base, max, StdRng::from_os_rng())
    }

    /// Backoff with a fixed seed, for reproducible sequences.
    pub fn seeded(base: Duration, max: Duration, seed: u64) -> Self {
        Self::with_rng(base, max, StdRng::seed_from_u64(seed))
    }

    /// Backoff drawing from a caller-supplied random source.
    pub fn with_rng(base: Duration, max: Duration, rng: impl RngCore + Send + 'static) -> Self {
        Self {
            base,
            max,
            rng: Mutex::new(Box::new(rng)),
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay to wait after failed attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let steps = attempt.clamp(1, 32);
        let exponent = self.rng.lock().random_range(0..steps);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("base", &self.base)
            .field("max", &self.max)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_attempt_is_base() {
        let backoff = Backoff::seeded(Duration::from_secs(1), Duration::from_secs(60), 7);
        for _ in 0..16 {
            assert_eq!(backoff.delay(1), Duration::from_secs(1));
        }
    }

    #[test]
    fn test_delay_is_power_of_two_within_bound() {
        let backoff = Backoff::seeded(Duration::from_secs(1), Duration::from_secs(600), 42);
        for attempt in 1..=6u32 {
            for _ in 0..32 {
                let secs = backoff.delay(attempt).as_secs();
                assert!(secs.is_power_of_two(), "{} is not a power of two", secs);
                assert!(secs <= 1 << (attempt - 1));
            }
        }
    }

    #[test]
    fn test_delay_capped_at_max() {
        let backoff = Backoff::seeded(Duration::from_secs(1), Duration::from_secs(4), 3);
        for _ in 0..64 {
            assert!(backoff.delay(20) <= Duration::from_secs(4));
        }
    }

    #[test]
    fn test_seeded_sequences_repeat() {
        let a = Backoff::seeded(Duration::from_millis(100), Duration::from_secs(60), 99);
        let b = Backoff::seeded(Duration::from_millis(100), Duration::from_secs(60), 99);
        let seq_a: Vec<_> = (1..=8).map(|n| a.delay(n)).collect();
        let seq_b: Vec<_> = (1..=8).map(|n| b.delay(n)).collect();
        assert_eq!(seq_a, seq_b);
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        assert!(backoff.delay(u32::MAX) <= Duration::from_secs(30));
    }
}
