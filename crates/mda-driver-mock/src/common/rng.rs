//! Seeded RNG for reproducible failures and timing jitter.

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::time::Duration;

/// Thread-safe seeded random source shared by the simulated devices
pub struct MockRng {
    inner: Mutex<ChaCha8Rng>,
}

impl MockRng {
    /// Create a new RNG with optional seed.
    /// If seed is None, uses a random seed from the OS.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            inner: Mutex::new(rng),
        }
    }

    /// Decide whether an operation fails at the given rate (0.0 to 1.0).
    pub fn should_fail(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        self.inner.lock().gen::<f64>() < rate
    }

    /// Generate a random u64 value
    pub fn next_u64(&self) -> u64 {
        self.inner.lock().gen()
    }

    /// Scale `base` by a random factor in `[1 - fraction, 1 + fraction]`.
    pub fn jitter(&self, base: Duration, fraction: f64) -> Duration {
        if base.is_zero() || fraction <= 0.0 {
            return base;
        }
        let fraction = fraction.min(1.0);
        let factor = self.inner.lock().gen_range((1.0 - fraction)..=(1.0 + fraction));
        base.mul_f64(factor)
    }
}

impl Default for MockRng {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for MockRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRng")
            .field("inner", &"<Mutex<ChaCha8Rng>>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_rng_deterministic() {
        let rng1 = MockRng::new(Some(42));
        let rng2 = MockRng::new(Some(42));
        assert_eq!(rng1.next_u64(), rng2.next_u64());
    }

    #[test]
    fn test_should_fail_bounds() {
        let rng = MockRng::new(Some(7));
        assert!((0..100).all(|_| !rng.should_fail(0.0)));
        assert!((0..100).all(|_| rng.should_fail(1.0)));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let rng = MockRng::new(Some(3));
        let base = Duration::from_millis(100);
        for _ in 0..200 {
            let d = rng.jitter(base, 0.2);
            assert!(d >= Duration::from_millis(80) && d <= Duration::from_millis(120));
        }
        assert_eq!(rng.jitter(Duration::ZERO, 0.5), Duration::ZERO);
    }
}
