//! Jitter strategies to prevent retry thundering herds.
//!
//! Jitter is off by default so retry delays stay deterministic; enable it
//! when many clients share an origin.

use rand::Rng;
use std::time::Duration;

/// Jitter strategy for randomizing retry delays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Jitter {
    /// Use the exact backoff delay.
    #[default]
    None,
    /// Random between 0 and the delay.
    Full,
    /// Random between delay/2 and the delay.
    Equal,
}

impl Jitter {
    /// Apply jitter to a delay duration.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Apply jitter with a caller-supplied RNG (for tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis = delay.as_millis() as u64;
        if millis == 0 {
            return Duration::ZERO;
        }
        match self {
            Jitter::None => delay,
            Jitter::Full => Duration::from_millis(rng.random_range(0..=millis)),
            Jitter::Equal => Duration::from_millis(rng.random_range(millis / 2..=millis)),
        }
    }
}
