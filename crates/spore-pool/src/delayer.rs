//! Randomized refresh delays.
//!
//! Spreads reconciliation passes across `[min, max)` so that many pool
//! processes sharing a provider account do not poll in lockstep.

use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Produces random waits between a minimum and maximum duration.
///
/// Safe to share between tasks; each [`Delayer::wait`] call yields an
/// independent timer.
#[derive(Debug)]
pub struct Delayer {
    range_min: Duration,
    range_max: Duration,
    rng: Mutex<StdRng>,
}

impl Delayer {
    /// A delayer over `[range_min, range_max)`. An inverted range
    /// collapses to `range_min`.
    pub fn new(range_min: Duration, range_max: Duration) -> Self {
        Self::with_rng(range_min, range_max, StdRng::from_os_rng())
    }

    /// Deterministic delayer for reproducible schedules.
    pub fn seeded(range_min: Duration, range_max: Duration, seed: u64) -> Self {
        Self::with_rng(range_min, range_max, StdRng::seed_from_u64(seed))
    }

    fn with_rng(range_min: Duration, range_max: Duration, rng: StdRng) -> Self {
        Self {
            range_min,
            range_max: range_max.max(range_min),
            rng: Mutex::new(rng),
        }
    }

    /// The next wait period.
    pub fn next_delay(&self) -> Duration {
        let delta = self.range_max - self.range_min;
        if delta.is_zero() {
            return self.range_min;
        }
        let delta_nanos = u64::try_from(delta.as_nanos()).unwrap_or(u64::MAX);
        let jitter = self
            .rng
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .random_range(0..delta_nanos);
        self.range_min + Duration::from_nanos(jitter)
    }

    /// A one-shot timer that fires after [`Delayer::next_delay`].
    pub fn wait(&self) -> tokio::time::Sleep {
        tokio::time::sleep(self.next_delay())
    }

    pub fn range(&self) -> (Duration, Duration) {
        (self.range_min, self.range_max)
    }
}
