//! Delay computations: the randomized affiliate fire delay and the transport
//! retry backoff.

use std::f64::consts::PI;
use std::time::Duration;

use super::random::RandomSource;

/// Gaussian delay envelope applied before each affiliate fire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FireDelay {
    pub mean_ms: f64,
    pub std_dev_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl Default for FireDelay {
    fn default() -> Self {
        Self {
            mean_ms: 4500.0,
            std_dev_ms: 1500.0,
            min_ms: 1000.0,
            max_ms: 8000.0,
        }
    }
}

impl FireDelay {
    /// Draws a delay with the Box–Muller transform and clamps it to the
    /// configured bounds.
    pub fn sample(&self, random: &dyn RandomSource) -> Duration {
        // ln(0) is undefined; nudge u1 into (0, 1].
        let u1 = (1.0 - random.next_f64()).max(f64::MIN_POSITIVE);
        let u2 = random.next_f64();
        let gaussian = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
        let delay = (self.mean_ms + gaussian * self.std_dev_ms).clamp(self.min_ms, self.max_ms);
        Duration::from_millis(delay.round() as u64)
    }
}

/// Retry schedule for batch delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `retry` (0-based): 1s, 2s, 4s...
    pub fn backoff(&self, retry: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(retry.min(16)))
    }
}
