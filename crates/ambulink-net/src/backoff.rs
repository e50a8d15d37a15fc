//! Exponential reconnect backoff with jitter.

use std::time::Duration;

use rand::Rng;

use ambulink_shared::constants::RECONNECT_MIN_BACKOFF_MS;

/// Doubles from [`RECONNECT_MIN_BACKOFF_MS`] up to a cap, with +/-25% jitter
/// on every returned delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(max: Duration) -> Self {
        let min = Duration::from_millis(RECONNECT_MIN_BACKOFF_MS);
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    /// Delay before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);

        let factor = rand::thread_rng().gen_range(0.75..=1.25);
        base.mul_f64(factor)
    }

    /// Back to the minimum delay, after a successful connect.
    pub fn reset(&mut self) {
        self.current = self.min;
    }
}
