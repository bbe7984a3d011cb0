use std::time::Duration;

use serde::Serialize;

/// Bounded exponential backoff for transient sink failures.
///
/// `max_attempts` counts every delivery attempt, the first one included.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// At least one attempt is always made; a multiplier below 1 is treated as 1.
    pub fn new(max_attempts: u32, initial_backoff: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            multiplier: if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 },
        }
    }

    /// Wait after the failed attempt number `attempt` (1-based):
    /// `initial_backoff * multiplier^(attempt - 1)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(self.initial_backoff.as_secs_f64() * factor)
            .unwrap_or(Duration::MAX)
    }

    /// Whether another attempt may follow `attempts_made` failed ones.
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(1000), 2.0)
    }
}
