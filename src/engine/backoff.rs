//! Retry backoff for failed bounces.
//!
//! `delay(failures) = factor × base^failures`, capped at `max`. There is no
//! retry limit: a bounce that never succeeds keeps coming back at `max`.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay for zero failures.
    pub factor: Duration,
    /// Growth per failure.
    pub base: f64,
    /// Upper bound on any delay.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            factor: Duration::from_millis(500),
            base: 2.0,
            max: Duration::from_secs(6000),
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.min(i32::MAX as u32) as i32;
        let secs = self.factor.as_secs_f64() * self.base.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}
