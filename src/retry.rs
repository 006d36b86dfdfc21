// Exponential backoff shared by acknowledged delivery and task requeueing

use rand::Rng;
use std::time::Duration;

/// How much randomness is added on top of the computed delay
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    None,
    /// Uniform in `[0, ratio * delay]`
    Proportional(f64),
    /// Uniform in `[0, max]`
    Fixed(Duration),
}

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: Jitter,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: Jitter::Proportional(0.1),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, multiplier: f64, max_delay: Duration, jitter: Jitter) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
            jitter,
        }
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(63) as i32);
        let millis = (self.base_delay.as_millis() as f64 * factor).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    /// Delay before retry number `attempt` (0-based), capped, plus jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        let jitter_ceiling = match self.jitter {
            Jitter::None => Duration::ZERO,
            Jitter::Proportional(ratio) => delay.mul_f64(ratio.max(0.0)),
            Jitter::Fixed(max) => max,
        };

        if jitter_ceiling.is_zero() {
            return delay;
        }

        let jitter_ms = rand::rng().random_range(0..=jitter_ceiling.as_millis() as u64);
        delay + Duration::from_millis(jitter_ms)
    }
}
