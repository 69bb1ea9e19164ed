//! Retry backoff

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// `base * 2^retried`, capped at `max`. With jitter the delay is drawn
    /// from the upper half of that value.
    Exponential {
        base: Duration,
        max: Duration,
        jitter: bool,
    },
    /// Same delay every time
    Fixed(Duration),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::exponential(Duration::from_secs(1), Duration::from_secs(600), true)
    }
}

impl RetryPolicy {
    pub fn exponential(base: Duration, max: Duration, jitter: bool) -> Self {
        RetryPolicy::Exponential { base, max, jitter }
    }

    pub fn fixed(delay: Duration) -> Self {
        RetryPolicy::Fixed(delay)
    }

    /// Delay before the next attempt, given retries already consumed
    pub fn delay(&self, retried: u32) -> Duration {
        match *self {
            RetryPolicy::Fixed(delay) => delay,
            RetryPolicy::Exponential { base, max, jitter } => {
                let factor = 1u32.checked_shl(retried).unwrap_or(u32::MAX);
                let delay = base.saturating_mul(factor).min(max);
                if jitter && !delay.is_zero() {
                    let half = delay / 2;
                    let spread = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
                    half + Duration::from_millis(spread)
                } else {
                    delay
                }
            }
        }
    }
}
