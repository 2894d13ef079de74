//! Exponential backoff with jitter for chunk and request retries.

use std::time::Duration;

use rand::Rng;

/// Which backoff curve a retryable failure follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Network errors, timeouts and server-side I/O failures.
    Transient,
    /// The server is shedding load.
    RateLimited,
}

/// One backoff curve: `min(cap, base * 2^(attempt-1))`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Backoff {
    /// Delay before retrying after failed attempt `attempt` (1-based),
    /// without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.base.as_secs_f64() * 2f64.powi(exp);
        Duration::from_secs_f64(secs.min(self.cap.as_secs_f64()))
    }
}

/// Retry budget and backoff curves per failure class.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per chunk or request, the first one included.
    pub max_attempts: u32,
    pub transient: Backoff,
    pub rate_limited: Backoff,
    /// Relative jitter applied to every delay, in `[0, 1)`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            transient: Backoff {
                base: Duration::from_millis(500),
                cap: Duration::from_secs(30),
            },
            rate_limited: Backoff {
                base: Duration::from_secs(2),
                cap: Duration::from_secs(60),
            },
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, class: FailureClass) -> &Backoff {
        match class {
            FailureClass::Transient => &self.transient,
            FailureClass::RateLimited => &self.rate_limited,
        }
    }

    /// Whether another attempt is allowed after `attempt` failed ones.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay after failed attempt `attempt` (1-based), with ±`jitter`.
    pub fn delay_for(&self, class: FailureClass, attempt: u32) -> Duration {
        let base = self.backoff(class).base_delay(attempt).as_secs_f64();
        if self.jitter <= 0.0 {
            return Duration::from_secs_f64(base);
        }
        let offset: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
        Duration::from_secs_f64((base * (1.0 + self.jitter * offset)).max(0.0))
    }
}
