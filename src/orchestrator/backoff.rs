/// Retry backoff schedule with an injectable clock, so tests never wait
/// real wall-clock time.
use crate::config::types::RetryPolicy;
use rand::Rng;
use std::time::Duration;

/// Sleep seam between retry attempts.
pub trait Clock: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Real clock used outside tests.
pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Exponential backoff: `base * factor^(attempt-1) + jitter`, where the
/// jitter term is uniform in `[0, jitter)` and `attempt` is the 1-based
/// count of failures so far.
#[derive(Clone, Debug)]
pub struct BackoffSchedule {
    base: f64,
    factor: f64,
    jitter: f64,
}

impl BackoffSchedule {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            base: policy.backoff_base,
            factor: policy.backoff_factor,
            jitter: policy.jitter,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let mut seconds = self.base * self.factor.powi(exponent);
        if self.jitter > 0.0 {
            seconds += rand::thread_rng().gen_range(0.0..self.jitter);
        }
        Duration::from_secs_f64(seconds.max(0.0))
    }
}
