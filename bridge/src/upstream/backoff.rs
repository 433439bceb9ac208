//! Retry delays for idempotent upstream calls
//!
//! A [`RetryPolicy`] is shared by the client; every call takes its own
//! [`RetrySchedule`] from it, so retry counts never leak between calls or
//! categories. Delays use "equal jitter": half of the exponential step is
//! fixed, the other half is scaled by the policy's [`Jitter`] source.

use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Random factor applied to each delay
pub trait Jitter: Send + Sync {
    /// A value in `[0.0, 1.0]`
    fn sample(&self) -> f64;
}

/// Thread-local RNG from `rand`
pub struct RandomJitter;

impl Jitter for RandomJitter {
    fn sample(&self) -> f64 {
        rand::thread_rng().gen_range(0.0..=1.0)
    }
}

/// Always the same factor; makes schedules reproducible in tests
pub struct FixedJitter(pub f64);

impl Jitter for FixedJitter {
    fn sample(&self) -> f64 {
        self.0.clamp(0.0, 1.0)
    }
}

/// How many times, and how far apart, a transient failure is retried
#[derive(Clone)]
pub struct RetryPolicy {
    first_delay: Duration,
    ceiling: Duration,
    max_retries: u32,
    jitter: Arc<dyn Jitter>,
}

impl RetryPolicy {
    /// 250ms doubling up to 10s, randomized
    pub fn new(max_retries: u32) -> Self {
        Self {
            first_delay: Duration::from_millis(250),
            ceiling: Duration::from_secs(10),
            max_retries,
            jitter: Arc::new(RandomJitter),
        }
    }

    /// Fail on the first transient error
    pub fn no_retries() -> Self {
        Self::new(0)
    }

    pub fn with_delays(mut self, first_delay: Duration, ceiling: Duration) -> Self {
        self.first_delay = first_delay;
        self.ceiling = ceiling.max(first_delay);
        self
    }

    pub fn with_jitter(mut self, jitter: Arc<dyn Jitter>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Fresh schedule for one call
    pub fn schedule(&self) -> RetrySchedule<'_> {
        RetrySchedule {
            policy: self,
            retries: 0,
        }
    }

    /// Un-jittered step before retry `n` (1-based), capped at the ceiling
    fn step(&self, n: u32) -> Duration {
        let factor = 1u32.checked_shl(n.saturating_sub(1)).unwrap_or(u32::MAX);
        self.first_delay
            .checked_mul(factor)
            .map_or(self.ceiling, |d| d.min(self.ceiling))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("first_delay", &self.first_delay)
            .field("ceiling", &self.ceiling)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

/// Retry budget of a single call
pub struct RetrySchedule<'a> {
    policy: &'a RetryPolicy,
    retries: u32,
}

impl RetrySchedule<'_> {
    /// Delay before the next retry, or `None` once the budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries >= self.policy.max_retries {
            return None;
        }
        self.retries += 1;

        let step = self.policy.step(self.retries);
        let half = step / 2;
        let spread = (step - half).mul_f64(self.policy.jitter.sample());
        Some(half + spread)
    }

    /// Retries handed out so far
    pub fn retries(&self) -> u32 {
        self.retries
    }
}
