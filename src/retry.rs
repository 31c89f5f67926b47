//! Retry policy and request spacing for provider calls.

use crate::error::FetchError;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Upper bound on a provider-supplied `Retry-After`.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(16_000),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &crate::config::FetchConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        }
    }

    /// Delay after failed attempt number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before the next attempt, honoring `Retry-After` on rate limits.
    pub fn delay_for(&self, attempt: u32, err: &FetchError) -> Duration {
        let backoff = self.backoff(attempt);
        match err {
            FetchError::RateLimited { retry_after: Some(after) } => backoff.max((*after).min(MAX_RETRY_AFTER)),
            _ => backoff,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. Returns the final result and
    /// the number of attempts made. `sleep` is called between attempts.
    pub fn run<T, F, S>(&self, mut op: F, mut sleep: S) -> (Result<T, FetchError>, u32)
    where
        F: FnMut(u32) -> Result<T, FetchError>,
        S: FnMut(Duration),
    {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(v) => return (Ok(v), attempt),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt, &e);
                    tracing::debug!("attempt {} failed ({}), retrying in {:?}", attempt, e, delay);
                    sleep(delay);
                    attempt += 1;
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }
}

/// Enforces a minimum interval between any two requests, across threads.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Block until this caller's slot. Slots are handed out under the lock
    /// and slept on outside it, so waiting callers queue in order.
    pub fn acquire(&self) {
        let slot = {
            let mut next = match self.next_slot.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let now = Instant::now();
            let slot = match *next {
                Some(t) if t > now => t,
                _ => now,
            };
            *next = Some(slot + self.interval);
            slot
        };
        let now = Instant::now();
        if slot > now {
            std::thread::sleep(slot - now);
        }
    }
}
