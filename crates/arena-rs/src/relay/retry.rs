//! Fixed-delay retry policy with an injectable sleeper.
//!
//! Provider calls are retried after a constant delay, multiplied when the
//! provider answered HTTP 429. Waiting goes through [`Sleeper`] so tests can
//! record the schedule instead of sleeping.

use super::AttemptFailure;
use crate::config::RelayConfig;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

/// Boxed future returned by [`Sleeper::sleep`].
pub type SleepFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration) -> SleepFuture<'_>;
}

/// Sleeps on the tokio timer. Only the calling task waits.
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> SleepFuture<'_> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Returns immediately and records every requested wait.
#[derive(Default)]
pub struct RecordingSleeper {
    waits: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().map(|w| w.clone()).unwrap_or_default()
    }

    pub fn total(&self) -> Duration {
        self.waits().iter().sum()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) -> SleepFuture<'_> {
        if let Ok(mut waits) = self.waits.lock() {
            waits.push(duration);
        }
        Box::pin(std::future::ready(()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per turn, including the first. Never less than one.
    pub max_attempts: u32,
    pub delay: Duration,
    /// Factor applied to `delay` after a rate-limit response.
    pub rate_limit_multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RelayConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            rate_limit_multiplier: 2,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            delay: config.retry_delay(),
            rate_limit_multiplier: config.rate_limit_multiplier,
        }
    }

    /// Wait before the attempt following `attempt` (1-based), or `None`
    /// when `attempt` was the last one.
    pub fn delay_after(&self, attempt: u32, failure: &AttemptFailure) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        if failure.is_rate_limited() {
            Some(self.delay.saturating_mul(self.rate_limit_multiplier))
        } else {
            Some(self.delay)
        }
    }
}
