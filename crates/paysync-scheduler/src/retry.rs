//! Step runner: re-invokes an idempotent step with capped exponential backoff.
//!
//! Only errors whose kind is retryable are retried; everything else is
//! returned on the first failure with its reason code intact.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use paysync_core::config::RetryConfig;
use paysync_core::error::Result;

/// Backoff policy for one kind of step.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_multiplier: f64,
    pub max_interval: Duration,
    /// Total attempts including the first. 0 means unlimited.
    pub max_attempts: u32,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(c: &RetryConfig) -> Self {
        Self {
            initial_interval: Duration::from_millis(c.initial_interval_ms),
            backoff_multiplier: c.backoff_multiplier,
            max_interval: Duration::from_millis(c.max_interval_ms),
            max_attempts: c.max_attempts,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-indexed), capped at `max_interval`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_interval.as_millis() as f64
            * self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped = base.min(self.max_interval.as_millis() as f64);
        let ms = if self.jitter {
            capped * (1.0 + rand::thread_rng().gen_range(0.0..0.25))
        } else {
            capped
        };
        Duration::from_millis(ms as u64)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts != 0 && attempts >= self.max_attempts
    }
}

/// How a recurring scan is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Fixed period between runs, e.g. every 5 seconds for the outbox publisher.
    Every(Duration),
}

impl Schedule {
    pub fn period(&self) -> Duration {
        match self {
            Schedule::Every(d) => *d,
        }
    }

    /// A tokio interval that skips missed ticks instead of bursting.
    pub fn interval(&self) -> tokio::time::Interval {
        let mut interval = tokio::time::interval(self.period());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval
    }
}

/// Run `step` until it succeeds, fails with a non-retryable error, or the
/// policy runs out of attempts. The step must be safe to re-run with the same `key`.
pub async fn execute_idempotent_step<F, Fut, T>(key: &str, policy: &RetryPolicy, mut step: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match step().await {
            Ok(v) => {
                if attempts > 1 {
                    tracing::info!("✅ Step '{key}' succeeded after {attempts} attempts");
                }
                return Ok(v);
            }
            Err(e) if !e.is_retryable() => {
                tracing::warn!("⛔ Step '{key}' failed permanently [{}]: {e}", e.reason());
                return Err(e);
            }
            Err(e) if policy.exhausted(attempts) => {
                tracing::warn!("⛔ Step '{key}' gave up after {attempts} attempts: {e}");
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_for(attempts - 1);
                tracing::warn!(
                    "🔁 Step '{key}' attempt {attempts} failed [{}]: {e}; retrying in {}ms",
                    e.reason(),
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
