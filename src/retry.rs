//! Bounded retry with exponential backoff.
//!
//! Task bodies wrap calls to external sinks in [`with_retry`]. The backoff
//! sleep runs on the task that holds the executor's worker permit, so a
//! retrying body keeps its worker slot for the whole backoff; size
//! `tasks.max_workers` with that in mind.
//!
//! With the default policy a call is attempted up to 4 times, sleeping
//! 1s, 2s, then 4s between attempts.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Additional attempts after the first.
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after every failed attempt.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// The sleeps taken between attempts when every attempt fails.
    pub fn delays(&self) -> Vec<Duration> {
        let mut delay = self.initial_delay;
        let mut out = Vec::with_capacity(self.max_retries as usize);
        for _ in 0..self.max_retries {
            out.push(delay);
            delay = self.next_delay(delay);
        }
        out
    }

    /// Grow `delay` by the backoff factor. A factor that does not yield a
    /// representable duration keeps the current delay.
    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::try_from_secs_f64(delay.as_secs_f64() * self.backoff_factor).unwrap_or(delay)
    }
}

/// Run `op` until it succeeds or `policy.max_retries` retries are spent.
///
/// Returns the first success, or the error from the final attempt.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = policy.initial_delay;
    let mut attempt = 0u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_retries => {
                attempt += 1;
                warn!(
                    operation = label,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "attempt failed; retrying"
                );
                tokio::time::sleep(delay).await;
                delay = policy.next_delay(delay);
            }
            Err(e) => return Err(e),
        }
    }
}
