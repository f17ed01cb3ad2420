//! Explicit retry combinator for the infrequent control-plane calls.
//!
//! Registration, task fetch and task-done must eventually succeed for the
//! worker to make progress, so they go through [`retry`]. Partial updates
//! never do: a dropped update is superseded by the next one.

use std::fmt::Display;
use std::future::Future;

use crate::backoff::{next_delay, BackoffConfig};

/// Bounded attempts plus the backoff schedule between them.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Values below 1 behave as 1.
    pub attempts: u32,
    pub backoff: BackoffConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Run `op` until it succeeds or `policy.attempts` is exhausted.
///
/// `on_failure` is invoked for every failed attempt (including the last)
/// so callers can count errors. The error of the last attempt is returned.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
    mut on_failure: impl FnMut(&E),
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = policy.attempts.max(1);
    let mut delay = policy.backoff.initial_delay;
    let mut attempt = 1u32;

    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(operation, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                on_failure(&e);
                if attempt >= attempts {
                    tracing::error!(operation, attempts, error = %e, "Giving up after retries");
                    return Err(e);
                }
                tracing::warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying",
                );
                tokio::time::sleep(delay).await;
                delay = next_delay(delay, &policy.backoff);
                attempt += 1;
            }
        }
    }
}
