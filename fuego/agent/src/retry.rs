// Copyright (c) 2024 Botho Foundation

//! Bounded backoff for transient remote failures.

use fuego_core::RetryConfig;
use ::retry::delay::{jitter, Fibonacci};
use std::{fmt::Display, future::Future, time::Duration};
use tracing::{debug, warn};

/// The last error seen once retrying stopped.
#[derive(Debug)]
pub struct GaveUp<E> {
    pub attempts: u32,
    pub error: E,
}

/// Delays between attempts: a Fibonacci series from `base_delay_ms`, each
/// capped at `max_delay_ms`, one fewer than `max_attempts`.
pub fn schedule(policy: &RetryConfig) -> impl Iterator<Item = Duration> {
    let cap = Duration::from_millis(policy.max_delay_ms);
    let retries = policy.max_attempts.max(1) as usize - 1;
    Fibonacci::from_millis(policy.base_delay_ms.max(1))
        .map(move |delay| delay.min(cap))
        .take(retries)
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// retry schedule runs out.
pub async fn with_backoff<T, E, F, Fut>(
    policy: &RetryConfig,
    operation: &str,
    is_transient: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, GaveUp<E>>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delays = schedule(policy).map(jitter);
    let mut attempt = 1;
    loop {
        let error = match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) if !is_transient(&error) => return Err(GaveUp { attempts: attempt, error }),
            Err(error) => error,
        };

        let Some(delay) = delays.next() else {
            return Err(GaveUp { attempts: attempt, error });
        };
        warn!(
            operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "transient failure, retrying: {}",
            error
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
