//! Retry helpers
//!
//! Two independent policies:
//! - [`retry_on_lock`]: SQLite lock contention, bounded by wall-clock time
//!   (`db_max_lock_wait_ms` setting)
//! - [`retry_transient_io`]: filesystem writes in sorter working directories,
//!   bounded by attempt count
//!
//! Both back off exponentially, doubling from the initial delay up to a cap.

use std::future::Future;
use std::time::{Duration, Instant};

use ephys_common::{Error, Result};

use crate::error::SortError;

const LOCK_INITIAL_BACKOFF_MS: u64 = 10;
const MAX_BACKOFF_MS: u64 = 1000;

/// Retry a database operation while SQLite reports the database as locked
///
/// Non-lock errors return immediately. Once `max_wait_ms` has elapsed the
/// last lock error is surfaced as `Error::Internal`.
pub async fn retry_on_lock<F, Fut, T>(operation_name: &str, max_wait_ms: u64, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start_time = Instant::now();
    let max_duration = Duration::from_millis(max_wait_ms);
    let mut attempt = 0u32;
    let mut backoff_ms = LOCK_INITIAL_BACKOFF_MS;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        "Database operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) if err.is_lock_contention() => {
                let elapsed = start_time.elapsed();
                if elapsed >= max_duration {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        max_wait_ms,
                        "Database operation failed: max retry time exceeded"
                    );
                    return Err(Error::Internal(format!(
                        "Database locked after {} attempts ({} ms elapsed, max {} ms)",
                        attempt,
                        elapsed.as_millis(),
                        max_wait_ms
                    )));
                }

                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms,
                    "Database locked, will retry after backoff"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Bounded retry policy for working-directory I/O
#[derive(Debug, Clone, Copy)]
pub struct IoRetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for IoRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
        }
    }
}

/// Retry a filesystem operation with exponential backoff
///
/// After `max_attempts` failures the last error is returned as
/// `SortError::TransientIOFailure`.
pub async fn retry_transient_io<F, Fut, T>(
    policy: IoRetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> std::result::Result<T, SortError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut backoff = policy.initial_backoff;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= max_attempts => {
                tracing::error!(
                    operation = operation_name,
                    attempt,
                    error = %err,
                    "I/O operation failed, retries exhausted"
                );
                return Err(SortError::TransientIOFailure {
                    attempts: attempt,
                    source: err,
                });
            }
            Err(err) => {
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "I/O operation failed, will retry after backoff"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_millis(MAX_BACKOFF_MS));
            }
        }
    }
}
