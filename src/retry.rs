//! Retry logic with exponential backoff
//!
//! Chunk sends retry transient failures a bounded number of times. The budget
//! counts attempts in total, so `max_attempts = 3` means one send plus two
//! retries, with `initial_delay` before the first retry and the delay growing
//! by `backoff_multiplier` after each one.
//!
//! # Example
//!
//! ```no_run
//! use synthgate::retry::{IsRetryable, with_retry};
//! use synthgate::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{self:?}")
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let config = RetryConfig::default();
//! with_retry(&config, || async { Ok::<_, MyError>(()) })
//!     .await
//!     .map_err(|exhausted| exhausted.error)?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::Error;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (transport errors, non-success chunk responses) return `true`.
/// Permanent failures (invalid input, local configuration) return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            // Any transport failure: refused, reset, timed out, bad body
            Error::Network(_) => true,
            Error::ChunkRejected { .. } => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            Error::Config { .. }
            | Error::InvalidParameter(_)
            | Error::Serialization(_)
            | Error::ChunkUpload { .. }
            | Error::Assembly(_)
            | Error::Storage(_)
            | Error::NotFound(_)
            | Error::Vendor { .. }
            | Error::TaskFailed(_)
            | Error::Timeout { .. }
            | Error::NetworkExhausted { .. }
            | Error::Unauthorized(_)
            | Error::PayloadTooLarge { .. }
            | Error::NotSupported(_)
            | Error::ApiServerError(_)
            | Error::Other(_) => false,
        }
    }
}

/// Failure returned once retrying stops
#[derive(Debug)]
pub struct Exhausted<E> {
    /// The last error observed
    pub error: E,
    /// Attempts made, including the first
    pub attempts: u32,
}

/// Execute an async operation with exponential backoff retry logic
///
/// Returns the first success, or the last error together with the number of
/// attempts once the error is permanent or `config.max_attempts` is reached.
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, Exhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempts = attempt, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let wait = if config.jitter { add_jitter(delay) } else { delay };

                tracing::warn!(
                    error = %e,
                    attempt,
                    max_attempts,
                    delay_ms = wait.as_millis() as u64,
                    "operation failed, retrying"
                );

                tokio::time::sleep(wait).await;

                attempt += 1;
                delay = Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier)
                    .min(config.max_delay);
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(error = %e, attempts = attempt, "retry budget exhausted");
                } else {
                    tracing::error!(error = %e, "operation failed with non-retryable error");
                }
                return Err(Exhausted {
                    error: e,
                    attempts: attempt,
                });
            }
        }
    }
}

/// Stretch a delay by a random factor in `[1, 2]`
fn add_jitter(delay: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + factor))
}
