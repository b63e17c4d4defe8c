//! Retry utilities with exponential backoff
//!
//! Failures are sorted into three classes by [`classify_error`]:
//!
//! - [`ErrorClass::Retryable`]: HTTP 429 and 5xx, transport failures, timeouts
//! - [`ErrorClass::QuotaExceeded`]: HTTP 429 whose message names a quota or
//!   billing limit
//! - [`ErrorClass::Fatal`]: everything else (other 4xx, decode errors, cancellation)
//!
//! # Examples
//!
//! ```rust,no_run
//! use turnwise::retry::{retry_with_backoff, RetryConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RetryConfig::default()
//!     .with_max_attempts(3)
//!     .with_initial_delay(Duration::from_secs(1));
//!
//! let result = retry_with_backoff(&config, || async {
//!     Ok::<_, turnwise::Error>(42)
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::{Error, Result};
use regex::Regex;
use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempt ceiling, including the first try
    pub max_attempts: u32,

    pub initial_delay: Duration,

    pub max_delay: Duration,

    pub backoff_multiplier: f64,

    /// Fraction of the delay randomised around its centre (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter_factor(mut self, jitter: f64) -> Self {
        self.jitter_factor = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (0-based), capped and jittered.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay_ms = self.initial_delay.as_millis() as f64;
        let exponential_delay = base_delay_ms * self.backoff_multiplier.powi(attempt as i32);

        let capped_delay = exponential_delay.min(self.max_delay.as_millis() as f64);

        let jitter_range = capped_delay * self.jitter_factor;
        let jitter = rand::random::<f64>() * jitter_range;
        let final_delay = capped_delay + jitter - (jitter_range / 2.0);

        Duration::from_millis(final_delay.max(0.0) as u64)
    }
}

/// How the router should react to a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    QuotaExceeded,
    Fatal,
}

fn quota_regex() -> Option<&'static Regex> {
    static CACHED: OnceLock<Option<Regex>> = OnceLock::new();
    CACHED
        .get_or_init(|| {
            Regex::new(
                r"(?i)quota|resource.?exhausted|insufficient.?(balance|quota|credit|funds)|billing|exceeded your current",
            )
            .ok()
        })
        .as_ref()
}

/// Whether an error message names a quota or billing limit.
pub fn is_quota_message(message: &str) -> bool {
    quota_regex().is_some_and(|re| re.is_match(message))
}

pub fn classify_error(error: &Error) -> ErrorClass {
    match error {
        Error::Upstream {
            status: 429,
            message,
            ..
        } => {
            if is_quota_message(message) {
                ErrorClass::QuotaExceeded
            } else {
                ErrorClass::Retryable
            }
        }
        Error::Upstream { status, .. } if (500..=599).contains(status) => ErrorClass::Retryable,
        Error::Transport(_) | Error::Timeout => ErrorClass::Retryable,
        Error::QuotaExceeded(_) => ErrorClass::QuotaExceeded,
        _ => ErrorClass::Fatal,
    }
}

/// Retries `operation` while it fails with a [`ErrorClass::Retryable`] error.
///
/// Other failures return immediately. Running out of attempts yields
/// [`Error::RetriesExhausted`] wrapping the last failure.
pub async fn retry_with_backoff<F, Fut, T>(config: &RetryConfig, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_until_cancelled(config, None, operation).await
}

/// [`retry_with_backoff`] whose waits end with [`Error::Cancelled`] once
/// `abort` fires.
pub async fn retry_until_cancelled<F, Fut, T>(
    config: &RetryConfig,
    abort: Option<&CancellationToken>,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                if classify_error(&err) != ErrorClass::Retryable {
                    return Err(err);
                }
                attempt += 1;
                if attempt >= config.max_attempts {
                    return Err(Error::RetriesExhausted {
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
                let delay = config.calculate_delay(attempt - 1);
                log::debug!("retryable failure ({}), retrying in {:?}", err, delay);
                backoff(delay, abort).await?;
            }
        }
    }
}

/// Sleeps for `delay`, or fails with [`Error::Cancelled`] when `abort` fires first.
pub async fn backoff(delay: Duration, abort: Option<&CancellationToken>) -> Result<()> {
    let Some(token) = abort else {
        sleep(delay).await;
        return Ok(());
    };
    if token.is_cancelled() {
        return Err(Error::Cancelled);
    }
    if delay.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = token.cancelled() => Err(Error::Cancelled),
        _ = sleep(delay) => Ok(()),
    }
}
