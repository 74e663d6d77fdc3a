//! Retry classification and delay computation.
//!
//! The engine consults [`RetryConfig::verdict`] after every failed attempt.
//! Default policy: retry while the error's status sits in the retryable set,
//! never retry a user cancellation, and surface the final attempt's error
//! verbatim once attempts run out — callers see the real status and body,
//! not a synthetic wrapper.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::Backoff;
use crate::error::{ConfigError, FetchError};
use crate::jitter::Jitter;

/// What to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    /// Retry after the configured backoff delay.
    Retry,
    /// Give up and surface the error.
    Abort,
    /// Retry after this explicit delay instead of the backoff curve.
    After(Duration),
}

impl RetryVerdict {
    pub fn should_retry(&self) -> bool {
        !matches!(self, RetryVerdict::Abort)
    }
}

/// Custom classification hook.
pub type ShouldRetry = Arc<dyn Fn(&FetchError) -> RetryVerdict + Send + Sync>;

/// Statuses retried by default: request timeout, throttling, client-side
/// abort, and the transient 5xx family.
pub fn default_retryable_status_codes() -> BTreeSet<u16> {
    BTreeSet::from([408, 429, 499, 500, 502, 503, 504])
}

#[derive(Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub use_exponential_backoff: bool,
    pub retryable_status_codes: BTreeSet<u16>,
    pub should_retry: Option<ShouldRetry>,
    pub jitter: Jitter,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(10_000),
            use_exponential_backoff: true,
            retryable_status_codes: default_retryable_status_codes(),
            should_retry: None,
            jitter: Jitter::None,
        }
    }
}

impl std::fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("use_exponential_backoff", &self.use_exponential_backoff)
            .field("retryable_status_codes", &self.retryable_status_codes)
            .field("should_retry", &self.should_retry.as_ref().map(|_| "<fn>"))
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl RetryConfig {
    /// Single-attempt config, the internal shape of `retry: false`.
    pub fn disabled() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        Ok(())
    }

    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&FetchError) -> RetryVerdict + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    /// Classify a failed attempt. The custom hook, when present, is final.
    pub fn verdict(&self, error: &FetchError) -> RetryVerdict {
        if let Some(custom) = &self.should_retry {
            return custom(error);
        }
        // User cancellation is never retried; timer aborts fall through to
        // the status check (499 is in the default retryable set).
        if error.aborted && !error.timed_out {
            return RetryVerdict::Abort;
        }
        if self.retryable_status_codes.contains(&error.status) {
            RetryVerdict::Retry
        } else {
            RetryVerdict::Abort
        }
    }

    /// Delay before the retry following `attempt` (1-indexed).
    pub fn delay_for(&self, attempt: u32, verdict: RetryVerdict) -> Duration {
        if let RetryVerdict::After(delay) = verdict {
            return delay;
        }
        let curve = if self.use_exponential_backoff {
            Backoff::exponential(self.base_delay, self.max_delay)
        } else {
            Backoff::constant(self.base_delay)
        };
        self.jitter.apply(curve.delay(attempt))
    }
}
