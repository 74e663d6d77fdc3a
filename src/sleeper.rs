//! Abstraction for sleeping/waiting.
//!
//! Rate-limit waits, retry delays, and the stale-while-revalidate timer all
//! go through a [`Sleeper`], which keeps timing-sensitive tests fast and
//! deterministic.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cancel::{AbortReason, CancelToken};

/// Abstraction for sleeping/waiting.
#[async_trait]
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    async fn sleep(&self, duration: Duration);
}

/// Production sleeper using the tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// Test sleeper that doesn't actually sleep.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, _duration: Duration) {
        // no-op
    }
}

/// Test sleeper that records every requested delay without sleeping.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    recorded: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded delays, in request order.
    pub fn recorded(&self) -> Vec<Duration> {
        self.recorded.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    pub fn clear(&self) {
        self.recorded.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clear();
    }
}

#[async_trait]
impl Sleeper for TrackingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.recorded.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(duration);
    }
}

/// Sleep that ends early when `token` fires, returning the abort reason.
pub(crate) async fn sleep_cancellable(
    sleeper: &dyn Sleeper,
    duration: Duration,
    token: &CancelToken,
) -> Result<(), AbortReason> {
    if let Some(reason) = token.reason() {
        return Err(reason);
    }
    tokio::select! {
        _ = sleeper.sleep(duration) => Ok(()),
        reason = token.cancelled() => Err(reason),
    }
}
