//! Token-bucket rate limiting: the pipeline's admission gate.
//!
//! One bucket per resolved key, refilled continuously at
//! `capacity / window` tokens per millisecond. Admission either decrements a
//! token, waits for one (cancellable by the request's parent token), or
//! rejects before the transport is ever touched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::cancel::{AbortReason, CancelToken};
use crate::clock::Clock;
use crate::error::{FetchError, Step};
use crate::events::{EventBus, FetchEvent, RateLimitEvent};
use crate::key::{KeyContext, KeySerializer};
use crate::method::Method;
use crate::rules::{PolicyRule, RuleSet};
use crate::sleeper::{sleep_cancellable, Sleeper};

/// Per-rule overrides for the rate-limit policy.
#[derive(Debug, Clone, Default)]
pub struct RateLimitOverrides {
    pub max_calls: Option<u32>,
    pub window: Option<Duration>,
    pub wait_for_token: Option<bool>,
}

/// Predicate hook: returning `false` bypasses the bucket entirely.
pub type ShouldRateLimit =
    Arc<dyn for<'a> Fn(&KeyContext<'a>) -> bool + Send + Sync>;

/// Callback invoked before a rate-limit wait begins.
pub type OnRateLimit = Arc<dyn for<'a> Fn(&KeyContext<'a>, Duration) + Send + Sync>;

/// Rate-limit policy configuration.
#[derive(Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Bucket capacity (`max_calls` per `window`).
    pub max_calls: u32,
    pub window: Duration,
    /// Wait for a token instead of rejecting when the bucket is empty.
    pub wait_for_token: bool,
    pub methods: Vec<Method>,
    pub serializer: KeySerializer,
    pub rules: Vec<PolicyRule<RateLimitOverrides>>,
    pub should_rate_limit: Option<ShouldRateLimit>,
    pub on_rate_limit: Option<OnRateLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_calls: 100,
            window: Duration::from_secs(60),
            wait_for_token: true,
            methods: vec![
                Method::Get,
                Method::Head,
                Method::Post,
                Method::Put,
                Method::Patch,
                Method::Delete,
                Method::Options,
            ],
            serializer: KeySerializer::Endpoint,
            rules: Vec::new(),
            should_rate_limit: None,
            on_rate_limit: None,
        }
    }
}

impl std::fmt::Debug for RateLimitConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitConfig")
            .field("enabled", &self.enabled)
            .field("max_calls", &self.max_calls)
            .field("window", &self.window)
            .field("wait_for_token", &self.wait_for_token)
            .field("methods", &self.methods)
            .field("rules", &self.rules.len())
            .finish()
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill_at: u64,
}

/// Effective per-route settings after rule resolution.
#[derive(Debug, Clone, Copy)]
struct Effective {
    capacity: f64,
    refill_per_ms: f64,
    wait_for_token: bool,
}

/// The admission gate. One instance per engine.
pub struct RateLimiter {
    max_calls: u32,
    window: Duration,
    wait_for_token: bool,
    should_rate_limit: Option<ShouldRateLimit>,
    on_rate_limit: Option<OnRateLimit>,
    rules: RuleSet<RateLimitOverrides>,
    buckets: Mutex<HashMap<String, Bucket>>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_calls", &self.max_calls)
            .field("window", &self.window)
            .field("wait_for_token", &self.wait_for_token)
            .finish()
    }
}

impl RateLimiter {
    pub fn new(
        config: RateLimitConfig,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self, crate::error::ConfigError> {
        if config.max_calls == 0 {
            return Err(crate::error::ConfigError::ZeroCapacity);
        }
        if config.window.is_zero() {
            return Err(crate::error::ConfigError::ZeroDuration { what: "rate limit window" });
        }
        let rules = RuleSet::new(
            config.enabled,
            config.methods,
            config.serializer,
            config.rules,
        )?;
        Ok(Self {
            max_calls: config.max_calls,
            window: config.window,
            wait_for_token: config.wait_for_token,
            should_rate_limit: config.should_rate_limit,
            on_rate_limit: config.on_rate_limit,
            rules,
            buckets: Mutex::new(HashMap::new()),
            clock,
            sleeper,
        })
    }

    /// Admit the request, wait for a token, or reject. Waits are cancellable
    /// by the request's parent token, so they spend the total-timeout budget.
    pub async fn acquire(
        &self,
        ctx: &KeyContext<'_>,
        state: &Value,
        bus: &EventBus,
        cancel: &CancelToken,
    ) -> Result<(), AcquireError> {
        let Some(rule) = self.rules.resolve(ctx.method, ctx.path) else {
            return Ok(());
        };
        if let Some(should) = &self.should_rate_limit {
            if !should(ctx) {
                return Ok(());
            }
        }

        let key = rule
            .serializer
            .serialize(ctx)
            .map_err(|e| AcquireError::Key(e.to_string()))?;
        let max_calls = rule.overrides.max_calls.unwrap_or(self.max_calls);
        let window = rule.overrides.window.unwrap_or(self.window);
        let effective = Effective {
            capacity: f64::from(max_calls.max(1)),
            refill_per_ms: f64::from(max_calls.max(1)) / window.as_millis().max(1) as f64,
            wait_for_token: rule.overrides.wait_for_token.unwrap_or(self.wait_for_token),
        };

        loop {
            match self.try_take(&key, effective) {
                Take::Admitted { tokens, next_available_ms } => {
                    bus.emit(&FetchEvent::RateLimitAcquire(RateLimitEvent {
                        key,
                        current_tokens: tokens,
                        capacity: effective.capacity,
                        wait_ms: 0,
                        next_available_ms,
                        state: state.clone(),
                    }));
                    return Ok(());
                }
                Take::Empty { tokens, wait_ms, next_available_ms } => {
                    let event = RateLimitEvent {
                        key: key.clone(),
                        current_tokens: tokens,
                        capacity: effective.capacity,
                        wait_ms,
                        next_available_ms,
                        state: state.clone(),
                    };
                    if !effective.wait_for_token {
                        bus.emit(&FetchEvent::RateLimitReject(event));
                        return Err(AcquireError::Rejected { key, wait_ms });
                    }

                    let wait = Duration::from_millis(wait_ms);
                    if let Some(on_rate_limit) = &self.on_rate_limit {
                        on_rate_limit(ctx, wait);
                    }
                    tracing::debug!(key = %key, wait_ms, "rate limit wait");
                    bus.emit(&FetchEvent::RateLimitWait(event));
                    sleep_cancellable(self.sleeper.as_ref(), wait, cancel)
                        .await
                        .map_err(AcquireError::Cancelled)?;
                    // Re-check: refill is deterministic, so one loop suffices
                    // unless another request took the token first.
                }
            }
        }
    }

    fn try_take(&self, key: &str, effective: Effective) -> Take {
        let now = self.clock.now_millis();
        let mut buckets = self.buckets.lock().expect("bucket map poisoned");
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: effective.capacity,
            last_refill_at: now,
        });

        let elapsed = now.saturating_sub(bucket.last_refill_at) as f64;
        bucket.tokens =
            (bucket.tokens + elapsed * effective.refill_per_ms).min(effective.capacity);
        bucket.last_refill_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            let next_available_ms = if bucket.tokens >= 1.0 {
                now
            } else {
                now + ((1.0 - bucket.tokens) / effective.refill_per_ms).ceil() as u64
            };
            Take::Admitted { tokens: bucket.tokens, next_available_ms }
        } else {
            let wait_ms = ((1.0 - bucket.tokens) / effective.refill_per_ms).ceil() as u64;
            Take::Empty { tokens: bucket.tokens, wait_ms, next_available_ms: now + wait_ms }
        }
    }

    /// Drop all bucket state (engine destroy).
    pub fn clear(&self) {
        self.buckets.lock().expect("bucket map poisoned").clear();
    }

    #[cfg(test)]
    fn bucket_tokens(&self, key: &str) -> Option<f64> {
        self.buckets.lock().unwrap().get(key).map(|b| b.tokens)
    }
}

enum Take {
    Admitted { tokens: f64, next_available_ms: u64 },
    Empty { tokens: f64, wait_ms: u64, next_available_ms: u64 },
}

/// Why admission failed.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireError {
    /// Bucket empty and the policy does not wait.
    Rejected { key: String, wait_ms: u64 },
    /// The request was cancelled while waiting for a token.
    Cancelled(AbortReason),
    /// The key serializer failed.
    Key(String),
}

impl AcquireError {
    /// Shape the admission failure into the request's error type.
    pub fn into_fetch_error(self, method: Method, path: &str, url: &str) -> FetchError {
        match self {
            AcquireError::Rejected { key, wait_ms } => FetchError::new(
                method,
                path,
                url,
                429,
                Step::Fetch,
            )
            .with_message(format!(
                "rate limit exceeded for key {key}; next token in {wait_ms}ms"
            )),
            AcquireError::Cancelled(reason) => {
                let mut error = FetchError::new(
                    method,
                    path,
                    url,
                    crate::error::STATUS_ABORTED,
                    Step::Fetch,
                )
                .with_message("request cancelled while waiting for a rate limit token");
                error.aborted = true;
                error.timed_out = reason.is_timer();
                error
            }
            AcquireError::Key(message) => FetchError::new(
                method,
                path,
                url,
                crate::error::STATUS_UNCLASSIFIED,
                Step::Response,
            )
            .with_message(message),
        }
    }
}
