//! Error types for the fetch engine.
//!
//! A failed request always surfaces as a [`FetchError`] carrying the
//! HTTP-like status mapping, the pipeline step that failed, and the abort /
//! timeout attribution the retry engine keys off. Construction-time problems
//! surface synchronously as [`ConfigError`] and are never wrapped.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::method::Method;

/// Status used before any transport attempt was made.
pub const STATUS_PREFLIGHT: u16 = 0;
/// Status for aborted or timed-out requests.
pub const STATUS_ABORTED: u16 = 499;
/// Status mapped onto connection-lost transport failures.
pub const STATUS_CONNECTION_LOST: u16 = 503;
/// Status for unclassified failures and parse errors.
pub const STATUS_UNCLASSIFIED: u16 = 999;

/// Pipeline step at which a request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The transport call itself (includes pre-flight admission failures).
    Fetch,
    /// Reading or decoding the response body.
    Parse,
    /// A completed HTTP exchange with a non-ok status, or key resolution.
    Response,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Fetch => f.write_str("fetch"),
            Step::Parse => f.write_str("parse"),
            Step::Response => f.write_str("response"),
        }
    }
}

/// Structured error for a failed request.
///
/// `status` follows the engine's mapping: 200–399 never appear here, 400+
/// HTTP statuses are preserved, 499 means aborted or timed out, 503 covers
/// connection-lost transport codes, 999 is unclassified (including parse
/// failures), and 0 means the request never reached the transport.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{method} {url} failed at {step} step (status {status}): {}", self.message())]
pub struct FetchError {
    pub status: u16,
    pub method: Method,
    pub path: String,
    pub url: String,
    /// Parsed error body, or `{ "message": … }` when no body was available.
    pub data: Value,
    pub aborted: bool,
    pub timed_out: bool,
    /// 1-based attempt number the failure occurred on.
    pub attempt: u32,
    pub step: Step,
    /// Response headers snapshot, when a response was received.
    pub headers: BTreeMap<String, String>,
}

impl FetchError {
    /// Build an error with no response context yet; callers fill in the rest.
    pub(crate) fn new(method: Method, path: &str, url: &str, status: u16, step: Step) -> Self {
        Self {
            status,
            method,
            path: path.to_string(),
            url: url.to_string(),
            data: Value::Null,
            aborted: false,
            timed_out: false,
            attempt: 1,
            step,
            headers: BTreeMap::new(),
        }
    }

    pub(crate) fn with_message(mut self, message: impl Into<String>) -> Self {
        self.data = json!({ "message": message.into() });
        self
    }

    /// Best-effort human-readable message from the error data.
    pub fn message(&self) -> String {
        match &self.data {
            Value::Object(map) => match map.get("message") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => self.data.to_string(),
            },
            Value::String(s) => s.clone(),
            Value::Null => format!("request failed with status {}", self.status),
            other => other.to_string(),
        }
    }

    /// True when a timer (attempt or total) caused the failure.
    pub fn is_timeout(&self) -> bool {
        self.timed_out
    }

    /// True for user-invoked aborts; timer aborts report [`is_timeout`].
    ///
    /// [`is_timeout`]: FetchError::is_timeout
    pub fn is_cancelled(&self) -> bool {
        self.aborted && !self.timed_out
    }

    /// True when the transport reported the connection as lost.
    pub fn is_connection_lost(&self) -> bool {
        self.status == STATUS_CONNECTION_LOST && self.step == Step::Fetch
    }

    /// True for completed HTTP exchanges with a non-ok status.
    pub fn is_http_error(&self) -> bool {
        self.step == Step::Response && (400..=599).contains(&self.status)
    }
}

/// Invalid engine configuration, reported synchronously at construction.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("base_url is required")]
    MissingBaseUrl,

    #[error("base_url is not a valid absolute URL: {0}")]
    InvalidBaseUrl(#[from] url::ParseError),

    #[error("cache stale_in ({stale_in_ms}ms) must be less than ttl ({ttl_ms}ms)")]
    StaleExceedsTtl { stale_in_ms: u64, ttl_ms: u64 },

    #[error("rule match criteria must not be empty strings")]
    EmptyMatchCriteria,

    #[error("`is` match criteria cannot be combined with other criteria")]
    ExclusiveIsCriteria,

    #[error("a policy rule needs at least one match criterion")]
    RuleWithoutCriteria,

    #[error("invalid rule match pattern: {0}")]
    InvalidMatchPattern(#[from] regex::Error),

    #[error("{what} must be greater than zero")]
    ZeroDuration { what: &'static str },

    #[error("rate limit max_calls must be greater than zero")]
    ZeroCapacity,

    #[error("retry max_attempts must be greater than zero")]
    ZeroAttempts,

    #[error("validation failed: {0}")]
    Validation(String),
}
