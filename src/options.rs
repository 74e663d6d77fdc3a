//! Engine and per-call options.
//!
//! Policy fields take a [`Toggle`]: `On` for the policy's defaults, `Off`
//! to disable it, `Custom` for a full config. Normalization happens once at
//! engine construction; the pipeline only ever sees one internal shape.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::cache::CacheConfig;
use crate::cancel::CancelToken;
use crate::clock::Clock;
use crate::dedupe::DedupeConfig;
use crate::error::FetchError;
use crate::method::Method;
use crate::parse::{ParseKind, TypeHint};
use crate::props::HeaderFormat;
use crate::rate_limit::RateLimitConfig;
use crate::retry::RetryConfig;
use crate::sleeper::Sleeper;
use crate::transport::RawResponse;

/// `true | false | { … }` policy input, one variant per shape.
#[derive(Debug, Clone, Default)]
pub enum Toggle<T> {
    /// Enable with defaults.
    #[default]
    On,
    /// Disable entirely.
    Off,
    /// Enable with this config.
    Custom(T),
}

macro_rules! impl_toggle_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<bool> for Toggle<$ty> {
                fn from(enabled: bool) -> Self {
                    if enabled {
                        Toggle::On
                    } else {
                        Toggle::Off
                    }
                }
            }

            impl From<$ty> for Toggle<$ty> {
                fn from(config: $ty) -> Self {
                    Toggle::Custom(config)
                }
            }
        )*
    };
}

impl_toggle_from!(RetryConfig, DedupeConfig, CacheConfig, RateLimitConfig);

/// The request as the transform hooks see it, before the URL is rebuilt.
#[derive(Debug, Clone)]
pub struct RequestInit {
    pub method: Method,
    pub headers: BTreeMap<String, String>,
    pub params: BTreeMap<String, String>,
    /// `Value::Null` when no payload is being sent.
    pub payload: Value,
    pub timeout: Option<Duration>,
}

/// Final transform hook, run per attempt with the engine state.
pub type ModifyOptions = Arc<dyn Fn(RequestInit, &Value) -> RequestInit + Send + Sync>;

/// Response-type override hook.
pub type DetermineType = Arc<dyn Fn(&RawResponse) -> TypeHint + Send + Sync>;

type MapValidator = Arc<dyn Fn(&BTreeMap<String, String>) -> Result<(), String> + Send + Sync>;
type StateValidator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Assertion callbacks. The map validators run against the engine defaults
/// at construction; with the `per_request` flags set they also run against
/// every request's final effective values.
#[derive(Clone, Default)]
pub struct Validators {
    pub headers: Option<MapValidator>,
    pub params: Option<MapValidator>,
    pub state: Option<StateValidator>,
    pub per_request_headers: bool,
    pub per_request_params: bool,
}

impl std::fmt::Debug for Validators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validators")
            .field("headers", &self.headers.as_ref().map(|_| "<fn>"))
            .field("params", &self.params.as_ref().map(|_| "<fn>"))
            .field("state", &self.state.as_ref().map(|_| "<fn>"))
            .field("per_request_headers", &self.per_request_headers)
            .field("per_request_params", &self.per_request_params)
            .finish()
    }
}

/// Engine construction options. Only `base_url` is required.
#[derive(Clone, Default)]
pub struct FetchOptions {
    pub base_url: String,
    pub default_type: Option<ParseKind>,
    pub headers: BTreeMap<String, String>,
    pub method_headers: HashMap<Method, BTreeMap<String, String>>,
    pub params: BTreeMap<String, String>,
    pub method_params: HashMap<Method, BTreeMap<String, String>>,
    /// Legacy total timeout; `total_timeout` wins when both are set.
    pub timeout: Option<Duration>,
    pub total_timeout: Option<Duration>,
    pub attempt_timeout: Option<Duration>,
    pub format_headers: HeaderFormat,
    pub determine_type: Option<DetermineType>,
    pub modify_options: Option<ModifyOptions>,
    pub modify_method_options: HashMap<Method, ModifyOptions>,
    pub validate: Validators,
    pub retry: Toggle<RetryConfig>,
    pub dedupe_policy: Toggle<DedupeConfig>,
    pub cache_policy: Toggle<CacheConfig>,
    pub rate_limit_policy: Toggle<RateLimitConfig>,
    /// Time source override, for tests.
    pub clock: Option<Arc<dyn Clock>>,
    /// Wait implementation override, for tests.
    pub sleeper: Option<Arc<dyn Sleeper>>,
}

impl std::fmt::Debug for FetchOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchOptions")
            .field("base_url", &self.base_url)
            .field("default_type", &self.default_type)
            .field("timeout", &self.timeout)
            .field("total_timeout", &self.total_timeout)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("retry", &self.retry)
            .field("dedupe_policy", &self.dedupe_policy)
            .field("cache_policy", &self.cache_policy)
            .field("rate_limit_policy", &self.rate_limit_policy)
            .finish()
    }
}

impl FetchOptions {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), ..Self::default() }
    }

    pub fn default_type(mut self, kind: ParseKind) -> Self {
        self.default_type = Some(kind);
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn method_header(mut self, method: Method, name: &str, value: &str) -> Self {
        self.method_headers
            .entry(method)
            .or_default()
            .insert(name.to_string(), value.to_string());
        self
    }

    pub fn param(mut self, name: &str, value: &str) -> Self {
        self.params.insert(name.to_string(), value.to_string());
        self
    }

    pub fn method_param(mut self, method: Method, name: &str, value: &str) -> Self {
        self.method_params
            .entry(method)
            .or_default()
            .insert(name.to_string(), value.to_string());
        self
    }

    pub fn total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = Some(timeout);
        self
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn format_headers(mut self, format: HeaderFormat) -> Self {
        self.format_headers = format;
        self
    }

    pub fn determine_type<F>(mut self, f: F) -> Self
    where
        F: Fn(&RawResponse) -> TypeHint + Send + Sync + 'static,
    {
        self.determine_type = Some(Arc::new(f));
        self
    }

    pub fn modify_options<F>(mut self, f: F) -> Self
    where
        F: Fn(RequestInit, &Value) -> RequestInit + Send + Sync + 'static,
    {
        self.modify_options = Some(Arc::new(f));
        self
    }

    pub fn modify_method_options<F>(mut self, method: Method, f: F) -> Self
    where
        F: Fn(RequestInit, &Value) -> RequestInit + Send + Sync + 'static,
    {
        self.modify_method_options.insert(method, Arc::new(f));
        self
    }

    pub fn validate(mut self, validators: Validators) -> Self {
        self.validate = validators;
        self
    }

    pub fn retry(mut self, retry: impl Into<Toggle<RetryConfig>>) -> Self {
        self.retry = retry.into();
        self
    }

    pub fn dedupe_policy(mut self, policy: impl Into<Toggle<DedupeConfig>>) -> Self {
        self.dedupe_policy = policy.into();
        self
    }

    pub fn cache_policy(mut self, policy: impl Into<Toggle<CacheConfig>>) -> Self {
        self.cache_policy = policy.into();
        self
    }

    pub fn rate_limit_policy(mut self, policy: impl Into<Toggle<RateLimitConfig>>) -> Self {
        self.rate_limit_policy = policy.into();
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }
}

/// Per-call lifecycle hooks. Fire only for the request that actually runs
/// the pipeline (the dedupe initiator), never for joiners.
pub type OnBeforeReq = Arc<dyn Fn(&RequestInit) + Send + Sync>;
pub type OnAfterReq = Arc<dyn Fn(&RawResponse) + Send + Sync>;
pub type OnError = Arc<dyn Fn(&FetchError) + Send + Sync>;

/// Per-call options.
#[derive(Clone, Default)]
pub struct RequestOptions {
    pub headers: BTreeMap<String, String>,
    pub params: BTreeMap<String, String>,
    /// Per-call total timeout override.
    pub timeout: Option<Duration>,
    /// Per-call retry override.
    pub retry: Option<Toggle<RetryConfig>>,
    /// Caller-supplied cancellation, observed alongside the engine's.
    pub cancel: Option<CancelToken>,
    /// Request payload; `Value::Null` means none.
    pub payload: Value,
    pub on_before_req: Option<OnBeforeReq>,
    pub on_after_req: Option<OnAfterReq>,
    pub on_error: Option<OnError>,
}

impl std::fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOptions")
            .field("headers", &self.headers)
            .field("params", &self.params)
            .field("timeout", &self.timeout)
            .field("payload", &self.payload)
            .finish()
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn param(mut self, name: &str, value: &str) -> Self {
        self.params.insert(name.to_string(), value.to_string());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, retry: impl Into<Toggle<RetryConfig>>) -> Self {
        self.retry = Some(retry.into());
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn on_before_req<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestInit) + Send + Sync + 'static,
    {
        self.on_before_req = Some(Arc::new(f));
        self
    }

    pub fn on_after_req<F>(mut self, f: F) -> Self
    where
        F: Fn(&RawResponse) + Send + Sync + 'static,
    {
        self.on_after_req = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&FetchError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }
}
