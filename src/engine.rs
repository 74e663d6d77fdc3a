//! The request pipeline.
//!
//! [`FetchEngine`] composes the four resilience policies around a single
//! transport attempt. Order of operations for one request: rate-limit
//! admission, dedup join-or-start, cache lookup (initiator only), then the
//! retry loop around fetch + parse. Cache population and dedup settlement
//! happen on the way out; every lifecycle transition lands on the event bus.
//!
//! Cancellation is a token tree: engine root → request parent (plus any
//! caller-supplied token) → per-attempt child. The total-timeout timer
//! cancels the parent, so rate-limit waits and retry sleeps spend the same
//! budget the fetch does; the attempt timer cancels only its own attempt.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use url::Url;

use crate::cache::{CacheDecision, CacheEntry, CachePolicy};
use crate::cancel::{AbortReason, CancelSource, CancelToken, TimerKind};
use crate::clock::{Clock, MonotonicClock};
use crate::dedupe::{DedupePolicy, Entrant, InflightRegistry};
use crate::error::{
    ConfigError, FetchError, Step, STATUS_ABORTED, STATUS_PREFLIGHT, STATUS_UNCLASSIFIED,
};
use crate::events::{
    CacheEvent, DedupeEvent, ErrorEvent, EventBus, FetchEvent, PropertyEvent, RawResponseEvent,
    RequestEvent, ResponseEvent, RetryEvent, StateEvent, Subscription, UrlChangeEvent,
};
use crate::handle::FetchHandle;
use crate::key::KeyContext;
use crate::method::Method;
use crate::options::{
    DetermineType, FetchOptions, ModifyOptions, RequestInit, RequestOptions, Toggle, Validators,
};
use crate::parse::{kind_for_content_type, parse_body, Body, ParseKind, TypeHint};
use crate::props::{HeaderFormat, PropertyStore};
use crate::rate_limit::RateLimiter;
use crate::response::{FetchResponse, RequestRecord};
use crate::retry::RetryConfig;
use crate::sleeper::{sleep_cancellable, Sleeper, TokioSleeper};
use crate::transport::{RawRequest, RawResponse, Transport};

/// Whether a pipeline run serves a caller or a background revalidation.
/// Revalidations bypass the dedup registry and the cache read (they must
/// reach the transport) but still rate-limit, retry, and write the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Caller,
    Revalidation,
}

pub(crate) struct EngineInner {
    base_url: Mutex<Url>,
    default_type: ParseKind,
    headers: PropertyStore,
    params: PropertyStore,
    format_headers: HeaderFormat,
    determine_type: Option<DetermineType>,
    modify_options: Mutex<Option<ModifyOptions>>,
    modify_method_options: Mutex<HashMap<Method, ModifyOptions>>,
    validators: Validators,
    total_timeout: Option<Duration>,
    attempt_timeout: Option<Duration>,
    retry: RetryConfig,
    dedupe: Option<DedupePolicy>,
    cache: Option<CachePolicy>,
    rate_limiter: Option<RateLimiter>,
    registry: InflightRegistry,
    bus: EventBus,
    state: Mutex<Value>,
    transport: Arc<dyn Transport>,
    sleeper: Arc<dyn Sleeper>,
    root_cancel: CancelSource,
    destroyed: AtomicBool,
}

/// The engine: one immutable policy configuration plus the per-instance
/// dedup registry, rate-limit buckets, cache handle, state, and event bus.
/// Cloning is cheap and shares all of it.
#[derive(Clone)]
pub struct FetchEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for FetchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchEngine")
            .field("base_url", &self.base_url())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl FetchEngine {
    /// Build an engine over `transport`. Configuration problems surface
    /// here, synchronously, as [`ConfigError`].
    pub fn new(
        transport: Arc<dyn Transport>,
        options: FetchOptions,
    ) -> Result<Self, ConfigError> {
        if options.base_url.is_empty() {
            return Err(ConfigError::MissingBaseUrl);
        }
        let base_url = Url::parse(options.base_url.trim_end_matches('/'))?;

        let clock: Arc<dyn Clock> =
            options.clock.unwrap_or_else(|| Arc::new(MonotonicClock::default()));
        let sleeper: Arc<dyn Sleeper> =
            options.sleeper.unwrap_or_else(|| Arc::new(TokioSleeper));

        for timeout in [options.timeout, options.total_timeout, options.attempt_timeout]
            .into_iter()
            .flatten()
        {
            if timeout.is_zero() {
                return Err(ConfigError::ZeroDuration { what: "timeout" });
            }
        }

        // Construction-time validation runs against the configured defaults.
        if let Some(validate) = &options.validate.headers {
            validate(&options.headers).map_err(ConfigError::Validation)?;
        }
        if let Some(validate) = &options.validate.params {
            validate(&options.params).map_err(ConfigError::Validation)?;
        }
        if let Some(validate) = &options.validate.state {
            validate(&json!({})).map_err(ConfigError::Validation)?;
        }

        let retry = match options.retry {
            Toggle::On => RetryConfig::default(),
            Toggle::Off => RetryConfig::disabled(),
            Toggle::Custom(config) => {
                config.validate()?;
                config
            }
        };
        let dedupe = match options.dedupe_policy {
            Toggle::On => Some(DedupePolicy::new(Default::default())?),
            Toggle::Off => None,
            Toggle::Custom(config) => Some(DedupePolicy::new(config)?),
        };
        let cache = match options.cache_policy {
            Toggle::On => Some(CachePolicy::new(Default::default(), clock.clone())?),
            Toggle::Off => None,
            Toggle::Custom(config) => Some(CachePolicy::new(config, clock.clone())?),
        };
        let rate_limiter = match options.rate_limit_policy {
            Toggle::On => {
                Some(RateLimiter::new(Default::default(), clock.clone(), sleeper.clone())?)
            }
            Toggle::Off => None,
            Toggle::Custom(config) => {
                Some(RateLimiter::new(config, clock.clone(), sleeper.clone())?)
            }
        };

        Ok(Self {
            inner: Arc::new(EngineInner {
                base_url: Mutex::new(base_url),
                default_type: options.default_type.unwrap_or(ParseKind::Json),
                headers: PropertyStore::new(options.headers, options.method_headers),
                params: PropertyStore::new(options.params, options.method_params),
                format_headers: options.format_headers,
                determine_type: options.determine_type,
                modify_options: Mutex::new(options.modify_options),
                modify_method_options: Mutex::new(options.modify_method_options),
                validators: options.validate,
                total_timeout: options.total_timeout.or(options.timeout),
                attempt_timeout: options.attempt_timeout,
                retry,
                dedupe,
                cache,
                rate_limiter,
                registry: InflightRegistry::new(),
                bus: EventBus::new(),
                state: Mutex::new(json!({})),
                transport,
                sleeper,
                root_cancel: CancelSource::new(),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    /// Issue a request. The returned handle is a future; the pipeline runs
    /// as its own task, so the request proceeds even while unpolled.
    pub fn request(&self, method: Method, path: &str, options: RequestOptions) -> FetchHandle {
        let mut parents = vec![self.inner.root_cancel.token()];
        if let Some(external) = options.cancel.clone() {
            parents.push(external);
        }
        let parent = CancelSource::with_parents(parents);

        let inner = self.inner.clone();
        let path_owned = path.to_string();
        let task_parent = parent.clone();
        let task = tokio::spawn(async move {
            run_request(inner, method, path_owned, options, task_parent).await
        });
        FetchHandle::new(task, parent, method, path.to_string())
    }

    pub fn get(&self, path: &str, options: RequestOptions) -> FetchHandle {
        self.request(Method::Get, path, options)
    }

    pub fn head(&self, path: &str, options: RequestOptions) -> FetchHandle {
        self.request(Method::Head, path, options)
    }

    pub fn options_(&self, path: &str, options: RequestOptions) -> FetchHandle {
        self.request(Method::Options, path, options)
    }

    pub fn post(&self, path: &str, payload: Value, options: RequestOptions) -> FetchHandle {
        self.request(Method::Post, path, options.payload(payload))
    }

    pub fn put(&self, path: &str, payload: Value, options: RequestOptions) -> FetchHandle {
        self.request(Method::Put, path, options.payload(payload))
    }

    pub fn patch(&self, path: &str, payload: Value, options: RequestOptions) -> FetchHandle {
        self.request(Method::Patch, path, options.payload(payload))
    }

    pub fn delete(&self, path: &str, options: RequestOptions) -> FetchHandle {
        self.request(Method::Delete, path, options)
    }

    // --- observability -----------------------------------------------------

    pub fn on<F>(&self, name: &str, listener: F) -> Subscription
    where
        F: Fn(&FetchEvent) + Send + Sync + 'static,
    {
        self.inner.bus.on(name, listener)
    }

    pub fn once<F>(&self, name: &str, listener: F) -> Subscription
    where
        F: Fn(&FetchEvent) + Send + Sync + 'static,
    {
        self.inner.bus.once(name, listener)
    }

    pub fn on_pattern<F>(&self, pattern: regex::Regex, listener: F) -> Subscription
    where
        F: Fn(&FetchEvent) + Send + Sync + 'static,
    {
        self.inner.bus.on_pattern(pattern, listener)
    }

    pub fn on_any<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&FetchEvent) + Send + Sync + 'static,
    {
        self.inner.bus.on_any(listener)
    }

    /// In-flight dedup entries; zero once the engine is quiescent.
    pub fn in_flight_count(&self) -> usize {
        self.inner.registry.in_flight_count()
    }

    // --- engine properties -------------------------------------------------

    pub fn base_url(&self) -> String {
        self.inner.base_url.lock().expect("base url poisoned").to_string()
    }

    /// Change the base URL for subsequent requests.
    pub fn set_base_url(&self, base_url: &str) -> Result<(), ConfigError> {
        let parsed = Url::parse(base_url.trim_end_matches('/'))?;
        let from = {
            let mut current = self.inner.base_url.lock().expect("base url poisoned");
            let from = current.to_string();
            *current = parsed.clone();
            from
        };
        self.inner.bus.emit(&FetchEvent::UrlChange(UrlChangeEvent {
            from,
            to: parsed.to_string(),
            state: self.inner.state_snapshot(),
        }));
        Ok(())
    }

    pub fn add_header(&self, name: &str, value: &str, scope: Option<Method>) {
        self.inner.headers.set(name, value, scope);
        self.inner.bus.emit(&FetchEvent::HeaderAdd(PropertyEvent {
            name: name.to_string(),
            value: Some(value.to_string()),
            scope,
            state: self.inner.state_snapshot(),
        }));
    }

    pub fn remove_header(&self, name: &str, scope: Option<Method>) {
        if self.inner.headers.remove(name, scope) {
            self.inner.bus.emit(&FetchEvent::HeaderRemove(PropertyEvent {
                name: name.to_string(),
                value: None,
                scope,
                state: self.inner.state_snapshot(),
            }));
        }
    }

    pub fn add_param(&self, name: &str, value: &str, scope: Option<Method>) {
        self.inner.params.set(name, value, scope);
        self.inner.bus.emit(&FetchEvent::ParamAdd(PropertyEvent {
            name: name.to_string(),
            value: Some(value.to_string()),
            scope,
            state: self.inner.state_snapshot(),
        }));
    }

    pub fn remove_param(&self, name: &str, scope: Option<Method>) {
        if self.inner.params.remove(name, scope) {
            self.inner.bus.emit(&FetchEvent::ParamRemove(PropertyEvent {
                name: name.to_string(),
                value: None,
                scope,
                state: self.inner.state_snapshot(),
            }));
        }
    }

    /// Shallow-merge `patch` into the engine state passed to hooks and
    /// carried on every event.
    pub fn set_state(&self, patch: Value) {
        let snapshot = {
            let mut state = self.inner.state.lock().expect("state poisoned");
            match (&mut *state, patch) {
                (Value::Object(current), Value::Object(incoming)) => {
                    for (k, v) in incoming {
                        current.insert(k, v);
                    }
                }
                (current, incoming) => *current = incoming,
            }
            state.clone()
        };
        self.inner.bus.emit(&FetchEvent::StateSet(StateEvent { state: snapshot }));
    }

    pub fn reset_state(&self) {
        *self.inner.state.lock().expect("state poisoned") = json!({});
        self.inner.bus.emit(&FetchEvent::StateReset(StateEvent { state: json!({}) }));
    }

    pub fn state(&self) -> Value {
        self.inner.state_snapshot()
    }

    pub fn set_modify_options<F>(&self, f: F)
    where
        F: Fn(RequestInit, &Value) -> RequestInit + Send + Sync + 'static,
    {
        *self.inner.modify_options.lock().expect("modify options poisoned") =
            Some(Arc::new(f));
        self.inner.bus.emit(&FetchEvent::ModifyOptionsChange(StateEvent {
            state: self.inner.state_snapshot(),
        }));
    }

    pub fn set_modify_method_options<F>(&self, method: Method, f: F)
    where
        F: Fn(RequestInit, &Value) -> RequestInit + Send + Sync + 'static,
    {
        self.inner
            .modify_method_options
            .lock()
            .expect("modify options poisoned")
            .insert(method, Arc::new(f));
        self.inner.bus.emit(&FetchEvent::ModifyMethodOptionsChange(PropertyEvent {
            name: method.to_string(),
            value: None,
            scope: Some(method),
            state: self.inner.state_snapshot(),
        }));
    }

    // --- cache operations --------------------------------------------------

    /// Drop every cached entry. In-flight requests are unaffected.
    pub async fn clear_cache(&self) {
        if let Some(cache) = &self.inner.cache {
            cache.adapter().clear().await;
        }
    }

    /// Drop one cached entry by its serialized key.
    pub async fn delete_cache(&self, key: &str) -> bool {
        match &self.inner.cache {
            Some(cache) => cache.adapter().delete(key).await,
            None => false,
        }
    }

    pub async fn cache_size(&self) -> usize {
        match &self.inner.cache {
            Some(cache) => cache.adapter().len().await,
            None => 0,
        }
    }

    // --- teardown ----------------------------------------------------------

    /// Abort in-flight requests, clear dedup and rate-limit state, and fail
    /// all future requests. Idempotent.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("engine destroyed");
        self.inner.root_cancel.cancel(AbortReason::EngineDestroyed);
        self.inner.registry.clear();
        if let Some(limiter) = &self.inner.rate_limiter {
            limiter.clear();
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }
}

impl EngineInner {
    fn state_snapshot(&self) -> Value {
        self.state.lock().expect("state poisoned").clone()
    }

    fn base(&self) -> Url {
        self.base_url.lock().expect("base url poisoned").clone()
    }

    /// Join `path` onto the base URL and merge `params` into its query.
    /// Query pairs already present on the path win over store params.
    fn build_url(&self, path: &str, params: &BTreeMap<String, String>) -> Result<Url, String> {
        let base = self.base();
        let path = if path.is_empty() { "/" } else { path };
        let separator = if path.starts_with('/') || path.starts_with('?') { "" } else { "/" };
        let joined = format!("{}{}{}", base.as_str().trim_end_matches('/'), separator, path);
        let mut url = Url::parse(&joined).map_err(|e| e.to_string())?;

        if !params.is_empty() {
            let existing: Vec<(String, String)> = url.query_pairs().into_owned().collect();
            let mut pairs = existing.clone();
            for (name, value) in params {
                if !existing.iter().any(|(k, _)| k == name) {
                    pairs.push((name.clone(), value.clone()));
                }
            }
            if pairs.is_empty() {
                url.set_query(None);
            } else {
                url.query_pairs_mut().clear().extend_pairs(pairs).finish();
            }
        }
        // Fragments never reach the wire or the identity keys.
        url.set_fragment(None);
        Ok(url)
    }
}

fn preflight_error(method: Method, path: &str, url: &str, message: String) -> FetchError {
    FetchError::new(method, path, url, STATUS_PREFLIGHT, Step::Fetch).with_message(message)
}

fn key_error(method: Method, path: &str, url: &str, message: String) -> FetchError {
    FetchError::new(method, path, url, STATUS_UNCLASSIFIED, Step::Response).with_message(message)
}

fn abort_error(
    method: Method,
    path: &str,
    url: &str,
    reason: &AbortReason,
    attempt: u32,
) -> FetchError {
    let mut error = FetchError::new(method, path, url, STATUS_ABORTED, Step::Fetch);
    error.aborted = true;
    error.timed_out = reason.is_timer();
    error.attempt = attempt;
    error.data = match reason {
        AbortReason::User(Some(text)) => json!({ "message": format!("request aborted: {text}") }),
        AbortReason::User(None) => json!({ "message": "request aborted" }),
        AbortReason::Timer(TimerKind::Total) => json!({ "message": "total timeout exceeded" }),
        AbortReason::Timer(TimerKind::Attempt) => json!({ "message": "attempt timeout exceeded" }),
        AbortReason::EngineDestroyed => json!({ "message": "engine is destroyed" }),
    };
    error
}

/// Outer wrapper: drives the pipeline, then emits exactly one terminal
/// event (`fetch-response` / `fetch-abort` / `fetch-error`) and runs the
/// caller's `on_error` hook.
async fn run_request(
    inner: Arc<EngineInner>,
    method: Method,
    path: String,
    options: RequestOptions,
    parent: CancelSource,
) -> Result<FetchResponse, FetchError> {
    let result = drive(&inner, method, &path, &options, &parent, Scope::Caller).await;

    let state = inner.state_snapshot();
    match &result {
        Ok(response) => {
            inner.bus.emit(&FetchEvent::Response(ResponseEvent {
                method,
                path: path.clone(),
                url: response.request.url.clone(),
                status: response.status,
                data: response.data.clone(),
                attempt: response.attempt,
                state,
            }));
        }
        Err(error) if error.aborted => {
            inner
                .bus
                .emit(&FetchEvent::Abort(ErrorEvent { error: error.clone(), state }));
        }
        Err(error) => {
            inner
                .bus
                .emit(&FetchEvent::Error(ErrorEvent { error: error.clone(), state }));
        }
    }

    if let Err(error) = &result {
        if let Some(on_error) = &options.on_error {
            on_error(error);
        }
    }
    result
}

/// Type-erased re-entry into the pipeline for background revalidations.
/// Boxing breaks the future-type cycle `drive` → SWR → `drive`.
fn drive_boxed(
    inner: Arc<EngineInner>,
    method: Method,
    path: String,
    options: RequestOptions,
    parent: CancelSource,
) -> BoxFuture<'static, Result<FetchResponse, FetchError>> {
    Box::pin(async move {
        drive(&inner, method, &path, &options, &parent, Scope::Revalidation).await
    })
}

/// Arm the total-timeout timer and run admission + the policy pipeline.
async fn drive(
    inner: &Arc<EngineInner>,
    method: Method,
    path: &str,
    options: &RequestOptions,
    parent: &CancelSource,
    scope: Scope,
) -> Result<FetchResponse, FetchError> {
    if inner.destroyed.load(Ordering::SeqCst) {
        return Err(preflight_error(method, path, "", "engine is destroyed".to_string()));
    }

    let total = options.timeout.or(inner.total_timeout);
    if let Some(timeout) = total {
        if timeout.is_zero() {
            return Err(preflight_error(
                method,
                path,
                "",
                "timeout must be greater than zero".to_string(),
            ));
        }
    }

    let timer = total.map(|timeout| {
        let source = parent.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            source.cancel(AbortReason::Timer(TimerKind::Total));
        })
    });

    let result = admit_and_run(inner, method, path, options, parent.token(), scope).await;

    if let Some(timer) = timer {
        timer.abort();
    }
    result
}

/// Rate-limit admission, then dedup join-or-start, then cache + retry.
async fn admit_and_run(
    inner: &Arc<EngineInner>,
    method: Method,
    path: &str,
    options: &RequestOptions,
    parent: CancelToken,
    scope: Scope,
) -> Result<FetchResponse, FetchError> {
    let request_headers =
        inner.headers.resolve_formatted(method, &options.headers, &inner.format_headers);
    let request_params = inner.params.resolve(method, &options.params);
    let url = inner
        .build_url(path, &request_params)
        .map_err(|e| preflight_error(method, path, "", format!("invalid request URL: {e}")))?;
    let state = inner.state_snapshot();

    let key_ctx = KeyContext {
        method,
        path,
        url: &url,
        payload: &options.payload,
        headers: &request_headers,
    };

    if let Some(limiter) = &inner.rate_limiter {
        limiter
            .acquire(&key_ctx, &state, &inner.bus, &parent)
            .await
            .map_err(|e| e.into_fetch_error(method, path, url.as_str()))?;
    }

    let dedupe_key = match (scope, &inner.dedupe) {
        (Scope::Caller, Some(policy)) => policy
            .key_for(&key_ctx)
            .map_err(|e| key_error(method, path, url.as_str(), e.to_string()))?,
        _ => None,
    };

    let Some(key) = dedupe_key else {
        return cached_or_fetch(inner, method, path, options, &parent, scope, &url).await;
    };

    match inner.registry.join_or_start(&key) {
        Entrant::Initiator => {
            inner.bus.emit(&FetchEvent::DedupeStart(DedupeEvent {
                key: key.clone(),
                method,
                path: path.to_string(),
                waiting_count: 1,
                error: None,
                state: state.clone(),
            }));

            let result =
                cached_or_fetch(inner, method, path, options, &parent, scope, &url).await;

            let waiting = inner.registry.settle(&key, result.clone());
            let state = inner.state_snapshot();
            match &result {
                Ok(_) => inner.bus.emit(&FetchEvent::DedupeComplete(DedupeEvent {
                    key,
                    method,
                    path: path.to_string(),
                    waiting_count: waiting,
                    error: None,
                    state,
                })),
                Err(error) => inner.bus.emit(&FetchEvent::DedupeError(DedupeEvent {
                    key,
                    method,
                    path: path.to_string(),
                    waiting_count: waiting,
                    error: Some(error.clone()),
                    state,
                })),
            }
            result
        }
        Entrant::Joiner { mut rx, waiting_count } => {
            inner.bus.emit(&FetchEvent::DedupeJoin(DedupeEvent {
                key: key.clone(),
                method,
                path: path.to_string(),
                waiting_count,
                error: None,
                state,
            }));

            tokio::select! {
                received = rx.recv() => match received {
                    Ok(settlement) => settlement,
                    // Registry cleared under us: only destroy does that.
                    Err(_) => Err(abort_error(
                        method, path, url.as_str(), &AbortReason::EngineDestroyed, 1,
                    )),
                },
                reason = parent.cancelled() => {
                    inner.registry.leave(&key);
                    Err(abort_error(method, path, url.as_str(), &reason, 1))
                }
            }
        }
    }
}

/// Cache lookup (fresh hit / stale SWR / miss) around the retry loop.
async fn cached_or_fetch(
    inner: &Arc<EngineInner>,
    method: Method,
    path: &str,
    options: &RequestOptions,
    parent: &CancelToken,
    scope: Scope,
    url: &Url,
) -> Result<FetchResponse, FetchError> {
    let cache = match (&inner.cache, scope) {
        (Some(cache), Scope::Caller) => cache,
        _ => return retry_loop(inner, method, path, options, parent, url).await,
    };

    let request_headers =
        inner.headers.resolve_formatted(method, &options.headers, &inner.format_headers);
    let key_ctx = KeyContext {
        method,
        path,
        url,
        payload: &options.payload,
        headers: &request_headers,
    };
    let decision = match cache
        .decide(&key_ctx)
        .map_err(|e| key_error(method, path, url.as_str(), e.to_string()))?
    {
        Some(decision) => decision,
        None => return retry_loop(inner, method, path, options, parent, url).await,
    };

    let state = inner.state_snapshot();
    let now = cache.now_millis();
    if let Some(entry) = cache.adapter().get(&decision.key).await {
        match entry.freshness(now) {
            crate::cache::Freshness::Fresh => {
                tracing::debug!(key = %decision.key, "cache hit");
                inner.bus.emit(&FetchEvent::CacheHit(CacheEvent {
                    key: decision.key.clone(),
                    method,
                    path: path.to_string(),
                    error: None,
                    state,
                }));
                return Ok(response_from_entry(&entry, method, path, url));
            }
            crate::cache::Freshness::Stale => {
                inner.bus.emit(&FetchEvent::CacheStale(CacheEvent {
                    key: decision.key.clone(),
                    method,
                    path: path.to_string(),
                    error: None,
                    state,
                }));
                return stale_while_revalidate(
                    inner, method, path, options, parent, url, entry, decision,
                )
                .await;
            }
            crate::cache::Freshness::Expired => {}
        }
    }

    inner.bus.emit(&FetchEvent::CacheMiss(CacheEvent {
        key: decision.key.clone(),
        method,
        path: path.to_string(),
        error: None,
        state,
    }));

    let response = retry_loop(inner, method, path, options, parent, url).await?;
    store_response(inner, cache, &decision, method, path, &response).await;
    Ok(response)
}

/// Serve the stale entry, racing a background revalidation against the
/// stale timeout. The revalidation runs under the engine root token only —
/// the caller settling (or aborting) must not cancel it, so a won-by-timer
/// race still completes into the cache.
#[allow(clippy::too_many_arguments)]
async fn stale_while_revalidate(
    inner: &Arc<EngineInner>,
    method: Method,
    path: &str,
    options: &RequestOptions,
    parent: &CancelToken,
    url: &Url,
    entry: CacheEntry,
    decision: CacheDecision,
) -> Result<FetchResponse, FetchError> {
    let cache = inner.cache.as_ref().expect("swr requires a cache policy");
    let stale_response = response_from_entry(&entry, method, path, url);

    // Single-flight: the revalidation lock decides who spawns.
    let locked = cache.set_revalidating(&decision.key, true).await;
    if !locked {
        return Ok(stale_response);
    }

    inner.bus.emit(&FetchEvent::CacheRevalidate(CacheEvent {
        key: decision.key.clone(),
        method,
        path: path.to_string(),
        error: None,
        state: inner.state_snapshot(),
    }));

    let mut revalidation = {
        let inner = inner.clone();
        let path = path.to_string();
        let background = RequestOptions {
            headers: options.headers.clone(),
            params: options.params.clone(),
            payload: options.payload.clone(),
            retry: options.retry.clone(),
            // Background work: no caller hooks, timeout, or cancel token.
            ..RequestOptions::default()
        };
        let decision = decision.clone();
        tokio::spawn(async move {
            let source = CancelSource::with_parents(vec![inner.root_cancel.token()]);
            let result =
                drive_boxed(inner.clone(), method, path.clone(), background, source).await;
            match &result {
                Ok(response) => {
                    let cache = inner.cache.as_ref().expect("swr requires a cache policy");
                    store_response(&inner, cache, &decision, method, &path, response).await;
                }
                Err(error) => {
                    tracing::warn!(key = %decision.key, error = %error, "revalidation failed");
                    let cache = inner.cache.as_ref().expect("swr requires a cache policy");
                    cache.set_revalidating(&decision.key, false).await;
                    inner.bus.emit(&FetchEvent::CacheRevalidateError(CacheEvent {
                        key: decision.key.clone(),
                        method,
                        path: path.clone(),
                        error: Some(error.clone()),
                        state: inner.state_snapshot(),
                    }));
                }
            }
            result
        })
    };

    let stale_timeout = decision.stale_timeout.unwrap_or(Duration::ZERO);
    if stale_timeout.is_zero() {
        return Ok(stale_response);
    }

    tokio::select! {
        joined = &mut revalidation => {
            match joined {
                Ok(Ok(fresh)) => Ok(fresh),
                // Revalidation errors never surface to the stale-served
                // caller; they were emitted as events above.
                _ => Ok(stale_response),
            }
        }
        _ = tokio::time::sleep(stale_timeout) => Ok(stale_response),
        reason = parent.cancelled() => {
            Err(abort_error(method, path, url.as_str(), &reason, 1))
        }
    }
}

async fn store_response(
    inner: &Arc<EngineInner>,
    cache: &CachePolicy,
    decision: &CacheDecision,
    method: Method,
    path: &str,
    response: &FetchResponse,
) {
    let content_type = response.headers.get("content-type").cloned();
    let entry = cache.build_entry(
        decision,
        response.data.clone(),
        response.status,
        response.headers.clone(),
        content_type,
    );
    cache.adapter().set(&decision.key, entry).await;
    inner.bus.emit(&FetchEvent::CacheSet(CacheEvent {
        key: decision.key.clone(),
        method,
        path: path.to_string(),
        error: None,
        state: inner.state_snapshot(),
    }));
}

fn response_from_entry(
    entry: &CacheEntry,
    method: Method,
    path: &str,
    url: &Url,
) -> FetchResponse {
    FetchResponse {
        data: entry.value.clone(),
        status: entry.status,
        headers: entry.headers.clone(),
        request: RequestRecord {
            method,
            path: path.to_string(),
            url: url.to_string(),
            headers: BTreeMap::new(),
            payload: Value::Null,
        },
        attempt: 1,
        from_cache: true,
    }
}

/// The retry loop around one attempt (fetch + parse).
async fn retry_loop(
    inner: &Arc<EngineInner>,
    method: Method,
    path: &str,
    options: &RequestOptions,
    parent: &CancelToken,
    url: &Url,
) -> Result<FetchResponse, FetchError> {
    let retry = match &options.retry {
        None => inner.retry.clone(),
        Some(Toggle::On) => RetryConfig::default(),
        Some(Toggle::Off) => RetryConfig::disabled(),
        Some(Toggle::Custom(config)) => {
            config.validate().map_err(|e| {
                preflight_error(method, path, url.as_str(), e.to_string())
            })?;
            config.clone()
        }
    };

    let mut attempt: u32 = 1;
    loop {
        let result = run_attempt(inner, method, path, options, parent, attempt).await;
        let mut error = match result {
            Ok(response) => return Ok(response),
            Err(error) => error,
        };
        error.attempt = attempt;

        if attempt >= retry.max_attempts {
            return Err(error);
        }
        // A dead parent means the total budget is spent (or the caller
        // aborted); no further attempts regardless of classification.
        if parent.is_cancelled() {
            return Err(error);
        }
        let verdict = retry.verdict(&error);
        if !verdict.should_retry() {
            return Err(error);
        }

        let delay = retry.delay_for(attempt, verdict);
        tracing::debug!(
            method = %method,
            path,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "retrying after failure"
        );
        inner.bus.emit(&FetchEvent::Retry(RetryEvent {
            attempt,
            next_attempt: attempt + 1,
            delay,
            error: error.clone(),
            state: inner.state_snapshot(),
        }));

        if let Err(reason) = sleep_cancellable(inner.sleeper.as_ref(), delay, parent).await {
            return Err(abort_error(method, path, url.as_str(), &reason, attempt));
        }
        attempt += 1;
    }
}

/// One attempt: build the effective request, fetch under the attempt token,
/// parse, and classify.
async fn run_attempt(
    inner: &Arc<EngineInner>,
    method: Method,
    path: &str,
    options: &RequestOptions,
    parent: &CancelToken,
    attempt: u32,
) -> Result<FetchResponse, FetchError> {
    // Fresh child token per attempt when an attempt budget is configured;
    // otherwise every attempt shares the parent.
    let (attempt_token, attempt_timer) = match inner.attempt_timeout {
        Some(timeout) => {
            let source = parent.child_source();
            let timer_source = source.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                timer_source.cancel(AbortReason::Timer(TimerKind::Attempt));
            });
            (source.token(), Some(timer))
        }
        None => (parent.clone(), None),
    };

    let result =
        attempt_once(inner, method, path, options, &attempt_token, attempt).await;

    if let Some(timer) = attempt_timer {
        timer.abort();
    }
    result
}

async fn attempt_once(
    inner: &Arc<EngineInner>,
    method: Method,
    path: &str,
    options: &RequestOptions,
    attempt_token: &CancelToken,
    attempt: u32,
) -> Result<FetchResponse, FetchError> {
    let state = inner.state_snapshot();

    // 1. Effective request: merged properties, then the transform hooks.
    let mut init = RequestInit {
        method,
        headers: inner.headers.resolve_formatted(
            method,
            &options.headers,
            &inner.format_headers,
        ),
        params: inner.params.resolve(method, &options.params),
        payload: options.payload.clone(),
        timeout: inner.attempt_timeout.or(options.timeout).or(inner.total_timeout),
    };
    if let Some(modify) = inner.modify_options.lock().expect("modify options poisoned").clone()
    {
        init = modify(init, &state);
    }
    let method_modify = inner
        .modify_method_options
        .lock()
        .expect("modify options poisoned")
        .get(&method)
        .cloned();
    if let Some(modify) = method_modify {
        init = modify(init, &state);
    }

    // 2. Per-request validation runs against the final effective values.
    if inner.validators.per_request_headers {
        if let Some(validate) = &inner.validators.headers {
            validate(&init.headers).map_err(|message| {
                FetchError::new(method, path, "", STATUS_PREFLIGHT, Step::Response)
                    .with_message(message)
            })?;
        }
    }
    if inner.validators.per_request_params {
        if let Some(validate) = &inner.validators.params {
            validate(&init.params).map_err(|message| {
                FetchError::new(method, path, "", STATUS_PREFLIGHT, Step::Response)
                    .with_message(message)
            })?;
        }
    }

    // 3. Rebuild the URL with the (possibly rewritten) params.
    let url = inner
        .build_url(path, &init.params)
        .map_err(|e| preflight_error(method, path, "", format!("invalid request URL: {e}")))?;

    // 4. Encode the payload for body-bearing methods.
    let body = if method.is_body_bearing() && !init.payload.is_null() {
        match inner.default_type {
            ParseKind::Json => {
                init.headers
                    .entry(inner.format_headers.apply("content-type"))
                    .or_insert_with(|| "application/json".to_string());
                Some(bytes::Bytes::from(init.payload.to_string()))
            }
            _ => Some(match &init.payload {
                Value::String(text) => bytes::Bytes::from(text.clone()),
                other => bytes::Bytes::from(other.to_string()),
            }),
        }
    } else {
        None
    };

    if let Some(on_before) = &options.on_before_req {
        on_before(&init);
    }
    inner.bus.emit(&FetchEvent::Before(RequestEvent {
        method,
        path: path.to_string(),
        url: url.to_string(),
        headers: init.headers.clone(),
        payload: init.payload.clone(),
        attempt,
        state: state.clone(),
    }));

    // 5. Fetch, racing the attempt token. On cancellation the transport
    //    future is dropped, not completed.
    let raw_request =
        RawRequest { method, url: url.clone(), headers: init.headers.clone(), body };
    let fetched = tokio::select! {
        fetched = inner.transport.fetch(&raw_request) => fetched,
        reason = attempt_token.cancelled() => {
            return Err(abort_error(method, path, url.as_str(), &reason, attempt));
        }
    };

    let raw = match fetched {
        Ok(raw) => raw,
        Err(transport_error) => {
            let mut error = FetchError::new(
                method,
                path,
                url.as_str(),
                transport_error.status(),
                Step::Fetch,
            )
            .with_message(transport_error.to_string());
            error.attempt = attempt;
            return Err(error);
        }
    };

    if let Some(on_after) = &options.on_after_req {
        on_after(&raw);
    }
    inner.bus.emit(&FetchEvent::After(RawResponseEvent {
        method,
        path: path.to_string(),
        url: url.to_string(),
        status: raw.status,
        headers: raw.headers.clone(),
        attempt,
        state: state.clone(),
    }));

    // 6. Parse by hook, content-type tables, or the configured default.
    let data = parse_raw(inner, method, path, &url, &raw, attempt)?;

    // 7. Classify.
    if raw.is_ok() {
        Ok(FetchResponse {
            data,
            status: raw.status,
            headers: raw.headers,
            request: RequestRecord {
                method,
                path: path.to_string(),
                url: url.to_string(),
                headers: init.headers,
                payload: init.payload,
            },
            attempt,
            from_cache: false,
        })
    } else {
        let mut error =
            FetchError::new(method, path, url.as_str(), raw.status, Step::Response);
        error.attempt = attempt;
        error.headers = raw.headers;
        error.data = data.into_error_data();
        if error.data.is_null() {
            error.data = json!({ "message": format!("request failed with status {}", raw.status) });
        }
        Err(error)
    }
}

fn parse_raw(
    inner: &Arc<EngineInner>,
    method: Method,
    path: &str,
    url: &Url,
    raw: &RawResponse,
    attempt: u32,
) -> Result<Body, FetchError> {
    let parse_status = |raw: &RawResponse| {
        if raw.status >= 400 {
            raw.status
        } else {
            STATUS_UNCLASSIFIED
        }
    };

    let hint = match &inner.determine_type {
        Some(determine) => determine(raw),
        None => TypeHint::UseDefault,
    };
    let kind = match hint {
        TypeHint::Kind(kind) => kind,
        TypeHint::UseDefault => {
            kind_for_content_type(raw.content_type(), inner.default_type).map_err(|e| {
                let mut error = FetchError::new(
                    method,
                    path,
                    url.as_str(),
                    parse_status(raw),
                    Step::Parse,
                )
                .with_message(e.to_string());
                error.attempt = attempt;
                error.headers = raw.headers.clone();
                error
            })?
        }
    };

    parse_body(kind, raw.body.clone(), raw.content_type()).map_err(|e| {
        let mut error =
            FetchError::new(method, path, url.as_str(), parse_status(raw), Step::Parse)
                .with_message(e.to_string());
        error.attempt = attempt;
        error.headers = raw.headers.clone();
        error
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockTransport, ScriptedResponse};

    fn engine(options: FetchOptions) -> (FetchEngine, MockTransport) {
        let transport = MockTransport::new();
        let engine = FetchEngine::new(Arc::new(transport.clone()), options).unwrap();
        (engine, transport)
    }

    fn bare_options() -> FetchOptions {
        // Policies off so unit tests drive the plain pipeline.
        FetchOptions::new("https://api.test")
            .retry(false)
            .dedupe_policy(false)
            .cache_policy(false)
            .rate_limit_policy(false)
    }

    #[tokio::test]
    async fn simple_get_round_trip() {
        let (engine, transport) = engine(bare_options());
        transport.respond_with(
            Method::Get,
            "/users",
            ScriptedResponse::json(200, json!({"users": []})),
        );

        let response = engine.get("/users", RequestOptions::new()).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.data.as_value().unwrap(), &json!({"users": []}));
        assert_eq!(response.attempt, 1);
        assert!(!response.from_cache);
    }

    #[tokio::test]
    async fn http_error_carries_parsed_body_and_step() {
        let (engine, transport) = engine(bare_options());
        transport.respond_with(
            Method::Get,
            "/missing",
            ScriptedResponse::json(404, json!({"message": "nope"})),
        );

        let error = engine.get("/missing", RequestOptions::new()).await.unwrap_err();
        assert_eq!(error.status, 404);
        assert_eq!(error.step, Step::Response);
        assert_eq!(error.message(), "nope");
        assert!(error.is_http_error());
    }

    #[tokio::test]
    async fn missing_base_url_is_a_config_error() {
        let err = FetchEngine::new(
            Arc::new(MockTransport::new()),
            FetchOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingBaseUrl));
    }

    #[tokio::test]
    async fn empty_path_resolves_to_root() {
        let (engine, transport) = engine(bare_options());
        transport.respond_with(Method::Get, "/", ScriptedResponse::json(200, json!(1)));

        let response = engine.get("", RequestOptions::new()).await.unwrap();
        assert_eq!(response.request.url, "https://api.test/");
    }

    #[tokio::test]
    async fn base_path_is_preserved_when_joining() {
        let transport = MockTransport::new();
        let engine = FetchEngine::new(
            Arc::new(transport.clone()),
            FetchOptions::new("https://api.test/v1/")
                .retry(false)
                .dedupe_policy(false)
                .cache_policy(false)
                .rate_limit_policy(false),
        )
        .unwrap();
        transport.respond_with(Method::Get, "/v1/users", ScriptedResponse::json(200, json!(1)));

        let response = engine.get("/users", RequestOptions::new()).await.unwrap();
        assert_eq!(response.request.url, "https://api.test/v1/users");
    }

    #[tokio::test]
    async fn params_merge_and_path_query_wins() {
        let transport = MockTransport::new();
        let engine = FetchEngine::new(
            Arc::new(transport.clone()),
            bare_options().param("version", "2").param("page", "1"),
        )
        .unwrap();
        transport.respond_with(Method::Get, "/items", ScriptedResponse::json(200, json!(1)));

        let response =
            engine.get("/items?page=9", RequestOptions::new()).await.unwrap();
        let url = Url::parse(&response.request.url).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("page".to_string(), "9".to_string())));
        assert!(pairs.contains(&("version".to_string(), "2".to_string())));
        assert!(!pairs.contains(&("page".to_string(), "1".to_string())));
    }

    #[tokio::test]
    async fn fragments_are_stripped_from_the_wire() {
        let (engine, transport) = engine(bare_options());
        transport.respond_with(Method::Get, "/doc", ScriptedResponse::json(200, json!(1)));

        let response = engine.get("/doc#section", RequestOptions::new()).await.unwrap();
        assert!(!response.request.url.contains('#'));
    }

    #[tokio::test]
    async fn post_encodes_json_payload() {
        let (engine, transport) = engine(bare_options());
        transport.respond_with(Method::Post, "/users", ScriptedResponse::json(201, json!({})));

        engine
            .post("/users", json!({"name": "ada"}), RequestOptions::new())
            .await
            .unwrap();
        let calls = transport.calls();
        let body = calls[0].body.as_ref().unwrap();
        assert_eq!(
            serde_json::from_slice::<Value>(body).unwrap(),
            json!({"name": "ada"})
        );
        assert_eq!(calls[0].headers.get("content-type").unwrap(), "application/json");
    }

    #[tokio::test]
    async fn get_sends_no_body_even_with_payload() {
        let (engine, transport) = engine(bare_options());
        transport.respond_with(Method::Get, "/x", ScriptedResponse::json(200, json!(1)));

        engine
            .request(
                Method::Get,
                "/x",
                RequestOptions::new().payload(json!({"ignored": true})),
            )
            .await
            .unwrap();
        assert!(transport.calls()[0].body.is_none());
    }

    #[tokio::test]
    async fn modify_options_hook_rewrites_headers() {
        let transport = MockTransport::new();
        let engine = FetchEngine::new(
            Arc::new(transport.clone()),
            bare_options().modify_options(|mut init, _state| {
                init.headers.insert("x-injected".to_string(), "yes".to_string());
                init
            }),
        )
        .unwrap();
        transport.respond_with(Method::Get, "/x", ScriptedResponse::json(200, json!(1)));

        engine.get("/x", RequestOptions::new()).await.unwrap();
        assert_eq!(transport.calls()[0].headers.get("x-injected").unwrap(), "yes");
    }

    #[tokio::test]
    async fn method_modify_hook_runs_after_global() {
        let transport = MockTransport::new();
        let engine = FetchEngine::new(
            Arc::new(transport.clone()),
            bare_options()
                .modify_options(|mut init, _| {
                    init.headers.insert("x-step".to_string(), "global".to_string());
                    init
                })
                .modify_method_options(Method::Get, |mut init, _| {
                    init.headers.insert("x-step".to_string(), "method".to_string());
                    init
                }),
        )
        .unwrap();
        transport.respond_with(Method::Get, "/x", ScriptedResponse::json(200, json!(1)));

        engine.get("/x", RequestOptions::new()).await.unwrap();
        assert_eq!(transport.calls()[0].headers.get("x-step").unwrap(), "method");
    }

    #[tokio::test]
    async fn state_is_passed_to_hooks_and_merged() {
        let seen = Arc::new(Mutex::new(Value::Null));
        let sink = seen.clone();
        let transport = MockTransport::new();
        let engine = FetchEngine::new(
            Arc::new(transport.clone()),
            bare_options().modify_options(move |init, state| {
                *sink.lock().unwrap() = state.clone();
                init
            }),
        )
        .unwrap();
        transport.respond_with(Method::Get, "/x", ScriptedResponse::json(200, json!(1)));

        engine.set_state(json!({"tenant": "a"}));
        engine.set_state(json!({"user": 7}));
        engine.get("/x", RequestOptions::new()).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), json!({"tenant": "a", "user": 7}));

        engine.reset_state();
        assert_eq!(engine.state(), json!({}));
    }

    #[tokio::test]
    async fn per_request_validation_failure_rejects_before_fetch() {
        let transport = MockTransport::new();
        let engine = FetchEngine::new(
            Arc::new(transport.clone()),
            bare_options().validate(Validators {
                headers: Some(Arc::new(|headers: &BTreeMap<String, String>| {
                    if headers.contains_key("x-forbidden") {
                        Err("x-forbidden is not allowed".to_string())
                    } else {
                        Ok(())
                    }
                })),
                per_request_headers: true,
                ..Validators::default()
            }),
        )
        .unwrap();

        let error = engine
            .get("/x", RequestOptions::new().header("x-forbidden", "1"))
            .await
            .unwrap_err();
        assert_eq!(error.status, STATUS_PREFLIGHT);
        assert!(error.message().contains("x-forbidden"));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn destroy_fails_new_requests_and_is_idempotent() {
        let (engine, transport) = engine(bare_options());
        transport.respond_with(Method::Get, "/x", ScriptedResponse::json(200, json!(1)));

        engine.destroy();
        engine.destroy();
        assert!(engine.is_destroyed());

        let error = engine.get("/x", RequestOptions::new()).await.unwrap_err();
        assert!(error.message().contains("destroyed"));
        assert_eq!(transport.call_count(), 0);
        assert_eq!(engine.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn header_and_param_mutators_emit_events() {
        let (engine, _transport) = engine(bare_options());
        let names = Arc::new(Mutex::new(Vec::new()));
        let sink = names.clone();
        let _sub = engine.on_pattern(
            regex::Regex::new("^fetch-(header|param)-").unwrap(),
            move |event| sink.lock().unwrap().push(event.name().to_string()),
        );

        engine.add_header("x-a", "1", None);
        engine.remove_header("x-a", None);
        engine.remove_header("x-a", None); // absent: no event
        engine.add_param("p", "1", Some(Method::Get));
        engine.remove_param("p", Some(Method::Get));

        assert_eq!(
            *names.lock().unwrap(),
            vec![
                "fetch-header-add",
                "fetch-header-remove",
                "fetch-param-add",
                "fetch-param-remove"
            ]
        );
    }

    #[tokio::test]
    async fn set_base_url_emits_url_change() {
        let (engine, transport) = engine(bare_options());
        let changed = Arc::new(Mutex::new(None));
        let sink = changed.clone();
        let _sub = engine.on("fetch-url-change", move |event| {
            if let FetchEvent::UrlChange(e) = event {
                *sink.lock().unwrap() = Some((e.from.clone(), e.to.clone()));
            }
        });

        engine.set_base_url("https://api2.test").unwrap();
        let (from, to) = changed.lock().unwrap().clone().unwrap();
        assert!(from.starts_with("https://api.test"));
        assert!(to.starts_with("https://api2.test"));

        transport.respond_with(Method::Get, "/x", ScriptedResponse::json(200, json!(1)));
        let response = engine.get("/x", RequestOptions::new()).await.unwrap();
        assert!(response.request.url.starts_with("https://api2.test"));
    }

    #[tokio::test]
    async fn exactly_one_terminal_event_per_request() {
        let (engine, transport) = engine(bare_options());
        transport.enqueue(Method::Get, "/x", ScriptedResponse::json(200, json!(1)));
        transport.respond_with(Method::Get, "/x", ScriptedResponse::status(500));

        let terminal = Arc::new(Mutex::new(Vec::new()));
        let sink = terminal.clone();
        let _sub = engine.on_pattern(
            regex::Regex::new("^fetch-(response|error|abort)$").unwrap(),
            move |event| sink.lock().unwrap().push(event.name().to_string()),
        );

        let _ = engine.get("/x", RequestOptions::new()).await;
        let _ = engine.get("/x", RequestOptions::new()).await;
        assert_eq!(*terminal.lock().unwrap(), vec!["fetch-response", "fetch-error"]);
    }

    #[tokio::test]
    async fn on_error_hook_runs_before_rejection() {
        let (engine, transport) = engine(bare_options());
        transport.respond_with(Method::Get, "/x", ScriptedResponse::status(500));

        let hook_status = Arc::new(Mutex::new(0u16));
        let sink = hook_status.clone();
        let error = engine
            .get(
                "/x",
                RequestOptions::new().on_error(move |e| *sink.lock().unwrap() = e.status),
            )
            .await
            .unwrap_err();
        assert_eq!(error.status, 500);
        assert_eq!(*hook_status.lock().unwrap(), 500);
    }

    #[tokio::test]
    async fn determine_type_hook_overrides_tables() {
        let transport = MockTransport::new();
        let engine = FetchEngine::new(
            Arc::new(transport.clone()),
            bare_options().determine_type(|_raw| TypeHint::Kind(ParseKind::Text)),
        )
        .unwrap();
        transport
            .respond_with(Method::Get, "/x", ScriptedResponse::json(200, json!({"a": 1})));

        let response = engine.get("/x", RequestOptions::new()).await.unwrap();
        assert_eq!(response.data.as_text().unwrap(), r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn unknown_content_type_is_a_parse_error() {
        let (engine, transport) = engine(bare_options());
        transport.respond_with(
            Method::Get,
            "/x",
            ScriptedResponse::text(200, "???").with_header("content-type", "wat/nope"),
        );

        let error = engine.get("/x", RequestOptions::new()).await.unwrap_err();
        assert_eq!(error.step, Step::Parse);
        assert_eq!(error.status, STATUS_UNCLASSIFIED);
    }

    #[tokio::test]
    async fn connection_lost_maps_to_503() {
        let (engine, transport) = engine(bare_options());
        transport.respond_with(
            Method::Get,
            "/x",
            ScriptedResponse::error(crate::transport::TransportError::ConnectionReset),
        );

        let error = engine.get("/x", RequestOptions::new()).await.unwrap_err();
        assert_eq!(error.status, 503);
        assert_eq!(error.step, Step::Fetch);
        assert!(error.is_connection_lost());
    }
}
