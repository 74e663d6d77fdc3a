//! Engine observability events.
//!
//! Every policy decision and lifecycle transition is published on the
//! engine's [`EventBus`] as a [`FetchEvent`]. Listeners subscribe by exact
//! name, by regex over names, or to everything; each subscription returns a
//! [`Subscription`] disposer. Emission is synchronous and best-effort —
//! a listener cannot fail a request.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use regex::Regex;
use serde_json::Value;

use crate::error::FetchError;
use crate::method::Method;
use crate::parse::Body;

/// Payload for `fetch-before`: the request about to go over the wire.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub method: Method,
    pub path: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub payload: Value,
    /// 1-based attempt this event belongs to.
    pub attempt: u32,
    pub state: Value,
}

/// Payload for `fetch-after`: the undecoded response, before parsing.
#[derive(Debug, Clone)]
pub struct RawResponseEvent {
    pub method: Method,
    pub path: String,
    pub url: String,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub attempt: u32,
    pub state: Value,
}

/// Payload for `fetch-response`.
#[derive(Debug, Clone)]
pub struct ResponseEvent {
    pub method: Method,
    pub path: String,
    pub url: String,
    pub status: u16,
    pub data: Body,
    pub attempt: u32,
    pub state: Value,
}

/// Payload for `fetch-error` and `fetch-abort`.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub error: FetchError,
    pub state: Value,
}

/// Payload for `fetch-retry`.
#[derive(Debug, Clone)]
pub struct RetryEvent {
    /// The attempt that just failed (1-based).
    pub attempt: u32,
    pub next_attempt: u32,
    pub delay: Duration,
    pub error: FetchError,
    pub state: Value,
}

/// Payload for the `fetch-dedupe-*` family.
#[derive(Debug, Clone)]
pub struct DedupeEvent {
    pub key: String,
    pub method: Method,
    pub path: String,
    /// Requests currently attached to the entry, initiator included.
    pub waiting_count: usize,
    pub error: Option<FetchError>,
    pub state: Value,
}

/// Payload for the `fetch-cache-*` family.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    pub key: String,
    pub method: Method,
    pub path: String,
    pub error: Option<FetchError>,
    pub state: Value,
}

/// Payload for the `fetch-ratelimit-*` family.
#[derive(Debug, Clone)]
pub struct RateLimitEvent {
    pub key: String,
    pub current_tokens: f64,
    pub capacity: f64,
    pub wait_ms: u64,
    /// Clock millis at which a token will next be available.
    pub next_available_ms: u64,
    pub state: Value,
}

/// Payload for engine property mutations (headers/params).
#[derive(Debug, Clone)]
pub struct PropertyEvent {
    pub name: String,
    pub value: Option<String>,
    /// `None` for engine defaults, `Some(method)` for a per-method table.
    pub scope: Option<Method>,
    pub state: Value,
}

/// Payload for `fetch-state-set` / `fetch-state-reset`.
#[derive(Debug, Clone)]
pub struct StateEvent {
    pub state: Value,
}

/// Payload for `fetch-url-change`.
#[derive(Debug, Clone)]
pub struct UrlChangeEvent {
    pub from: String,
    pub to: String,
    pub state: Value,
}

/// All events the engine emits.
#[derive(Debug, Clone)]
pub enum FetchEvent {
    Before(RequestEvent),
    After(RawResponseEvent),
    Response(ResponseEvent),
    Error(ErrorEvent),
    Abort(ErrorEvent),
    Retry(RetryEvent),
    DedupeStart(DedupeEvent),
    DedupeJoin(DedupeEvent),
    DedupeComplete(DedupeEvent),
    DedupeError(DedupeEvent),
    CacheHit(CacheEvent),
    CacheMiss(CacheEvent),
    CacheStale(CacheEvent),
    CacheSet(CacheEvent),
    CacheRevalidate(CacheEvent),
    CacheRevalidateError(CacheEvent),
    RateLimitAcquire(RateLimitEvent),
    RateLimitWait(RateLimitEvent),
    RateLimitReject(RateLimitEvent),
    HeaderAdd(PropertyEvent),
    HeaderRemove(PropertyEvent),
    ParamAdd(PropertyEvent),
    ParamRemove(PropertyEvent),
    StateSet(StateEvent),
    StateReset(StateEvent),
    UrlChange(UrlChangeEvent),
    ModifyOptionsChange(StateEvent),
    ModifyMethodOptionsChange(PropertyEvent),
}

impl FetchEvent {
    /// Stable event name, the subscription key for named listeners.
    pub fn name(&self) -> &'static str {
        match self {
            FetchEvent::Before(_) => "fetch-before",
            FetchEvent::After(_) => "fetch-after",
            FetchEvent::Response(_) => "fetch-response",
            FetchEvent::Error(_) => "fetch-error",
            FetchEvent::Abort(_) => "fetch-abort",
            FetchEvent::Retry(_) => "fetch-retry",
            FetchEvent::DedupeStart(_) => "fetch-dedupe-start",
            FetchEvent::DedupeJoin(_) => "fetch-dedupe-join",
            FetchEvent::DedupeComplete(_) => "fetch-dedupe-complete",
            FetchEvent::DedupeError(_) => "fetch-dedupe-error",
            FetchEvent::CacheHit(_) => "fetch-cache-hit",
            FetchEvent::CacheMiss(_) => "fetch-cache-miss",
            FetchEvent::CacheStale(_) => "fetch-cache-stale",
            FetchEvent::CacheSet(_) => "fetch-cache-set",
            FetchEvent::CacheRevalidate(_) => "fetch-cache-revalidate",
            FetchEvent::CacheRevalidateError(_) => "fetch-cache-revalidate-error",
            FetchEvent::RateLimitAcquire(_) => "fetch-ratelimit-acquire",
            FetchEvent::RateLimitWait(_) => "fetch-ratelimit-wait",
            FetchEvent::RateLimitReject(_) => "fetch-ratelimit-reject",
            FetchEvent::HeaderAdd(_) => "fetch-header-add",
            FetchEvent::HeaderRemove(_) => "fetch-header-remove",
            FetchEvent::ParamAdd(_) => "fetch-param-add",
            FetchEvent::ParamRemove(_) => "fetch-param-remove",
            FetchEvent::StateSet(_) => "fetch-state-set",
            FetchEvent::StateReset(_) => "fetch-state-reset",
            FetchEvent::UrlChange(_) => "fetch-url-change",
            FetchEvent::ModifyOptionsChange(_) => "fetch-modify-options-change",
            FetchEvent::ModifyMethodOptionsChange(_) => "fetch-modify-method-options-change",
        }
    }
}

impl std::fmt::Display for FetchEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

type Listener = Arc<dyn Fn(&FetchEvent) + Send + Sync>;

enum NameMatcher {
    Exact(String),
    Pattern(Regex),
    Any,
}

impl NameMatcher {
    fn matches(&self, name: &str) -> bool {
        match self {
            NameMatcher::Exact(expected) => expected == name,
            NameMatcher::Pattern(re) => re.is_match(name),
            NameMatcher::Any => true,
        }
    }
}

struct Entry {
    id: u64,
    matcher: NameMatcher,
    listener: Listener,
    once: bool,
}

/// Disposer for one subscription. Dropping it does *not* unsubscribe; call
/// [`Subscription::cancel`] to remove the listener.
pub struct Subscription {
    id: u64,
    entries: Weak<Mutex<Vec<Entry>>>,
}

impl Subscription {
    pub fn cancel(self) {
        if let Some(entries) = self.entries.upgrade() {
            entries.lock().expect("event bus poisoned").retain(|e| e.id != self.id);
        }
    }
}

/// Synchronous fan-out bus for [`FetchEvent`]s.
#[derive(Default)]
pub struct EventBus {
    entries: Arc<Mutex<Vec<Entry>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscribe(&self, matcher: NameMatcher, listener: Listener, once: bool) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .expect("event bus poisoned")
            .push(Entry { id, matcher, listener, once });
        Subscription { id, entries: Arc::downgrade(&self.entries) }
    }

    /// Listen for one event name (e.g. `"fetch-retry"`).
    pub fn on<F>(&self, name: &str, listener: F) -> Subscription
    where
        F: Fn(&FetchEvent) + Send + Sync + 'static,
    {
        self.subscribe(NameMatcher::Exact(name.to_string()), Arc::new(listener), false)
    }

    /// Listen for one event name, removing the listener after the first hit.
    pub fn once<F>(&self, name: &str, listener: F) -> Subscription
    where
        F: Fn(&FetchEvent) + Send + Sync + 'static,
    {
        self.subscribe(NameMatcher::Exact(name.to_string()), Arc::new(listener), true)
    }

    /// Listen for every event whose name matches `pattern`.
    pub fn on_pattern<F>(&self, pattern: Regex, listener: F) -> Subscription
    where
        F: Fn(&FetchEvent) + Send + Sync + 'static,
    {
        self.subscribe(NameMatcher::Pattern(pattern), Arc::new(listener), false)
    }

    /// Listen for every event.
    pub fn on_any<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&FetchEvent) + Send + Sync + 'static,
    {
        self.subscribe(NameMatcher::Any, Arc::new(listener), false)
    }

    /// Fan the event out to matching listeners. Once-listeners fire at most
    /// one time. Listeners run outside the bus lock so they may re-subscribe.
    pub fn emit(&self, event: &FetchEvent) {
        let name = event.name();
        let matched: Vec<Listener> = {
            let mut entries = self.entries.lock().expect("event bus poisoned");
            let matched: Vec<Listener> = entries
                .iter()
                .filter(|e| e.matcher.matches(name))
                .map(|e| e.listener.clone())
                .collect();
            entries.retain(|e| !(e.once && e.matcher.matches(name)));
            matched
        };
        for listener in matched {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.entries.lock().expect("event bus poisoned").len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").field("listeners", &self.listener_count()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_event() -> FetchEvent {
        FetchEvent::StateReset(StateEvent { state: Value::Null })
    }

    fn retry_event() -> FetchEvent {
        FetchEvent::Retry(RetryEvent {
            attempt: 1,
            next_attempt: 2,
            delay: Duration::from_millis(100),
            error: FetchError::new(
                Method::Get,
                "/x",
                "https://api.test/x",
                503,
                crate::error::Step::Fetch,
            ),
            state: Value::Null,
        })
    }

    fn counter() -> (Arc<AtomicU64>, impl Fn(&FetchEvent) + Send + Sync + 'static) {
        let count = Arc::new(AtomicU64::new(0));
        let inner = count.clone();
        (count, move |_: &FetchEvent| {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn named_listener_only_sees_its_event() {
        let bus = EventBus::new();
        let (count, listener) = counter();
        let _sub = bus.on("fetch-retry", listener);

        bus.emit(&retry_event());
        bus.emit(&state_event());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pattern_listener_matches_families() {
        let bus = EventBus::new();
        let (count, listener) = counter();
        let _sub = bus.on_pattern(Regex::new(r"^fetch-state-").unwrap(), listener);

        bus.emit(&state_event());
        bus.emit(&FetchEvent::StateSet(StateEvent { state: Value::Null }));
        bus.emit(&retry_event());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn wildcard_listener_sees_everything() {
        let bus = EventBus::new();
        let (count, listener) = counter();
        let _sub = bus.on_any(listener);

        bus.emit(&retry_event());
        bus.emit(&state_event());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn once_listener_fires_a_single_time() {
        let bus = EventBus::new();
        let (count, listener) = counter();
        let _sub = bus.once("fetch-retry", listener);

        bus.emit(&retry_event());
        bus.emit(&retry_event());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn cancel_removes_the_listener() {
        let bus = EventBus::new();
        let (count, listener) = counter();
        let sub = bus.on("fetch-retry", listener);

        bus.emit(&retry_event());
        sub.cancel();
        bus.emit(&retry_event());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_the_subscription_keeps_the_listener() {
        let bus = EventBus::new();
        let (count, listener) = counter();
        drop(bus.on("fetch-retry", listener));

        bus.emit(&retry_event());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_may_resubscribe_during_emit() {
        let bus = Arc::new(EventBus::new());
        let bus2 = bus.clone();
        let (count, listener) = counter();
        let _sub = bus.once("fetch-retry", move |_| {
            let _resub = bus2.on("fetch-retry", |_| {});
        });
        let _sub2 = bus.on("fetch-retry", listener);

        bus.emit(&retry_event());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(), 2);
    }
}
