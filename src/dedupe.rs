//! Request deduplication.
//!
//! Concurrent identical requests collapse into one in-flight operation: the
//! first becomes the initiator and actually runs the pipeline; later
//! arrivals join the entry and await its settlement. Joiners keep their own
//! timeout and abort, which never affect the initiator or each other; the
//! initiator's outcome — success or failure — is what every joiner sees.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::error::{ConfigError, FetchError};
use crate::key::{BoxError, KeyContext, KeySerializer};
use crate::method::Method;
use crate::response::FetchResponse;
use crate::rules::{PolicyRule, RuleSet};

/// The dedupe policy has no numeric knobs; rules only retarget enablement,
/// methods, and the serializer.
#[derive(Debug, Clone, Default)]
pub struct DedupeOverrides {}

/// Predicate hook: returning `false` opts the request out of deduplication.
pub type ShouldDedupe = Arc<dyn for<'a> Fn(&KeyContext<'a>) -> bool + Send + Sync>;

/// Deduplication policy configuration.
#[derive(Clone)]
pub struct DedupeConfig {
    pub enabled: bool,
    pub methods: Vec<Method>,
    pub serializer: KeySerializer,
    pub rules: Vec<PolicyRule<DedupeOverrides>>,
    pub should_dedupe: Option<ShouldDedupe>,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            methods: vec![Method::Get],
            serializer: KeySerializer::Request,
            rules: Vec::new(),
            should_dedupe: None,
        }
    }
}

impl std::fmt::Debug for DedupeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupeConfig")
            .field("enabled", &self.enabled)
            .field("methods", &self.methods)
            .field("serializer", &self.serializer)
            .field("rules", &self.rules.len())
            .finish()
    }
}

/// Rule resolution for the dedupe policy.
pub struct DedupePolicy {
    rules: RuleSet<DedupeOverrides>,
    should_dedupe: Option<ShouldDedupe>,
}

impl std::fmt::Debug for DedupePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupePolicy")
            .field("rules", &self.rules)
            .field("should_dedupe", &self.should_dedupe.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl DedupePolicy {
    pub fn new(config: DedupeConfig) -> Result<Self, ConfigError> {
        let rules =
            RuleSet::new(config.enabled, config.methods, config.serializer, config.rules)?;
        Ok(Self { rules, should_dedupe: config.should_dedupe })
    }

    /// The dedupe key for this request, or `None` when the policy does not
    /// apply to the route.
    pub fn key_for(&self, ctx: &KeyContext<'_>) -> Result<Option<String>, BoxError> {
        let Some(rule) = self.rules.resolve(ctx.method, ctx.path) else {
            return Ok(None);
        };
        if let Some(should) = &self.should_dedupe {
            if !should(ctx) {
                return Ok(None);
            }
        }
        rule.serializer.serialize(ctx).map(Some)
    }
}

/// How an in-flight operation settles, fanned out to every joiner.
pub type Settlement = Result<FetchResponse, FetchError>;

#[derive(Debug)]
struct Entry {
    tx: broadcast::Sender<Settlement>,
    /// Requests attached to the entry, initiator included.
    waiting: usize,
}

/// Role assigned to a request entering the registry.
pub enum Entrant {
    /// First arrival: runs the pipeline and must settle the entry.
    Initiator,
    /// Later arrival: awaits the broadcast settlement.
    Joiner {
        rx: broadcast::Receiver<Settlement>,
        /// Attached count after this join, initiator included.
        waiting_count: usize,
    },
}

/// The per-engine map of in-flight operations.
#[derive(Debug, Default)]
pub struct InflightRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InflightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join an existing entry or start a new one.
    pub fn join_or_start(&self, key: &str) -> Entrant {
        let mut entries = self.entries.lock().expect("inflight registry poisoned");
        match entries.get_mut(key) {
            Some(entry) => {
                entry.waiting += 1;
                Entrant::Joiner { rx: entry.tx.subscribe(), waiting_count: entry.waiting }
            }
            None => {
                let (tx, _rx) = broadcast::channel(1);
                entries.insert(key.to_string(), Entry { tx, waiting: 1 });
                Entrant::Initiator
            }
        }
    }

    /// Settle the entry: removed from the map and every joiner notified, as
    /// one atomic step. Returns how many requests were attached.
    pub fn settle(&self, key: &str, result: Settlement) -> usize {
        let entry = {
            let mut entries = self.entries.lock().expect("inflight registry poisoned");
            entries.remove(key)
        };
        match entry {
            Some(entry) => {
                // Send fails only when no joiner is subscribed, which is fine.
                let _ = entry.tx.send(result);
                entry.waiting
            }
            None => 0,
        }
    }

    /// A joiner left early (timeout or abort). The entry survives for the
    /// initiator and remaining joiners.
    pub fn leave(&self, key: &str) {
        let mut entries = self.entries.lock().expect("inflight registry poisoned");
        if let Some(entry) = entries.get_mut(key) {
            entry.waiting = entry.waiting.saturating_sub(1);
        }
    }

    /// In-flight entry count; zero once the engine is quiescent.
    pub fn in_flight_count(&self) -> usize {
        self.entries.lock().expect("inflight registry poisoned").len()
    }

    /// Attached count for one key (initiator included), for observability.
    pub fn waiting_count(&self, key: &str) -> usize {
        self.entries
            .lock()
            .expect("inflight registry poisoned")
            .get(key)
            .map(|e| e.waiting)
            .unwrap_or(0)
    }

    /// Drop all entries (engine destroy). In-flight initiators are aborted
    /// separately through the engine root token.
    pub fn clear(&self) {
        self.entries.lock().expect("inflight registry poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Step;
    use crate::method::Method;
    use crate::parse::Body;
    use crate::response::RequestRecord;
    use serde_json::{json, Value};

    fn response(n: u64) -> FetchResponse {
        FetchResponse {
            data: Body::Json(json!({ "n": n })),
            status: 200,
            headers: Default::default(),
            request: RequestRecord {
                method: Method::Get,
                path: "/x".to_string(),
                url: "https://api.test/x".to_string(),
                headers: Default::default(),
                payload: Value::Null,
            },
            attempt: 1,
            from_cache: false,
        }
    }

    #[test]
    fn first_arrival_is_initiator() {
        let registry = InflightRegistry::new();
        assert!(matches!(registry.join_or_start("k"), Entrant::Initiator));
        assert_eq!(registry.in_flight_count(), 1);
    }

    #[tokio::test]
    async fn joiners_receive_the_initiator_settlement() {
        let registry = InflightRegistry::new();
        assert!(matches!(registry.join_or_start("k"), Entrant::Initiator));

        let Entrant::Joiner { mut rx, waiting_count } = registry.join_or_start("k") else {
            panic!("expected joiner");
        };
        assert_eq!(waiting_count, 2);

        let notified = registry.settle("k", Ok(response(1)));
        assert_eq!(notified, 2);
        assert_eq!(registry.in_flight_count(), 0);

        let settlement = rx.recv().await.unwrap();
        assert_eq!(settlement.unwrap().status, 200);
    }

    #[tokio::test]
    async fn error_settlement_reaches_joiners() {
        let registry = InflightRegistry::new();
        let _ = registry.join_or_start("k");
        let Entrant::Joiner { mut rx, .. } = registry.join_or_start("k") else {
            panic!("expected joiner");
        };

        let error =
            FetchError::new(Method::Get, "/x", "https://api.test/x", 503, Step::Fetch);
        registry.settle("k", Err(error));
        let settlement = rx.recv().await.unwrap();
        assert_eq!(settlement.unwrap_err().status, 503);
    }

    #[test]
    fn sequential_batches_get_fresh_entries() {
        let registry = InflightRegistry::new();
        assert!(matches!(registry.join_or_start("k"), Entrant::Initiator));
        registry.settle("k", Ok(response(1)));

        // Entry removed: the next request is a fresh initiator, not a joiner.
        assert!(matches!(registry.join_or_start("k"), Entrant::Initiator));
        registry.settle("k", Ok(response(2)));
        assert_eq!(registry.in_flight_count(), 0);
    }

    #[test]
    fn leave_decrements_but_keeps_entry() {
        let registry = InflightRegistry::new();
        let _ = registry.join_or_start("k");
        let _ = registry.join_or_start("k");
        let _ = registry.join_or_start("k");
        assert_eq!(registry.waiting_count("k"), 3);

        registry.leave("k");
        assert_eq!(registry.waiting_count("k"), 2);
        assert_eq!(registry.in_flight_count(), 1);

        // Count never goes negative, even on spurious leaves.
        registry.leave("k");
        registry.leave("k");
        registry.leave("k");
        assert_eq!(registry.waiting_count("k"), 0);
    }

    #[test]
    fn settle_unknown_key_is_a_no_op() {
        let registry = InflightRegistry::new();
        assert_eq!(registry.settle("missing", Ok(response(1))), 0);
    }

    #[test]
    fn policy_resolves_keys_for_configured_methods_only() {
        let policy = DedupePolicy::new(DedupeConfig::default()).unwrap();
        let url = url::Url::parse("https://api.test/a").unwrap();
        let headers = Default::default();

        let get = KeyContext {
            method: Method::Get,
            path: "/a",
            url: &url,
            payload: &Value::Null,
            headers: &headers,
        };
        assert_eq!(policy.key_for(&get).unwrap().unwrap(), "GET|/a");

        let post = KeyContext { method: Method::Post, ..get };
        assert!(policy.key_for(&post).unwrap().is_none());
    }

    #[test]
    fn should_dedupe_predicate_opts_out() {
        let config = DedupeConfig {
            should_dedupe: Some(Arc::new(|ctx: &KeyContext| !ctx.path.starts_with("/live"))),
            ..DedupeConfig::default()
        };
        let policy = DedupePolicy::new(config).unwrap();
        let url = url::Url::parse("https://api.test/live/feed").unwrap();
        let headers = Default::default();
        let ctx = KeyContext {
            method: Method::Get,
            path: "/live/feed",
            url: &url,
            payload: &Value::Null,
            headers: &headers,
        };
        assert!(policy.key_for(&ctx).unwrap().is_none());
    }
}
