//! Response caching with a freshness window.
//!
//! Entries move through three states by clock time: fresh (served without a
//! fetch), stale (served while a background revalidation races a timer), and
//! expired (treated as absent). Storage sits behind the [`CacheAdapter`]
//! trait so callers can plug in their own store; the default is a bounded
//! in-memory map.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::Clock;
use crate::error::ConfigError;
use crate::key::{BoxError, KeyContext, KeySerializer};
use crate::method::Method;
use crate::parse::{Body, ParseKind};
use crate::rules::{PolicyRule, RuleSet};

/// A cached, parsed response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Body,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub content_type: Option<String>,
    pub parse_kind: ParseKind,
    /// Clock millis when the entry was stored.
    pub stored_at: u64,
    /// Clock millis at which the entry turns stale. Equal to `expires_at`
    /// when the policy has no stale window.
    pub stale_at: u64,
    /// Clock millis past which the entry is treated as absent.
    pub expires_at: u64,
    /// Single-flight lock: set while a background revalidation is running.
    pub revalidating: bool,
}

/// Where an entry sits in its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// Stale but usable; serving it should trigger revalidation.
    Stale,
    Expired,
}

impl CacheEntry {
    pub fn freshness(&self, now: u64) -> Freshness {
        if now >= self.expires_at {
            Freshness::Expired
        } else if now >= self.stale_at {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }
}

/// Pluggable cache storage. All methods are async so adapters may sit on
/// I/O; a shared adapter must tolerate interleaved calls from multiple
/// engines.
#[async_trait]
pub trait CacheAdapter: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Option<CacheEntry>;
    async fn set(&self, key: &str, entry: CacheEntry);
    async fn delete(&self, key: &str) -> bool;
    async fn has(&self, key: &str) -> bool;
    async fn clear(&self);
    async fn len(&self) -> usize;
}

/// Bounded in-memory adapter. At capacity, expired entries are dropped
/// first, then the oldest stored entry.
#[derive(Debug)]
pub struct MemoryAdapter {
    max_entries: usize,
    entries: Mutex<HashMap<String, CacheEntry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryAdapter {
    pub const DEFAULT_CAPACITY: usize = 512;

    pub fn new(max_entries: usize, clock: Arc<dyn Clock>) -> Self {
        Self { max_entries: max_entries.max(1), entries: Mutex::new(HashMap::new()), clock }
    }

    fn evict_one(entries: &mut HashMap<String, CacheEntry>, now: u64) {
        if let Some(expired) = entries
            .iter()
            .find(|(_, e)| e.freshness(now) == Freshness::Expired)
            .map(|(k, _)| k.clone())
        {
            entries.remove(&expired);
            return;
        }
        if let Some(oldest) =
            entries.iter().min_by_key(|(_, e)| e.stored_at).map(|(k, _)| k.clone())
        {
            entries.remove(&oldest);
        }
    }
}

#[async_trait]
impl CacheAdapter for MemoryAdapter {
    async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.lock().expect("cache poisoned").get(key).cloned()
    }

    async fn set(&self, key: &str, entry: CacheEntry) {
        let mut entries = self.entries.lock().expect("cache poisoned");
        if !entries.contains_key(key) && entries.len() >= self.max_entries {
            Self::evict_one(&mut entries, self.clock.now_millis());
        }
        entries.insert(key.to_string(), entry);
    }

    async fn delete(&self, key: &str) -> bool {
        self.entries.lock().expect("cache poisoned").remove(key).is_some()
    }

    async fn has(&self, key: &str) -> bool {
        self.entries.lock().expect("cache poisoned").contains_key(key)
    }

    async fn clear(&self) {
        self.entries.lock().expect("cache poisoned").clear();
    }

    async fn len(&self) -> usize {
        self.entries.lock().expect("cache poisoned").len()
    }
}

/// Per-rule overrides for the cache policy.
#[derive(Debug, Clone, Default)]
pub struct CacheOverrides {
    pub ttl: Option<Duration>,
    pub stale_in: Option<Duration>,
    pub stale_timeout: Option<Duration>,
}

/// Cache policy configuration.
#[derive(Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub methods: Vec<Method>,
    /// Entry lifetime.
    pub ttl: Duration,
    /// Age past which an entry is stale-but-usable. Unset means entries are
    /// fresh for their whole lifetime.
    pub stale_in: Option<Duration>,
    /// How long a caller waits for revalidation before taking the stale
    /// value. Unset or zero returns stale immediately.
    pub stale_timeout: Option<Duration>,
    pub serializer: KeySerializer,
    pub rules: Vec<PolicyRule<CacheOverrides>>,
    /// Storage; defaults to a bounded [`MemoryAdapter`].
    pub adapter: Option<Arc<dyn CacheAdapter>>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            methods: vec![Method::Get],
            ttl: Duration::from_secs(60),
            stale_in: None,
            stale_timeout: None,
            serializer: KeySerializer::Request,
            rules: Vec::new(),
            adapter: None,
        }
    }
}

impl std::fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheConfig")
            .field("enabled", &self.enabled)
            .field("methods", &self.methods)
            .field("ttl", &self.ttl)
            .field("stale_in", &self.stale_in)
            .field("stale_timeout", &self.stale_timeout)
            .field("rules", &self.rules.len())
            .finish()
    }
}

/// Effective cache settings for one request.
#[derive(Debug, Clone)]
pub struct CacheDecision {
    pub key: String,
    pub ttl: Duration,
    pub stale_in: Option<Duration>,
    pub stale_timeout: Option<Duration>,
}

/// Rule resolution plus storage for the cache policy.
pub struct CachePolicy {
    rules: RuleSet<CacheOverrides>,
    ttl: Duration,
    stale_in: Option<Duration>,
    stale_timeout: Option<Duration>,
    adapter: Arc<dyn CacheAdapter>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePolicy")
            .field("ttl", &self.ttl)
            .field("stale_in", &self.stale_in)
            .field("stale_timeout", &self.stale_timeout)
            .finish()
    }
}

fn check_stale_window(stale_in: Option<Duration>, ttl: Duration) -> Result<(), ConfigError> {
    if ttl.is_zero() {
        return Err(ConfigError::ZeroDuration { what: "cache ttl" });
    }
    if let Some(stale_in) = stale_in {
        if stale_in >= ttl {
            return Err(ConfigError::StaleExceedsTtl {
                stale_in_ms: stale_in.as_millis() as u64,
                ttl_ms: ttl.as_millis() as u64,
            });
        }
    }
    Ok(())
}

impl CachePolicy {
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        check_stale_window(config.stale_in, config.ttl)?;
        for rule in &config.rules {
            check_stale_window(
                rule.overrides.stale_in.or(config.stale_in),
                rule.overrides.ttl.unwrap_or(config.ttl),
            )?;
        }

        let adapter = config.adapter.clone().unwrap_or_else(|| {
            Arc::new(MemoryAdapter::new(MemoryAdapter::DEFAULT_CAPACITY, clock.clone()))
        });
        let rules =
            RuleSet::new(config.enabled, config.methods, config.serializer, config.rules)?;
        Ok(Self {
            rules,
            ttl: config.ttl,
            stale_in: config.stale_in,
            stale_timeout: config.stale_timeout,
            adapter,
            clock,
        })
    }

    pub fn adapter(&self) -> &Arc<dyn CacheAdapter> {
        &self.adapter
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// The cache decision for this request, or `None` when the route or
    /// method is not cacheable.
    pub fn decide(&self, ctx: &KeyContext<'_>) -> Result<Option<CacheDecision>, BoxError> {
        let Some(rule) = self.rules.resolve(ctx.method, ctx.path) else {
            return Ok(None);
        };
        let key = rule.serializer.serialize(ctx)?;
        Ok(Some(CacheDecision {
            key,
            ttl: rule.overrides.ttl.unwrap_or(self.ttl),
            stale_in: rule.overrides.stale_in.or(self.stale_in),
            stale_timeout: rule.overrides.stale_timeout.or(self.stale_timeout),
        }))
    }

    /// Build a storable entry from a parsed response.
    pub fn build_entry(
        &self,
        decision: &CacheDecision,
        value: Body,
        status: u16,
        headers: BTreeMap<String, String>,
        content_type: Option<String>,
    ) -> CacheEntry {
        let stored_at = self.clock.now_millis();
        let expires_at = stored_at + decision.ttl.as_millis() as u64;
        let stale_at = decision
            .stale_in
            .map(|s| stored_at + s.as_millis() as u64)
            .unwrap_or(expires_at);
        let parse_kind = value.kind();
        CacheEntry {
            value,
            status,
            headers,
            content_type,
            parse_kind,
            stored_at,
            stale_at,
            expires_at,
            revalidating: false,
        }
    }

    /// Flip the entry's revalidation lock. Returns `false` when the entry is
    /// gone or (when locking) already locked — the caller lost the race.
    pub async fn set_revalidating(&self, key: &str, revalidating: bool) -> bool {
        let Some(mut entry) = self.adapter.get(key).await else {
            return false;
        };
        if revalidating && entry.revalidating {
            return false;
        }
        entry.revalidating = revalidating;
        self.adapter.set(key, entry).await;
        true
    }
}
