//! Route-to-policy rule resolution.
//!
//! Each policy (dedupe, cache, rate limit, retry) carries an ordered rule
//! list. A rule is a set of path match criteria plus overrides for the
//! policy's defaults. Resolution is first-match-wins and the result is
//! memoized per `"{METHOD}|{path}"` for the engine's lifetime — policy
//! config is immutable after construction, so the memo never invalidates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use regex::Regex;

use crate::error::ConfigError;
use crate::key::KeySerializer;
use crate::method::Method;

/// Upper bound on memoized `method|path` resolutions per policy. Routes past
/// the bound still resolve, they just aren't cached.
const MEMO_CAPACITY: usize = 4096;

/// Path match criteria. All present criteria must match (AND), except `is`,
/// which is exact-match and cannot be combined with the others.
#[derive(Debug, Clone, Default)]
pub struct RuleMatch {
    is: Option<String>,
    starts_with: Option<String>,
    ends_with: Option<String>,
    includes: Option<String>,
    matches: Option<Regex>,
}

impl RuleMatch {
    pub fn is(path: impl Into<String>) -> Self {
        Self { is: Some(path.into()), ..Self::default() }
    }

    pub fn starts_with(prefix: impl Into<String>) -> Self {
        Self { starts_with: Some(prefix.into()), ..Self::default() }
    }

    pub fn with_starts_with(mut self, prefix: impl Into<String>) -> Self {
        self.starts_with = Some(prefix.into());
        self
    }

    pub fn ends_with(suffix: impl Into<String>) -> Self {
        Self { ends_with: Some(suffix.into()), ..Self::default() }
    }

    pub fn with_ends_with(mut self, suffix: impl Into<String>) -> Self {
        self.ends_with = Some(suffix.into());
        self
    }

    pub fn includes(fragment: impl Into<String>) -> Self {
        Self { includes: Some(fragment.into()), ..Self::default() }
    }

    pub fn with_includes(mut self, fragment: impl Into<String>) -> Self {
        self.includes = Some(fragment.into());
        self
    }

    /// Regex criterion. The pattern is compiled at engine construction;
    /// invalid patterns are configuration errors.
    pub fn matches(pattern: &str) -> Result<Self, ConfigError> {
        Ok(Self { matches: Some(Regex::new(pattern)?), ..Self::default() })
    }

    pub fn with_matches(mut self, pattern: &str) -> Result<Self, ConfigError> {
        self.matches = Some(Regex::new(pattern)?);
        Ok(self)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        let others = self.starts_with.is_some()
            || self.ends_with.is_some()
            || self.includes.is_some()
            || self.matches.is_some();

        if self.is.is_some() && others {
            return Err(ConfigError::ExclusiveIsCriteria);
        }
        if self.is.is_none() && !others {
            return Err(ConfigError::RuleWithoutCriteria);
        }
        for criterion in [&self.is, &self.starts_with, &self.ends_with, &self.includes] {
            if matches!(criterion, Some(s) if s.is_empty()) {
                return Err(ConfigError::EmptyMatchCriteria);
            }
        }
        if matches!(&self.matches, Some(re) if re.as_str().is_empty()) {
            return Err(ConfigError::EmptyMatchCriteria);
        }
        Ok(())
    }

    pub(crate) fn matches_path(&self, path: &str) -> bool {
        if let Some(exact) = &self.is {
            return exact == path;
        }
        if let Some(prefix) = &self.starts_with {
            if !path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(suffix) = &self.ends_with {
            if !path.ends_with(suffix.as_str()) {
                return false;
            }
        }
        if let Some(fragment) = &self.includes {
            if !path.contains(fragment.as_str()) {
                return false;
            }
        }
        if let Some(re) = &self.matches {
            if !re.is_match(path) {
                return false;
            }
        }
        true
    }
}

/// One policy rule: match criteria plus overrides of the policy defaults.
#[derive(Debug, Clone)]
pub struct PolicyRule<T> {
    pub matcher: RuleMatch,
    /// Override of the policy's global enabled flag for matching routes.
    pub enabled: Option<bool>,
    /// Override of the policy's default method list.
    pub methods: Option<Vec<Method>>,
    /// Override of the policy's default key serializer.
    pub serializer: Option<KeySerializer>,
    /// Policy-specific knob overrides.
    pub overrides: T,
}

impl<T: Default> PolicyRule<T> {
    pub fn new(matcher: RuleMatch) -> Self {
        Self { matcher, enabled: None, methods: None, serializer: None, overrides: T::default() }
    }
}

impl<T> PolicyRule<T> {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn methods(mut self, methods: Vec<Method>) -> Self {
        self.methods = Some(methods);
        self
    }

    pub fn serializer(mut self, serializer: KeySerializer) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn overrides(mut self, overrides: T) -> Self {
        self.overrides = overrides;
        self
    }
}

/// Effective policy settings for one route, frozen at first resolution.
#[derive(Debug, Clone)]
pub struct ResolvedRule<T> {
    pub serializer: KeySerializer,
    pub overrides: T,
}

/// A policy's defaults plus its ordered rules, with the resolution memo.
#[derive(Debug)]
pub struct RuleSet<T> {
    enabled: bool,
    methods: Vec<Method>,
    serializer: KeySerializer,
    rules: Vec<PolicyRule<T>>,
    memo: Mutex<HashMap<String, Option<Arc<ResolvedRule<T>>>>>,
}

impl<T: Clone + Default> RuleSet<T> {
    pub fn new(
        enabled: bool,
        methods: Vec<Method>,
        serializer: KeySerializer,
        rules: Vec<PolicyRule<T>>,
    ) -> Result<Self, ConfigError> {
        for rule in &rules {
            rule.matcher.validate()?;
        }
        Ok(Self { enabled, methods, serializer, rules, memo: Mutex::new(HashMap::new()) })
    }

    /// Resolve the policy for `(method, path)`. `None` means the policy does
    /// not apply to this route. When no rule matches but the policy is
    /// globally enabled, the defaults apply with `T::default()` overrides.
    pub fn resolve(&self, method: Method, path: &str) -> Option<Arc<ResolvedRule<T>>> {
        let memo_key = format!("{}|{}", method, path);
        if let Some(hit) = self.memo.lock().expect("rule memo poisoned").get(&memo_key) {
            return hit.clone();
        }

        let resolved = self.resolve_uncached(method, path);

        let mut memo = self.memo.lock().expect("rule memo poisoned");
        if memo.len() < MEMO_CAPACITY {
            memo.insert(memo_key, resolved.clone());
        }
        resolved
    }

    fn resolve_uncached(&self, method: Method, path: &str) -> Option<Arc<ResolvedRule<T>>> {
        for rule in &self.rules {
            if !rule.matcher.matches_path(path) {
                continue;
            }
            let methods = rule.methods.as_deref().unwrap_or(&self.methods);
            if !methods.contains(&method) {
                continue;
            }
            // First matching rule settles the route, enabled or not.
            if !rule.enabled.unwrap_or(self.enabled) {
                return None;
            }
            return Some(Arc::new(ResolvedRule {
                serializer: rule.serializer.clone().unwrap_or_else(|| self.serializer.clone()),
                overrides: rule.overrides.clone(),
            }));
        }

        if self.enabled && self.methods.contains(&method) {
            return Some(Arc::new(ResolvedRule {
                serializer: self.serializer.clone(),
                overrides: T::default(),
            }));
        }
        None
    }
}
