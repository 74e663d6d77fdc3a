//! Default / per-method / per-request property merging.
//!
//! Headers and query params resolve through three layers: engine defaults,
//! the method's table, then the individual request, later layers winning.
//! Header keys are normalized after the merge according to the engine's
//! [`HeaderFormat`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::method::Method;

/// Header key normalization applied to the merged header set.
#[derive(Clone, Default)]
pub enum HeaderFormat {
    /// Keys pass through as given.
    Off,
    #[default]
    Lowercase,
    Uppercase,
    Custom(Arc<dyn Fn(&str) -> String + Send + Sync>),
}

impl HeaderFormat {
    pub fn apply(&self, key: &str) -> String {
        match self {
            HeaderFormat::Off => key.to_string(),
            HeaderFormat::Lowercase => key.to_ascii_lowercase(),
            HeaderFormat::Uppercase => key.to_ascii_uppercase(),
            HeaderFormat::Custom(f) => f(key),
        }
    }
}

impl std::fmt::Debug for HeaderFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderFormat::Off => f.write_str("HeaderFormat::Off"),
            HeaderFormat::Lowercase => f.write_str("HeaderFormat::Lowercase"),
            HeaderFormat::Uppercase => f.write_str("HeaderFormat::Uppercase"),
            HeaderFormat::Custom(_) => f.write_str("HeaderFormat::Custom(..)"),
        }
    }
}

/// One property family (headers or params): defaults plus per-method tables.
#[derive(Debug, Default)]
pub struct PropertyStore {
    defaults: Mutex<BTreeMap<String, String>>,
    per_method: Mutex<HashMap<Method, BTreeMap<String, String>>>,
}

impl PropertyStore {
    pub fn new(
        defaults: BTreeMap<String, String>,
        per_method: HashMap<Method, BTreeMap<String, String>>,
    ) -> Self {
        Self { defaults: Mutex::new(defaults), per_method: Mutex::new(per_method) }
    }

    pub fn set(&self, name: &str, value: &str, scope: Option<Method>) {
        match scope {
            None => {
                self.defaults
                    .lock()
                    .expect("property store poisoned")
                    .insert(name.to_string(), value.to_string());
            }
            Some(method) => {
                self.per_method
                    .lock()
                    .expect("property store poisoned")
                    .entry(method)
                    .or_default()
                    .insert(name.to_string(), value.to_string());
            }
        }
    }

    /// Remove a property; returns whether anything was removed.
    pub fn remove(&self, name: &str, scope: Option<Method>) -> bool {
        match scope {
            None => self
                .defaults
                .lock()
                .expect("property store poisoned")
                .remove(name)
                .is_some(),
            Some(method) => self
                .per_method
                .lock()
                .expect("property store poisoned")
                .get_mut(&method)
                .map(|table| table.remove(name).is_some())
                .unwrap_or(false),
        }
    }

    pub fn get(&self, name: &str, scope: Option<Method>) -> Option<String> {
        match scope {
            None => self.defaults.lock().expect("property store poisoned").get(name).cloned(),
            Some(method) => self
                .per_method
                .lock()
                .expect("property store poisoned")
                .get(&method)
                .and_then(|table| table.get(name).cloned()),
        }
    }

    /// Merge defaults ← method table ← request values.
    pub fn resolve(
        &self,
        method: Method,
        request: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut merged = self.defaults.lock().expect("property store poisoned").clone();
        if let Some(table) =
            self.per_method.lock().expect("property store poisoned").get(&method)
        {
            for (k, v) in table {
                merged.insert(k.clone(), v.clone());
            }
        }
        for (k, v) in request {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }

    /// Merge and then normalize keys.
    pub fn resolve_formatted(
        &self,
        method: Method,
        request: &BTreeMap<String, String>,
        format: &HeaderFormat,
    ) -> BTreeMap<String, String> {
        self.resolve(method, request)
            .into_iter()
            .map(|(k, v)| (format.apply(&k), v))
            .collect()
    }
}
