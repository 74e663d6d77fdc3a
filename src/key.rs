//! Identity key serializers.
//!
//! Every policy resolves requests to a stable identity string: rate limiting
//! and retry use the endpoint key (method + pathname), deduplication and
//! caching use the request key (method + path/query + payload + the stable
//! subset of headers). Serializers must be deterministic; two requests that
//! serialize to the same key are the same request as far as a policy is
//! concerned.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use url::Url;

use crate::method::Method;

/// Boxed error for fallible custom serializers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Header names that participate in the request identity key. Everything
/// else (request ids, trace ids, dates) is dynamic noise that would defeat
/// deduplication and caching.
pub const STABLE_KEY_HEADERS: [&str; 5] =
    ["accept", "accept-encoding", "accept-language", "authorization", "content-type"];

/// The inputs a serializer may derive identity from.
#[derive(Debug, Clone, Copy)]
pub struct KeyContext<'a> {
    pub method: Method,
    pub path: &'a str,
    pub url: &'a Url,
    /// Request payload; `Value::Null` means no payload.
    pub payload: &'a Value,
    pub headers: &'a BTreeMap<String, String>,
}

/// A policy's key serializer: one of the two standard ones, or user-supplied.
#[derive(Clone)]
pub enum KeySerializer {
    /// `"{METHOD}|{pathname}"` — endpoint identity.
    Endpoint,
    /// `"{METHOD}|{pathname?query}|{payload}|{stable-headers}"` — request identity.
    Request,
    Custom(Arc<dyn for<'a> Fn(&KeyContext<'a>) -> Result<String, BoxError> + Send + Sync>),
}

impl std::fmt::Debug for KeySerializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySerializer::Endpoint => f.write_str("KeySerializer::Endpoint"),
            KeySerializer::Request => f.write_str("KeySerializer::Request"),
            KeySerializer::Custom(_) => f.write_str("KeySerializer::Custom(..)"),
        }
    }
}

impl KeySerializer {
    pub fn custom<F>(f: F) -> Self
    where
        F: for<'a> Fn(&KeyContext<'a>) -> Result<String, BoxError> + Send + Sync + 'static,
    {
        KeySerializer::Custom(Arc::new(f))
    }

    pub fn serialize(&self, ctx: &KeyContext<'_>) -> Result<String, BoxError> {
        match self {
            KeySerializer::Endpoint => Ok(endpoint_key(ctx)),
            KeySerializer::Request => Ok(request_key(ctx)),
            KeySerializer::Custom(f) => f(ctx),
        }
    }
}

/// `"{METHOD}|{pathname}"`. A pure function of method and pathname: query,
/// fragment, payload, and headers never influence it.
pub fn endpoint_key(ctx: &KeyContext<'_>) -> String {
    format!("{}|{}", ctx.method, ctx.url.path())
}

/// Request identity: method, pathname + query, stable payload JSON, and the
/// filtered header set. Trailing parts are omitted when empty, so a bare GET
/// serializes to just `"GET|/path"`.
pub fn request_key(ctx: &KeyContext<'_>) -> String {
    let mut parts = vec![ctx.method.to_string(), path_and_query(ctx.url)];

    let has_headers = ctx.headers.keys().any(|k| is_stable_header(k));
    if !ctx.payload.is_null() {
        parts.push(stable_json(ctx.payload));
    } else if has_headers {
        // Hold the payload slot so header-only and payload-only keys differ.
        parts.push(String::new());
    }

    if has_headers {
        let filtered: BTreeMap<String, &str> = ctx
            .headers
            .iter()
            .filter(|(k, _)| is_stable_header(k))
            .map(|(k, v)| (k.to_ascii_lowercase(), v.as_str()))
            .collect();
        let rendered: Vec<String> =
            filtered.iter().map(|(k, v)| format!("{}:{}", k, v)).collect();
        parts.push(rendered.join(","));
    }

    parts.join("|")
}

fn is_stable_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    STABLE_KEY_HEADERS.contains(&lower.as_str())
}

fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(q) if !q.is_empty() => format!("{}?{}", url.path(), q),
        _ => url.path().to_string(),
    }
}

/// JSON serialization with recursively sorted object keys, so key identity
/// never depends on payload construction order.
pub fn stable_json(value: &Value) -> String {
    fn canonical(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<&String, Value> =
                    map.iter().map(|(k, v)| (k, canonical(v))).collect();
                Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
            }
            Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
            other => other.clone(),
        }
    }
    canonical(value).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx<'a>(
        method: Method,
        url: &'a Url,
        payload: &'a Value,
        headers: &'a BTreeMap<String, String>,
    ) -> KeyContext<'a> {
        KeyContext { method, path: url.path(), url, payload, headers }
    }

    fn no_headers() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    fn endpoint_key_ignores_query_and_fragment() {
        let a = Url::parse("https://api.test/users?page=2#frag").unwrap();
        let b = Url::parse("https://api.test/users").unwrap();
        let headers = no_headers();
        assert_eq!(
            endpoint_key(&ctx(Method::Get, &a, &Value::Null, &headers)),
            endpoint_key(&ctx(Method::Get, &b, &Value::Null, &headers)),
        );
        assert_eq!(endpoint_key(&ctx(Method::Get, &b, &Value::Null, &headers)), "GET|/users");
    }

    #[test]
    fn endpoint_key_distinguishes_trailing_slash() {
        let a = Url::parse("https://api.test/users").unwrap();
        let b = Url::parse("https://api.test/users/").unwrap();
        let headers = no_headers();
        assert_ne!(
            endpoint_key(&ctx(Method::Get, &a, &Value::Null, &headers)),
            endpoint_key(&ctx(Method::Get, &b, &Value::Null, &headers)),
        );
    }

    #[test]
    fn request_key_bare_get_is_method_and_path() {
        let url = Url::parse("https://api.test/users").unwrap();
        let headers = no_headers();
        assert_eq!(request_key(&ctx(Method::Get, &url, &Value::Null, &headers)), "GET|/users");
    }

    #[test]
    fn request_key_includes_query_but_not_fragment() {
        let with = Url::parse("https://api.test/users?page=2#top").unwrap();
        let without = Url::parse("https://api.test/users?page=2").unwrap();
        let headers = no_headers();
        let a = request_key(&ctx(Method::Get, &with, &Value::Null, &headers));
        let b = request_key(&ctx(Method::Get, &without, &Value::Null, &headers));
        assert_eq!(a, b);
        assert_eq!(a, "GET|/users?page=2");
    }

    #[test]
    fn request_key_payload_is_order_insensitive() {
        let url = Url::parse("https://api.test/users").unwrap();
        let headers = no_headers();
        let p1 = json!({"b": 2, "a": {"y": 1, "x": 0}});
        let p2 = json!({"a": {"x": 0, "y": 1}, "b": 2});
        assert_eq!(
            request_key(&ctx(Method::Post, &url, &p1, &headers)),
            request_key(&ctx(Method::Post, &url, &p2, &headers)),
        );
    }

    #[test]
    fn request_key_filters_dynamic_headers_and_lowercases_stable_ones() {
        let url = Url::parse("https://api.test/users").unwrap();

        let mut a = BTreeMap::new();
        a.insert("Authorization".to_string(), "Bearer t".to_string());
        a.insert("X-Request-Id".to_string(), "abc123".to_string());

        let mut b = BTreeMap::new();
        b.insert("authorization".to_string(), "Bearer t".to_string());
        b.insert("X-Request-Id".to_string(), "zzz999".to_string());

        let ka = request_key(&ctx(Method::Get, &url, &Value::Null, &a));
        let kb = request_key(&ctx(Method::Get, &url, &Value::Null, &b));
        assert_eq!(ka, kb);
        assert!(ka.contains("authorization:Bearer t"));
        assert!(!ka.contains("abc123"));
    }

    #[test]
    fn request_key_header_only_differs_from_payload_only() {
        let url = Url::parse("https://api.test/thing").unwrap();
        let mut headers = BTreeMap::new();
        headers.insert("accept".to_string(), "application/json".to_string());
        let empty = no_headers();

        let header_only = request_key(&ctx(Method::Post, &url, &Value::Null, &headers));
        let payload_only =
            request_key(&ctx(Method::Post, &url, &json!("application/json"), &empty));
        assert_ne!(header_only, payload_only);
    }

    #[test]
    fn stable_json_sorts_nested_keys() {
        let v = json!({"z": [{"b": 1, "a": 2}], "a": true});
        assert_eq!(stable_json(&v), r#"{"a":true,"z":[{"a":2,"b":1}]}"#);
    }

    #[test]
    fn custom_serializer_errors_propagate() {
        let url = Url::parse("https://api.test/x").unwrap();
        let headers = no_headers();
        let ser = KeySerializer::custom(|_ctx: &KeyContext| Err("nope".into()));
        let err = ser.serialize(&ctx(Method::Get, &url, &Value::Null, &headers)).unwrap_err();
        assert_eq!(err.to_string(), "nope");
    }
}
