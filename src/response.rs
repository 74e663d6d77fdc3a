//! The value a successful request resolves to.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::method::Method;
use crate::parse::{Body, ParseError};

/// Snapshot of the request as it went over the wire.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub method: Method,
    /// Path as the caller gave it.
    pub path: String,
    /// Fully-resolved URL, params merged.
    pub url: String,
    pub headers: BTreeMap<String, String>,
    /// `Value::Null` when no payload was sent.
    pub payload: Value,
}

/// A completed, parsed response.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub data: Body,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub request: RequestRecord,
    /// 1-based attempt that produced this response.
    pub attempt: u32,
    /// Whether the value came from the cache rather than the transport.
    pub from_cache: bool,
}

impl FetchResponse {
    /// Deserialize a JSON body into a concrete type.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ParseError> {
        self.data.json()
    }
}
