//! The transport seam: the platform fetch primitive the engine wraps.
//!
//! The engine owns resilience and lifecycle; the [`Transport`] owns moving
//! bytes. Connection pooling, TLS, and HTTP version negotiation all live
//! behind this trait. On cancellation the engine drops the in-flight fetch
//! future, so implementations should be cancellation-safe.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use url::Url;

use crate::error::{STATUS_CONNECTION_LOST, STATUS_UNCLASSIFIED};
use crate::method::Method;

/// A fully-resolved outgoing request.
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub method: Method,
    pub url: Url,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Bytes>,
}

/// An undecoded response from the transport.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    /// Header names lowercased by the transport.
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl RawResponse {
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }

    /// 200–399 counts as ok; redirects are assumed followed by the transport.
    pub fn is_ok(&self) -> bool {
        (200..400).contains(&self.status)
    }
}

/// Transport-level failure, before any HTTP status exists.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection refused")]
    ConnectionRefused,

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("connection aborted")]
    ConnectionAborted,

    #[error("transport failure: {0}")]
    Other(String),
}

impl TransportError {
    /// The HTTP-like status the engine maps this failure onto.
    pub fn status(&self) -> u16 {
        match self {
            TransportError::ConnectionRefused
            | TransportError::ConnectionReset
            | TransportError::ConnectionAborted => STATUS_CONNECTION_LOST,
            TransportError::Other(_) => STATUS_UNCLASSIFIED,
        }
    }

    pub fn is_connection_lost(&self) -> bool {
        self.status() == STATUS_CONNECTION_LOST
    }
}

/// The platform fetch primitive.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn fetch(&self, request: &RawRequest) -> Result<RawResponse, TransportError>;
}

/// One scripted exchange for [`MockTransport`].
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    outcome: Result<RawResponse, TransportError>,
    delay: Duration,
}

impl ScriptedResponse {
    pub fn json(status: u16, value: Value) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        Self {
            outcome: Ok(RawResponse {
                status,
                headers,
                body: Bytes::from(value.to_string()),
            }),
            delay: Duration::ZERO,
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "text/plain".to_string());
        Self {
            outcome: Ok(RawResponse { status, headers, body: Bytes::from(body.into()) }),
            delay: Duration::ZERO,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            outcome: Ok(RawResponse { status, headers: BTreeMap::new(), body: Bytes::new() }),
            delay: Duration::ZERO,
        }
    }

    pub fn error(error: TransportError) -> Self {
        Self { outcome: Err(error), delay: Duration::ZERO }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let Ok(response) = &mut self.outcome {
            response.headers.insert(name.to_ascii_lowercase(), value.to_string());
        }
        self
    }

    /// Simulated network latency before the outcome is produced.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug, Default)]
struct RouteScript {
    /// One-shot responses, consumed in order before the sticky response.
    queue: VecDeque<ScriptedResponse>,
    sticky: Option<ScriptedResponse>,
}

#[derive(Debug, Default)]
struct MockState {
    routes: HashMap<String, RouteScript>,
    calls: Vec<RawRequest>,
}

/// In-memory transport for tests: script responses per `(method, path)`,
/// then assert on the recorded calls.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn route_key(method: Method, path: &str) -> String {
        format!("{} {}", method, path)
    }

    /// Respond to every request for `(method, path)` with `response`.
    pub fn respond_with(&self, method: Method, path: &str, response: ScriptedResponse) {
        let mut state = self.state.lock().expect("mock transport poisoned");
        state.routes.entry(Self::route_key(method, path)).or_default().sticky = Some(response);
    }

    /// Queue a one-shot response, consumed before the sticky response.
    pub fn enqueue(&self, method: Method, path: &str, response: ScriptedResponse) {
        let mut state = self.state.lock().expect("mock transport poisoned");
        state.routes.entry(Self::route_key(method, path)).or_default().queue.push_back(response);
    }

    /// Every request seen, in arrival order.
    pub fn calls(&self) -> Vec<RawRequest> {
        self.state.lock().expect("mock transport poisoned").calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().expect("mock transport poisoned").calls.len()
    }

    /// Number of requests seen for one `(method, path)`.
    pub fn calls_for(&self, method: Method, path: &str) -> usize {
        self.state
            .lock()
            .expect("mock transport poisoned")
            .calls
            .iter()
            .filter(|c| c.method == method && c.url.path() == path)
            .count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch(&self, request: &RawRequest) -> Result<RawResponse, TransportError> {
        let scripted = {
            let mut state = self.state.lock().expect("mock transport poisoned");
            state.calls.push(request.clone());
            let key = Self::route_key(request.method, request.url.path());
            match state.routes.get_mut(&key) {
                Some(script) => {
                    script.queue.pop_front().or_else(|| script.sticky.clone())
                }
                None => None,
            }
        };

        let Some(scripted) = scripted else {
            return Err(TransportError::Other(format!(
                "no scripted response for {} {}",
                request.method,
                request.url.path()
            )));
        };

        if scripted.delay > Duration::ZERO {
            tokio::time::sleep(scripted.delay).await;
        }
        scripted.outcome
    }
}
