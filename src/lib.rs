#![forbid(unsafe_code)]

//! # refetch
//!
//! A resilient HTTP client engine for async Rust. refetch wraps a pluggable
//! transport (the platform fetch primitive) with four coordinated policies:
//!
//! - **Deduplication** — concurrent identical requests collapse into one
//!   in-flight operation, with per-joiner timeout and cancellation
//! - **Caching** — fresh hits skip the network; stale hits are served while
//!   a background revalidation races a configurable timeout
//! - **Rate limiting** — continuously-refilling token buckets gate
//!   admission before anything else runs
//! - **Retry** — status-code classification, exponential backoff with an
//!   optional jitter, per-attempt timeouts
//!
//! plus a request lifecycle with total/attempt timeout budgets, abortable
//! handles, payload/response transformation hooks, and a typed event bus
//! covering every policy decision.
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use refetch::{FetchEngine, FetchOptions, Method, RequestOptions};
//! use refetch::transport::{MockTransport, ScriptedResponse};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Any `Transport` works here; the mock keeps the example hermetic.
//!     let transport = MockTransport::new();
//!     transport.respond_with(
//!         Method::Get,
//!         "/users",
//!         ScriptedResponse::json(200, json!([{"id": 1}])),
//!     );
//!
//!     let engine = FetchEngine::new(
//!         Arc::new(transport),
//!         FetchOptions::new("https://api.example.com"),
//!     )?;
//!
//!     let response = engine.get("/users", RequestOptions::new()).await?;
//!     assert_eq!(response.status, 200);
//!     Ok(())
//! }
//! ```
//!
//! ## Policy configuration
//!
//! Every policy takes `true | false | config` via [`Toggle`]; routes bind to
//! policy behavior through ordered first-match-wins rules:
//!
//! ```rust
//! use std::time::Duration;
//! use refetch::{CacheConfig, FetchOptions, RetryConfig};
//!
//! let options = FetchOptions::new("https://api.example.com")
//!     .retry(RetryConfig {
//!         max_attempts: 5,
//!         base_delay: Duration::from_millis(250),
//!         ..RetryConfig::default()
//!     })
//!     .cache_policy(CacheConfig {
//!         ttl: Duration::from_secs(60),
//!         stale_in: Some(Duration::from_secs(10)),
//!         stale_timeout: Some(Duration::from_millis(150)),
//!         ..CacheConfig::default()
//!     })
//!     .rate_limit_policy(false);
//! ```

pub mod backoff;
pub mod cache;
pub mod cancel;
pub mod clock;
pub mod dedupe;
pub mod engine;
pub mod error;
pub mod events;
pub mod handle;
pub mod jitter;
pub mod key;
pub mod method;
pub mod options;
pub mod parse;
pub mod props;
pub mod rate_limit;
pub mod response;
pub mod retry;
pub mod rules;
pub mod sleeper;
pub mod transport;

// Re-exports
pub use backoff::Backoff;
pub use cache::{CacheAdapter, CacheConfig, CacheEntry, CacheOverrides, Freshness, MemoryAdapter};
pub use cancel::{AbortReason, CancelSource, CancelToken, TimerKind};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use dedupe::{DedupeConfig, DedupeOverrides};
pub use engine::FetchEngine;
pub use error::{ConfigError, FetchError, Step};
pub use events::{EventBus, FetchEvent, Subscription};
pub use handle::{AbortHandle, FetchHandle};
pub use jitter::Jitter;
pub use key::{endpoint_key, request_key, KeyContext, KeySerializer};
pub use method::Method;
pub use options::{FetchOptions, RequestInit, RequestOptions, Toggle, Validators};
pub use parse::{Body, ParseKind, TypeHint};
pub use props::HeaderFormat;
pub use rate_limit::{RateLimitConfig, RateLimitOverrides};
pub use response::{FetchResponse, RequestRecord};
pub use retry::{RetryConfig, RetryVerdict};
pub use rules::{PolicyRule, RuleMatch};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use transport::{RawRequest, RawResponse, Transport, TransportError};

pub mod prelude;
