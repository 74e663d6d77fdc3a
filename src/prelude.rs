//! Convenience re-exports for the common path.
//!
//! ```rust
//! use refetch::prelude::*;
//! ```

pub use crate::cache::{CacheAdapter, CacheConfig, MemoryAdapter};
pub use crate::dedupe::DedupeConfig;
pub use crate::engine::FetchEngine;
pub use crate::error::{ConfigError, FetchError, Step};
pub use crate::events::FetchEvent;
pub use crate::handle::{AbortHandle, FetchHandle};
pub use crate::method::Method;
pub use crate::options::{FetchOptions, RequestOptions, Toggle};
pub use crate::parse::{Body, ParseKind};
pub use crate::rate_limit::RateLimitConfig;
pub use crate::response::FetchResponse;
pub use crate::retry::{RetryConfig, RetryVerdict};
pub use crate::rules::{PolicyRule, RuleMatch};
pub use crate::transport::Transport;
