//! Resilio - resilience and performance layer for AI-assisted log diagnosis
//!
//! This crate provides the pieces a request handler composes around calls to
//! a slow or flaky AI service and a relational store: a TTL + LRU result
//! cache, a fixed-window rate limiter, a bounded connection pool, and a
//! retry/backoff/fallback wrapper. All of them report into one
//! [`StatsRegistry`] that backs the monitoring endpoints.
//!
//! # Example
//!
//! ```rust,ignore
//! use resilio::{CallKind, Config, Outcome, Resilience};
//!
//! let layer = Resilience::init(Config::load_or_default(None)?, PgManager::new(url)).await?;
//!
//! // In a request handler:
//! layer.admit(&client_ip, "/analisar_logs")?;
//! let outcome = layer
//!     .cached_call(&fingerprint, CallKind::Ai, Some(Diagnosis::unavailable()), || {
//!         ai.post_json("/v1/diagnose", &request)
//!     })
//!     .await;
//! if outcome.is_degraded() {
//!     // served the fallback
//! }
//!
//! layer.shutdown().await;
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod inference;
pub mod pool;
pub mod ratelimit;
pub mod retry;
pub mod stats;
pub mod telemetry;

// Re-export main types at crate root
pub use cache::{CacheConfig, CacheStats, CacheStore, EntryInfo};
pub use config::{Config, InferenceConfig, LogFormat, LoggingConfig, RetryConfigs};
pub use context::{MonitoringReport, RateLimitReport, Resilience};
pub use error::{ResilioError, Result};
pub use inference::InferenceClient;
pub use pool::{ConnectionManager, HandleState, Pool, PoolConfig, PoolStatus, PooledConnection};
pub use ratelimit::{Admission, LimitScope, RateLimitConfig, RateLimiter, RateWindow, RouteUsage};
pub use retry::{CallKind, Outcome, ResilientCall, RetryPolicy};
pub use stats::{StatsEvent, StatsRegistry, StatsSnapshot};

/// Crate version, as reported by the operator binary.
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");
