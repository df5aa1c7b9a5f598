//! Telemetry metric name constants.
//!
//! Centralised metric names for the resilience layer. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops. The in-process
//! [`StatsRegistry`](crate::stats::StatsRegistry) keeps its own atomic
//! counters regardless, so monitoring endpoints work without a recorder.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `resilio_`. Counters end in `_total`,
//! gauges name the quantity they hold.
//!
//! # Common labels
//!
//! - `route`: HTTP route the admission decision was made for
//! - `operation`: name of the wrapped dependency call (e.g. "ai.diagnose")

/// Total cache hits.
pub const CACHE_HITS_TOTAL: &str = "resilio_cache_hits_total";

/// Total cache misses (absent or expired).
pub const CACHE_MISSES_TOTAL: &str = "resilio_cache_misses_total";

/// Total entries evicted to make room for new ones.
pub const CACHE_EVICTIONS_TOTAL: &str = "resilio_cache_evictions_total";

/// Total entries dropped because their TTL elapsed.
pub const CACHE_EXPIRATIONS_TOTAL: &str = "resilio_cache_expirations_total";

/// Current number of cache entries.
pub const CACHE_ENTRIES: &str = "resilio_cache_entries";

/// Total successful pool acquisitions.
pub const POOL_ACQUIRED_TOTAL: &str = "resilio_pool_acquired_total";

/// Total acquisitions that timed out.
pub const POOL_TIMEOUTS_TOTAL: &str = "resilio_pool_timeouts_total";

/// Total handles discarded after a failed health check.
pub const POOL_BROKEN_TOTAL: &str = "resilio_pool_broken_total";

/// Total handles opened by the pool.
pub const POOL_CREATED_TOTAL: &str = "resilio_pool_created_total";

/// Handles currently checked out.
pub const POOL_IN_USE: &str = "resilio_pool_in_use";

/// Handles currently idle.
pub const POOL_IDLE: &str = "resilio_pool_idle";

/// Total requests admitted by the rate limiter.
///
/// Labels: `route`.
pub const REQUESTS_ALLOWED_TOTAL: &str = "resilio_requests_allowed_total";

/// Total requests rejected by the rate limiter.
///
/// Labels: `route`.
pub const REQUESTS_THROTTLED_TOTAL: &str = "resilio_requests_throttled_total";

/// Total attempts made against a dependency (initial + retries).
///
/// Labels: `operation`.
pub const CALL_ATTEMPTS_TOTAL: &str = "resilio_call_attempts_total";

/// Total retry attempts (not counting the initial request).
///
/// Labels: `operation`.
pub const CALL_RETRIES_TOTAL: &str = "resilio_call_retries_total";

/// Total calls finished with a fresh value.
///
/// Labels: `operation`.
pub const CALL_SUCCESSES_TOTAL: &str = "resilio_call_successes_total";

/// Total calls surfaced as an error.
///
/// Labels: `operation`.
pub const CALL_FAILURES_TOTAL: &str = "resilio_call_failures_total";

/// Total calls answered with a fallback value (degraded mode).
///
/// Labels: `operation`.
pub const FALLBACKS_TOTAL: &str = "resilio_fallbacks_total";

/// Total calls abandoned through their cancellation token.
///
/// Labels: `operation`.
pub const CALL_CANCELLED_TOTAL: &str = "resilio_call_cancelled_total";
