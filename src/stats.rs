//! Process-wide counters for the resilience layer.
//!
//! [`StatsRegistry`] sits on every request's hot path, so writers only touch
//! atomics. Per-route and per-operation breakdowns live behind a
//! `parking_lot::RwLock` whose write side is taken once per new label;
//! increments and snapshots both use the read side and never block each
//! other.
//!
//! Every recorded event is mirrored onto the `metrics` facade using the
//! names in [`telemetry`](crate::telemetry).

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;

use crate::telemetry;

/// A single observable transition inside the layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsEvent<'a> {
    CacheHit,
    CacheMiss,
    CacheEviction,
    CacheExpired,
    /// Current number of cache entries after a mutation.
    CacheSize(usize),
    PoolAcquired,
    PoolTimeout,
    PoolHandleCreated,
    PoolHandleBroken,
    /// Current pool occupancy after an acquire or release.
    PoolGauge { in_use: usize, idle: usize },
    Allowed { route: &'a str },
    Throttled { route: &'a str },
    Attempt { operation: &'a str },
    Retry { operation: &'a str },
    Success { operation: &'a str },
    Failure { operation: &'a str },
    FallbackServed { operation: &'a str },
    Cancelled { operation: &'a str },
}

/// Lock-minimal counter registry shared by all components.
#[derive(Debug)]
pub struct StatsRegistry {
    started: Instant,

    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_evictions: AtomicU64,
    cache_expirations: AtomicU64,
    cache_size: AtomicUsize,

    pool_acquired: AtomicU64,
    pool_timeouts: AtomicU64,
    pool_created: AtomicU64,
    pool_broken: AtomicU64,
    pool_in_use: AtomicUsize,
    pool_idle: AtomicUsize,

    requests_allowed: AtomicU64,
    requests_throttled: AtomicU64,
    throttled_by_route: LabelledCounters,

    call_attempts: AtomicU64,
    call_retries: AtomicU64,
    call_successes: AtomicU64,
    call_failures: AtomicU64,
    call_cancelled: AtomicU64,
    fallbacks: AtomicU64,
    fallbacks_by_operation: LabelledCounters,
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            cache_evictions: AtomicU64::new(0),
            cache_expirations: AtomicU64::new(0),
            cache_size: AtomicUsize::new(0),
            pool_acquired: AtomicU64::new(0),
            pool_timeouts: AtomicU64::new(0),
            pool_created: AtomicU64::new(0),
            pool_broken: AtomicU64::new(0),
            pool_in_use: AtomicUsize::new(0),
            pool_idle: AtomicUsize::new(0),
            requests_allowed: AtomicU64::new(0),
            requests_throttled: AtomicU64::new(0),
            throttled_by_route: LabelledCounters::default(),
            call_attempts: AtomicU64::new(0),
            call_retries: AtomicU64::new(0),
            call_successes: AtomicU64::new(0),
            call_failures: AtomicU64::new(0),
            call_cancelled: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            fallbacks_by_operation: LabelledCounters::default(),
        }
    }

    /// Pre-register a route so it appears in snapshots with a zero count.
    pub fn register_route(&self, route: &str) {
        self.throttled_by_route.register(route);
    }

    /// Record one event.
    pub fn record(&self, event: StatsEvent<'_>) {
        match event {
            StatsEvent::CacheHit => {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::CACHE_HITS_TOTAL).increment(1);
            }
            StatsEvent::CacheMiss => {
                self.cache_misses.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
            }
            StatsEvent::CacheEviction => {
                self.cache_evictions.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::CACHE_EVICTIONS_TOTAL).increment(1);
            }
            StatsEvent::CacheExpired => {
                self.cache_expirations.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::CACHE_EXPIRATIONS_TOTAL).increment(1);
            }
            StatsEvent::CacheSize(size) => {
                self.cache_size.store(size, Ordering::Relaxed);
                metrics::gauge!(telemetry::CACHE_ENTRIES).set(size as f64);
            }
            StatsEvent::PoolAcquired => {
                self.pool_acquired.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::POOL_ACQUIRED_TOTAL).increment(1);
            }
            StatsEvent::PoolTimeout => {
                self.pool_timeouts.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::POOL_TIMEOUTS_TOTAL).increment(1);
            }
            StatsEvent::PoolHandleCreated => {
                self.pool_created.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::POOL_CREATED_TOTAL).increment(1);
            }
            StatsEvent::PoolHandleBroken => {
                self.pool_broken.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::POOL_BROKEN_TOTAL).increment(1);
            }
            StatsEvent::PoolGauge { in_use, idle } => {
                self.pool_in_use.store(in_use, Ordering::Relaxed);
                self.pool_idle.store(idle, Ordering::Relaxed);
                metrics::gauge!(telemetry::POOL_IN_USE).set(in_use as f64);
                metrics::gauge!(telemetry::POOL_IDLE).set(idle as f64);
            }
            StatsEvent::Allowed { route } => {
                self.requests_allowed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::REQUESTS_ALLOWED_TOTAL, "route" => route.to_owned())
                    .increment(1);
            }
            StatsEvent::Throttled { route } => {
                self.requests_throttled.fetch_add(1, Ordering::Relaxed);
                self.throttled_by_route.increment(route);
                metrics::counter!(telemetry::REQUESTS_THROTTLED_TOTAL, "route" => route.to_owned())
                    .increment(1);
            }
            StatsEvent::Attempt { operation } => {
                self.call_attempts.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::CALL_ATTEMPTS_TOTAL, "operation" => operation.to_owned())
                    .increment(1);
            }
            StatsEvent::Retry { operation } => {
                self.call_retries.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::CALL_RETRIES_TOTAL, "operation" => operation.to_owned())
                    .increment(1);
            }
            StatsEvent::Success { operation } => {
                self.call_successes.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::CALL_SUCCESSES_TOTAL, "operation" => operation.to_owned())
                    .increment(1);
            }
            StatsEvent::Failure { operation } => {
                self.call_failures.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::CALL_FAILURES_TOTAL, "operation" => operation.to_owned())
                    .increment(1);
            }
            StatsEvent::FallbackServed { operation } => {
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                self.fallbacks_by_operation.increment(operation);
                metrics::counter!(telemetry::FALLBACKS_TOTAL, "operation" => operation.to_owned())
                    .increment(1);
            }
            StatsEvent::Cancelled { operation } => {
                self.call_cancelled.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::CALL_CANCELLED_TOTAL, "operation" => operation.to_owned())
                    .increment(1);
            }
        }
    }

    /// Take a read-only projection of the current counters.
    ///
    /// Counters are read individually, so a snapshot taken under load is
    /// not a single atomic cut across all of them.
    pub fn snapshot(&self) -> StatsSnapshot {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        StatsSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            cache: CacheCounters {
                hits,
                misses,
                evictions: self.cache_evictions.load(Ordering::Relaxed),
                expirations: self.cache_expirations.load(Ordering::Relaxed),
                size: self.cache_size.load(Ordering::Relaxed),
                hit_rate_percent: hit_rate_percent(hits, misses),
            },
            pool: PoolCounters {
                in_use: self.pool_in_use.load(Ordering::Relaxed),
                idle: self.pool_idle.load(Ordering::Relaxed),
                acquired: self.pool_acquired.load(Ordering::Relaxed),
                timeouts: self.pool_timeouts.load(Ordering::Relaxed),
                created: self.pool_created.load(Ordering::Relaxed),
                broken: self.pool_broken.load(Ordering::Relaxed),
            },
            rate_limit: RateLimitCounters {
                allowed: self.requests_allowed.load(Ordering::Relaxed),
                throttled: self.requests_throttled.load(Ordering::Relaxed),
                throttled_by_route: self.throttled_by_route.snapshot(),
            },
            calls: CallCounters {
                attempts: self.call_attempts.load(Ordering::Relaxed),
                retries: self.call_retries.load(Ordering::Relaxed),
                successes: self.call_successes.load(Ordering::Relaxed),
                failures: self.call_failures.load(Ordering::Relaxed),
                cancelled: self.call_cancelled.load(Ordering::Relaxed),
                fallbacks: self.fallbacks.load(Ordering::Relaxed),
                fallbacks_by_operation: self.fallbacks_by_operation.snapshot(),
            },
        }
    }
}

/// Counters keyed by a label (route, operation).
#[derive(Debug, Default)]
struct LabelledCounters {
    inner: RwLock<HashMap<String, AtomicU64>>,
}

impl LabelledCounters {
    fn register(&self, label: &str) {
        if self.inner.read().contains_key(label) {
            return;
        }
        self.inner
            .write()
            .entry(label.to_owned())
            .or_insert_with(|| AtomicU64::new(0));
    }

    fn increment(&self, label: &str) {
        if let Some(counter) = self.inner.read().get(label) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.inner
            .write()
            .entry(label.to_owned())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BTreeMap<String, u64> {
        self.inner
            .read()
            .iter()
            .map(|(label, counter)| (label.clone(), counter.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Hit rate as a percentage rounded to two decimals; 0 when nothing was asked.
pub(crate) fn hit_rate_percent(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        return 0.0;
    }
    (hits as f64 / total as f64 * 10_000.0).round() / 100.0
}

/// Immutable projection of [`StatsRegistry`] taken at query time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub cache: CacheCounters,
    pub pool: PoolCounters,
    pub rate_limit: RateLimitCounters,
    pub calls: CallCounters,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: usize,
    pub hit_rate_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolCounters {
    pub in_use: usize,
    pub idle: usize,
    pub acquired: u64,
    pub timeouts: u64,
    pub created: u64,
    pub broken: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitCounters {
    pub allowed: u64,
    pub throttled: u64,
    pub throttled_by_route: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallCounters {
    pub attempts: u64,
    pub retries: u64,
    pub successes: u64,
    pub failures: u64,
    pub cancelled: u64,
    pub fallbacks: u64,
    pub fallbacks_by_operation: BTreeMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_handles_zero_requests() {
        assert_eq!(hit_rate_percent(0, 0), 0.0);
    }

    #[test]
    fn hit_rate_rounds_to_two_decimals() {
        assert_eq!(hit_rate_percent(1, 2), 33.33);
        assert_eq!(hit_rate_percent(3, 1), 75.0);
    }

    #[test]
    fn throttles_are_broken_down_by_route() {
        let stats = StatsRegistry::new();
        stats.register_route("/api/metrics");
        stats.record(StatsEvent::Throttled { route: "/" });
        stats.record(StatsEvent::Throttled { route: "/" });
        stats.record(StatsEvent::Allowed { route: "/" });

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.rate_limit.allowed, 1);
        assert_eq!(snapshot.rate_limit.throttled, 2);
        assert_eq!(snapshot.rate_limit.throttled_by_route.get("/"), Some(&2));
        assert_eq!(
            snapshot.rate_limit.throttled_by_route.get("/api/metrics"),
            Some(&0)
        );
    }

    #[test]
    fn gauges_hold_latest_value() {
        let stats = StatsRegistry::new();
        stats.record(StatsEvent::PoolGauge { in_use: 3, idle: 1 });
        stats.record(StatsEvent::PoolGauge { in_use: 1, idle: 3 });
        stats.record(StatsEvent::CacheSize(7));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.pool.in_use, 1);
        assert_eq!(snapshot.pool.idle, 3);
        assert_eq!(snapshot.cache.size, 7);
    }
}
