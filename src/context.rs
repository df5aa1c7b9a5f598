//! Explicitly constructed resilience context.
//!
//! [`Resilience`] owns one cache, one rate limiter, one connection pool and
//! the stats registry they all report to. Request handlers receive it by
//! reference (usually inside an `Arc`); nothing in the crate is global, so
//! tests build isolated instances.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, CacheStore};
use crate::config::Config;
use crate::pool::{ConnectionManager, Pool, PoolStatus};
use crate::ratelimit::{Admission, RateLimiter};
use crate::retry::{CallKind, Outcome, ResilientCall};
use crate::stats::{CallCounters, StatsRegistry};
use crate::{ResilioError, Result};

/// Everything the monitoring endpoints expose, in one serializable value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitoringReport {
    pub uptime_secs: u64,
    pub cache: CacheStats,
    pub pool: PoolStatus,
    pub rate_limit: RateLimitReport,
    pub calls: CallCounters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitReport {
    pub window_secs: u64,
    pub allowed: u64,
    pub throttled: u64,
    pub throttled_by_route: std::collections::BTreeMap<String, u64>,
    pub tracked_windows: u64,
}

/// The resilience layer for one process.
///
/// `M` is the database driver adapter, `V` the type of cached results.
pub struct Resilience<M: ConnectionManager, V> {
    config: Config,
    stats: Arc<StatsRegistry>,
    cache: Arc<CacheStore<V>>,
    limiter: Arc<RateLimiter>,
    pool: Pool<M>,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<M, V> Resilience<M, V>
where
    M: ConnectionManager,
    V: Clone + Send + Sync + 'static,
{
    /// Validate `config`, build every component, warm the pool and start
    /// the background sweep.
    ///
    /// A database that is down at startup does not fail initialization:
    /// the pool starts cold and calls degrade to their fallbacks until it
    /// recovers.
    pub async fn init(config: Config, manager: M) -> Result<Self> {
        config.validate()?;

        let stats = Arc::new(StatsRegistry::new());
        let cache = Arc::new(CacheStore::new(config.cache.clone()).with_stats(Arc::clone(&stats)));
        let limiter = Arc::new(
            RateLimiter::new(config.rate_limit.clone()).with_stats(Arc::clone(&stats)),
        );
        let pool = Pool::with_stats(manager, config.pool.clone(), Arc::clone(&stats));

        if let Err(e) = pool.warm_up().await {
            warn!(error = %e, "connection pool warm-up failed, starting cold");
        }

        let shutdown = CancellationToken::new();
        let sweeper = config.cache.sweep_interval_duration().map(|period| {
            spawn_sweeper(
                Arc::clone(&cache),
                Arc::clone(&limiter),
                period,
                shutdown.child_token(),
            )
        });

        info!(
            cache_max_entries = config.cache.max_entries,
            cache_ttl_secs = config.cache.ttl_secs,
            pool_max_size = config.pool.max_size,
            window_secs = config.rate_limit.window_secs,
            routes = config.rate_limit.routes.len(),
            "resilience layer initialized"
        );

        Ok(Self {
            config,
            stats,
            cache,
            limiter,
            pool,
            shutdown,
            sweeper: Mutex::new(sweeper),
        })
    }

    /// Cancel in-flight retries, stop the sweep, close the pool and empty
    /// the cache. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let sweeper = self.sweeper.lock().take();
        if let Some(handle) = sweeper {
            if let Err(e) = handle.await {
                warn!(error = %e, "cache sweeper ended abnormally");
            }
        }
        self.pool.close().await;
        self.cache.clear();
        info!("resilience layer shut down");
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &Arc<StatsRegistry> {
        &self.stats
    }

    pub fn cache(&self) -> &CacheStore<V> {
        &self.cache
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn pool(&self) -> &Pool<M> {
        &self.pool
    }

    /// Token cancelled by [`shutdown`](Self::shutdown).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Rate-limit one request, as an error for `?` use in handlers.
    pub fn admit(&self, client_id: &str, route: &str) -> Result<()> {
        match self.limiter.admit(client_id, route) {
            Admission::Allowed { .. } => Ok(()),
            Admission::Throttled { retry_after, .. } => Err(ResilioError::Throttled {
                route: route.to_owned(),
                retry_after,
            }),
        }
    }

    /// A [`ResilientCall`] preconfigured with the preset for `kind`, this
    /// context's stats, and cancellation on shutdown.
    pub fn call<T>(&self, operation: &str, kind: CallKind) -> ResilientCall<T> {
        ResilientCall::new(operation, self.config.retry.policy(kind).clone())
            .stats(Arc::clone(&self.stats))
            .cancel_on(self.shutdown.child_token())
    }

    /// Serve `key` from the cache, or compute it through a resilient call.
    ///
    /// Only fresh results are written back; a fallback is returned to the
    /// caller but never cached, so the next request tries the dependency
    /// again.
    pub async fn cached_call<F, Fut>(
        &self,
        key: &str,
        kind: CallKind,
        fallback: Option<V>,
        op: F,
    ) -> Outcome<V>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(value) = self.cache.get(key) {
            return Outcome::Success(value);
        }
        let outcome = self
            .call(kind.as_str(), kind)
            .fallback_opt(fallback)
            .execute(op)
            .await;
        if let Outcome::Success(value) = &outcome {
            self.cache.put(key, value.clone());
        }
        outcome
    }

    /// Run `f` against a pooled connection under the database retry preset.
    ///
    /// Each attempt acquires its own connection and releases it before any
    /// backoff, so a sleeping retry never holds pool capacity.
    pub async fn with_database<T, F>(
        &self,
        operation: &str,
        fallback: Option<T>,
        f: F,
    ) -> Outcome<T>
    where
        F: for<'c> Fn(&'c mut M::Connection) -> BoxFuture<'c, Result<T>>,
    {
        let pool = &self.pool;
        let f = &f;
        self.call(operation, CallKind::Database)
            .fallback_opt(fallback)
            .execute(move || pool.with_connection(f))
            .await
    }

    /// Current cache, pool, limiter and call counters.
    pub fn report(&self) -> MonitoringReport {
        let snapshot = self.stats.snapshot();
        self.limiter.sweep();
        MonitoringReport {
            uptime_secs: snapshot.uptime_secs,
            cache: self.cache.stats(),
            pool: self.pool.status(),
            rate_limit: RateLimitReport {
                window_secs: self.config.rate_limit.window_secs,
                allowed: snapshot.rate_limit.allowed,
                throttled: snapshot.rate_limit.throttled,
                throttled_by_route: snapshot.rate_limit.throttled_by_route,
                tracked_windows: self.limiter.tracked_windows(),
            },
            calls: snapshot.calls,
        }
    }
}

fn spawn_sweeper<V>(
    cache: Arc<CacheStore<V>>,
    limiter: Arc<RateLimiter>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()>
where
    V: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = cache.sweep_expired();
                    limiter.sweep();
                    if removed > 0 {
                        debug!(removed, "background sweep");
                    }
                }
            }
        }
    })
}
