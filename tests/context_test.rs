//! End-to-end tests for [`Resilience`]: admission, cache, calls, lifecycle.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use resilio::{
    CacheConfig, CallKind, Config, ConnectionManager, Outcome, PoolConfig, RateLimitConfig,
    Resilience, ResilioError, Result, RetryPolicy,
};

// ============================================================================
// Mock driver
// ============================================================================

struct Db {
    rows: u32,
}

#[derive(Default)]
struct DbManager {
    down: AtomicBool,
    connects: AtomicU32,
}

#[async_trait]
impl ConnectionManager for DbManager {
    type Connection = Db;

    async fn connect(&self) -> Result<Db> {
        if self.down.load(Ordering::SeqCst) {
            return Err(ResilioError::Connect("connection refused".into()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Db { rows: 42 })
    }

    async fn is_valid(&self, _conn: &mut Db) -> bool {
        !self.down.load(Ordering::SeqCst)
    }
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new()
        .max_attempts(max_attempts)
        .base_delay(Duration::from_millis(100))
        .max_delay(Duration::from_secs(1))
        .jitter(false)
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.cache = CacheConfig::new()
        .max_entries(10)
        .ttl(Duration::from_secs(5))
        .sweep_interval(Duration::from_secs(30));
    config.pool = PoolConfig::new()
        .min_idle(1)
        .max_size(2)
        .acquire_timeout(Duration::from_millis(100));
    config.rate_limit = RateLimitConfig::empty().route("/analisar_logs", 2);
    config.retry.ai = fast_retry(2);
    config.retry.database = fast_retry(3);
    config
}

async fn layer() -> Resilience<DbManager, String> {
    Resilience::init(test_config(), DbManager::default())
        .await
        .unwrap()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn init_rejects_invalid_config() {
    let mut config = test_config();
    config.pool.max_size = 0;
    let result = Resilience::<DbManager, String>::init(config, DbManager::default()).await;
    assert!(matches!(result, Err(ResilioError::Configuration(_))));
}

#[tokio::test]
async fn init_warms_pool() {
    let layer = layer().await;
    assert_eq!(layer.pool().status().idle, 1);
    assert_eq!(layer.pool().manager().connects.load(Ordering::SeqCst), 1);
    layer.shutdown().await;
}

#[tokio::test]
async fn init_survives_database_outage() {
    let manager = DbManager::default();
    manager.down.store(true, Ordering::SeqCst);
    let layer = Resilience::<DbManager, String>::init(test_config(), manager)
        .await
        .unwrap();
    assert_eq!(layer.pool().status().idle, 0);
}

#[tokio::test(start_paused = true)]
async fn admit_surfaces_throttle_as_error() {
    let layer = layer().await;
    layer.admit("10.0.0.1", "/analisar_logs").unwrap();
    layer.admit("10.0.0.1", "/analisar_logs").unwrap();

    let err = layer.admit("10.0.0.1", "/analisar_logs").unwrap_err();
    assert_eq!(err.http_status(), 429);
    assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));

    // Other routes are unaffected.
    layer.admit("10.0.0.1", "/api/metrics").unwrap();
}

#[tokio::test(start_paused = true)]
async fn cached_call_writes_back_fresh_results() {
    let layer = layer().await;
    let calls = AtomicU32::new(0);
    let op = || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok("disk is full".to_string())
    };

    let first = layer.cached_call("fp-1", CallKind::Ai, None, op).await;
    assert!(first.is_success());
    let second = layer.cached_call("fp-1", CallKind::Ai, None, op).await;
    assert_eq!(second.value().as_deref(), Some("disk is full"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Past the TTL the dependency is asked again.
    tokio::time::advance(Duration::from_secs(6)).await;
    layer.cached_call("fp-1", CallKind::Ai, None, op).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn cached_call_never_caches_fallbacks() {
    let layer = layer().await;
    let outcome = layer
        .cached_call(
            "fp-2",
            CallKind::Ai,
            Some("analysis unavailable".to_string()),
            || async { Err(ResilioError::Timeout("ai".into())) },
        )
        .await;
    assert!(outcome.is_degraded());
    assert!(layer.cache().get("fp-2").is_none());

    let recovered = layer
        .cached_call("fp-2", CallKind::Ai, None, || async {
            Ok("real answer".to_string())
        })
        .await;
    assert!(recovered.is_success());
    assert_eq!(layer.cache().get("fp-2").as_deref(), Some("real answer"));

    let report = layer.report();
    assert_eq!(report.calls.fallbacks, 1);
    assert_eq!(report.calls.fallbacks_by_operation.get("ai"), Some(&1));
}

#[tokio::test]
async fn with_database_runs_on_pooled_connection() {
    let layer = layer().await;
    let outcome = layer
        .with_database("history.count", None, |db| {
            Box::pin(async move { Ok(db.rows) })
        })
        .await;
    assert!(matches!(outcome, Outcome::Success(42)));
    assert_eq!(layer.pool().status().in_use, 0);
}

#[tokio::test(start_paused = true)]
async fn with_database_falls_back_when_database_is_down() {
    let layer = layer().await;
    layer.pool().manager().down.store(true, Ordering::SeqCst);

    let outcome: Outcome<Vec<Value>> = layer
        .with_database("history.list", Some(Vec::new()), |_db| {
            Box::pin(async move { Ok(vec![Value::Null]) })
        })
        .await;

    // The warm handle fails its probe on release; later attempts cannot
    // connect at all.
    match outcome {
        Outcome::Success(_) | Outcome::Fallback { .. } => {}
        Outcome::Failure(e) => panic!("expected a value, got {e}"),
    }
    assert_eq!(layer.pool().status().in_use, 0);

    let outcome: Outcome<u32> = layer
        .with_database("history.count", Some(0), |db| {
            Box::pin(async move { Ok(db.rows) })
        })
        .await;
    match outcome {
        Outcome::Fallback { value, cause } => {
            assert_eq!(value, 0);
            assert!(matches!(cause, ResilioError::Connect(_)));
        }
        other => panic!("expected fallback, got {other:?}"),
    }
    assert_eq!(layer.report().calls.retries, 2);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_in_flight_retries() {
    let layer = layer().await;

    let call = layer.cached_call("fp-3", CallKind::Ai, Some("fallback".to_string()), || async {
        Err(ResilioError::Timeout("ai".into()))
    });
    let stop = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        layer.shutdown().await;
    };
    let (outcome, ()) = tokio::join!(call, stop);

    assert!(matches!(outcome, Outcome::Failure(ResilioError::Cancelled)));
    assert!(layer.pool().is_closed());
    assert_eq!(layer.report().calls.cancelled, 1);
}

#[tokio::test]
async fn shutdown_closes_pool_and_clears_cache() {
    let layer = layer().await;
    layer.cache().put("k", "v".to_string());

    layer.shutdown().await;
    layer.shutdown().await;

    assert!(layer.cache().is_empty());
    assert!(layer.pool().is_closed());
    assert!(layer.shutdown_token().is_cancelled());
    let outcome: Outcome<u32> = layer
        .with_database("after.shutdown", None, |db| {
            Box::pin(async move { Ok(db.rows) })
        })
        .await;
    assert!(outcome.error().is_some());
}

#[tokio::test(start_paused = true)]
async fn background_sweep_reclaims_expired_entries() {
    let layer = layer().await;
    layer.cache().put("k", "v".to_string());
    assert_eq!(layer.cache().len(), 1);

    tokio::time::advance(Duration::from_secs(31)).await;
    for _ in 0..10 {
        if layer.cache().is_empty() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(layer.cache().is_empty());
    layer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn report_covers_every_component() {
    let layer = layer().await;
    layer.admit("a", "/analisar_logs").unwrap();
    layer.admit("a", "/analisar_logs").unwrap();
    let _ = layer.admit("a", "/analisar_logs");
    layer.cache().put("k", "v".to_string());
    layer.cache().get("k");
    layer.cache().get("missing");

    let report = layer.report();
    assert_eq!(report.cache.hits, 1);
    assert_eq!(report.cache.misses, 1);
    assert_eq!(report.cache.size, 1);
    assert_eq!(report.cache.max_entries, 10);
    assert_eq!(report.pool.max_size, 2);
    assert_eq!(report.pool.idle, 1);
    assert_eq!(report.rate_limit.throttled, 1);
    assert_eq!(
        report.rate_limit.throttled_by_route.get("/analisar_logs"),
        Some(&1)
    );
    assert_eq!(report.rate_limit.tracked_windows, 1);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["pool"]["active"], 0);
    assert_eq!(json["cache"]["hit_rate_percent"], 50.0);
}
