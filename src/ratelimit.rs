//! Fixed-window admission control per (client, route).
//!
//! Each `(client_id, route)` pair owns one [`RateWindow`]. A window starts at
//! the first request after the previous one lapsed and admits up to the
//! route's limit until `window` has elapsed. Across a window edge a client
//! can get up to twice the limit through in quick succession; that burst is
//! accepted in exchange for O(1) state per pair.
//!
//! # Architecture
//!
//! - Windows live in a moka cache with `time_to_idle = window`, so pairs
//!   that stop sending are reclaimed without a sweeper. A window idle for a
//!   full `window` would have reset on its next request anyway, so dropping
//!   it changes no decision.
//! - The cache is also bounded by `max_tracked_windows`. Once that many
//!   pairs are live, moka may evict (or decline to admit) a window that is
//!   still inside its period, and that pair starts over at zero. Size the
//!   bound well above the expected number of concurrent (client, route)
//!   pairs; it exists to cap memory under key churn, not to shape traffic.
//! - Two clocks are involved. Admission decisions read
//!   `tokio::time::Instant`, so they follow a paused test clock; idle
//!   reclamation runs on moka's own monotonic clock and does not. Under a
//!   paused clock, advancing time resets windows but does not reclaim them.
//! - Each window sits behind its own `parking_lot::Mutex`; decisions for the
//!   same pair are linearizable, different pairs never contend.
//! - An optional global window across all clients and routes is checked
//!   first.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::warn;

use crate::stats::{StatsEvent, StatsRegistry};

/// Rate limiting configuration.
///
/// ```rust
/// # use resilio::RateLimitConfig;
/// # use std::time::Duration;
/// let config = RateLimitConfig::new()
///     .window(Duration::from_secs(60))
///     .route("/analisar_logs", 10)
///     .route("/api/metrics", 30);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Window length in seconds. Default: 60.
    pub window_secs: u64,
    /// Requests per window across every client and route. Default: 1000.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_limit: Option<u32>,
    /// Limit for routes without their own entry; `None` leaves them
    /// unlimited. Default: `None`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_limit: Option<u32>,
    /// Upper bound on tracked (client, route) windows. Default: 100,000.
    /// Must be at least 1.
    pub max_tracked_windows: u64,
    /// Per-route limits, requests per window.
    pub routes: BTreeMap<String, u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let routes = [
            ("/", 10),
            ("/analisar_logs", 10),
            ("/api/metrics", 30),
            ("/api/analysis-history", 20),
            ("/classificar_solucao", 50),
            ("/api/performance", 30),
        ]
        .into_iter()
        .map(|(route, limit)| (route.to_string(), limit))
        .collect();
        Self {
            window_secs: 60,
            global_limit: Some(1_000),
            default_limit: None,
            max_tracked_windows: 100_000,
            routes,
        }
    }
}

impl RateLimitConfig {
    /// Defaults with the dashboard's route table.
    pub fn new() -> Self {
        Self::default()
    }

    /// No global limit, no default limit, no routes.
    pub fn empty() -> Self {
        Self {
            global_limit: None,
            routes: BTreeMap::new(),
            ..Self::default()
        }
    }

    /// Set the window length. Sub-second precision is dropped.
    pub fn window(mut self, window: Duration) -> Self {
        self.window_secs = window.as_secs();
        self
    }

    /// Set (or remove, with `None`) the limit shared by all clients and routes.
    pub fn global_limit(mut self, limit: Option<u32>) -> Self {
        self.global_limit = limit;
        self
    }

    /// Set the limit for routes without their own entry.
    pub fn default_limit(mut self, limit: Option<u32>) -> Self {
        self.default_limit = limit;
        self
    }

    /// Set the bound on tracked (client, route) windows.
    pub fn max_tracked_windows(mut self, n: u64) -> Self {
        self.max_tracked_windows = n;
        self
    }

    /// Add or replace the limit for one route.
    pub fn route(mut self, route: impl Into<String>, limit: u32) -> Self {
        self.routes.insert(route.into(), limit);
        self
    }

    pub fn window_duration(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Which limit rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    Global,
    Route,
}

/// Outcome of [`RateLimiter::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// `remaining` is what is left in the route's window, `None` when the
    /// route has no limit.
    Allowed { remaining: Option<u32> },
    Throttled {
        scope: LimitScope,
        retry_after: Duration,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

/// Request count for one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindow {
    pub window_start: Instant,
    pub count: u32,
}

impl RateWindow {
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
        }
    }

    /// Reset if the window has lapsed, then admit if under `limit`.
    pub fn try_admit(&mut self, now: Instant, limit: u32, window: Duration) -> Admission {
        if now.saturating_duration_since(self.window_start) >= window {
            self.window_start = now;
            self.count = 0;
        }
        if self.count < limit {
            self.count += 1;
            Admission::Allowed {
                remaining: Some(limit - self.count),
            }
        } else {
            Admission::Throttled {
                scope: LimitScope::Route,
                retry_after: self.resets_in(now, window),
            }
        }
    }

    /// Time until the current window lapses.
    pub fn resets_in(&self, now: Instant, window: Duration) -> Duration {
        (self.window_start + window).saturating_duration_since(now)
    }

    fn count_at(&self, now: Instant, window: Duration) -> u32 {
        if now.saturating_duration_since(self.window_start) >= window {
            0
        } else {
            self.count
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    client: String,
    route: String,
}

/// One route's usage for a client, as reported by
/// [`RateLimiter::client_status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteUsage {
    pub route: String,
    pub count: u32,
    pub limit: u32,
    pub resets_in: Duration,
}

/// Per-client, per-route fixed-window rate limiter.
pub struct RateLimiter {
    config: RateLimitConfig,
    window: Duration,
    windows: Cache<WindowKey, Arc<Mutex<RateWindow>>>,
    global: Mutex<RateWindow>,
    stats: Option<Arc<StatsRegistry>>,
}

impl RateLimiter {
    /// Create a limiter. A zero-length window is treated as one second and
    /// a `max_tracked_windows` of 0 as 1.
    pub fn new(config: RateLimitConfig) -> Self {
        let config = RateLimitConfig {
            max_tracked_windows: config.max_tracked_windows.max(1),
            ..config
        };
        let window = config.window_duration().max(Duration::from_secs(1));
        let windows = Cache::builder()
            .max_capacity(config.max_tracked_windows)
            .time_to_idle(window)
            .build();
        Self {
            config,
            window,
            windows,
            global: Mutex::new(RateWindow::new(Instant::now())),
            stats: None,
        }
    }

    /// Forward admission events to a shared registry. Configured routes are
    /// registered so they show up in snapshots before their first throttle.
    pub fn with_stats(mut self, stats: Arc<StatsRegistry>) -> Self {
        for route in self.config.routes.keys() {
            stats.register_route(route);
        }
        self.stats = Some(stats);
        self
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Limit that applies to `route`, if any.
    pub fn limit_for(&self, route: &str) -> Option<u32> {
        self.config
            .routes
            .get(route)
            .copied()
            .or(self.config.default_limit)
    }

    /// Decide whether one request from `client_id` to `route` may proceed.
    ///
    /// Never fails: throttling is a normal outcome, not an error.
    pub fn admit(&self, client_id: &str, route: &str) -> Admission {
        let now = Instant::now();

        if let Some(limit) = self.config.global_limit {
            let decision = self.global.lock().try_admit(now, limit, self.window);
            if let Admission::Throttled { retry_after, .. } = decision {
                return self.throttled(client_id, route, LimitScope::Global, retry_after);
            }
        }

        let Some(limit) = self.limit_for(route) else {
            self.emit(StatsEvent::Allowed { route });
            return Admission::Allowed { remaining: None };
        };

        let key = WindowKey {
            client: client_id.to_owned(),
            route: route.to_owned(),
        };
        let window = self
            .windows
            .get_with(key, || Arc::new(Mutex::new(RateWindow::new(now))));
        let decision = window.lock().try_admit(now, limit, self.window);

        match decision {
            Admission::Throttled { retry_after, .. } => {
                self.throttled(client_id, route, LimitScope::Route, retry_after)
            }
            allowed => {
                self.emit(StatsEvent::Allowed { route });
                allowed
            }
        }
    }

    /// Forget every window held for `client_id`.
    pub fn reset_client(&self, client_id: &str) {
        let keys: Vec<WindowKey> = self
            .windows
            .iter()
            .filter(|(key, _)| key.client == client_id)
            .map(|(key, _)| (*key).clone())
            .collect();
        for key in &keys {
            self.windows.invalidate(key);
        }
        tracing::info!(client = client_id, windows = keys.len(), "rate limits reset for client");
    }

    /// Current usage of every route `client_id` has a window for, sorted by
    /// route.
    pub fn client_status(&self, client_id: &str) -> Vec<RouteUsage> {
        let now = Instant::now();
        let mut usage: Vec<RouteUsage> = self
            .windows
            .iter()
            .filter(|(key, _)| key.client == client_id)
            .filter_map(|(key, window)| {
                let limit = self.limit_for(&key.route)?;
                let window = *window.lock();
                let count = window.count_at(now, self.window);
                let resets_in = if count == 0 {
                    Duration::ZERO
                } else {
                    window.resets_in(now, self.window)
                };
                Some(RouteUsage {
                    route: key.route.clone(),
                    count,
                    limit,
                    resets_in,
                })
            })
            .collect();
        usage.sort_by(|a, b| a.route.cmp(&b.route));
        usage
    }

    /// Apply pending idle expirations so [`tracked_windows`](Self::tracked_windows)
    /// is up to date.
    pub fn sweep(&self) {
        self.windows.run_pending_tasks();
    }

    /// Number of (client, route) windows currently held.
    pub fn tracked_windows(&self) -> u64 {
        self.windows.entry_count()
    }

    fn throttled(
        &self,
        client_id: &str,
        route: &str,
        scope: LimitScope,
        retry_after: Duration,
    ) -> Admission {
        warn!(
            client = client_id,
            route,
            ?scope,
            retry_after_secs = retry_after.as_secs(),
            "rate limit exceeded"
        );
        self.emit(StatsEvent::Throttled { route });
        Admission::Throttled { scope, retry_after }
    }

    fn emit(&self, event: StatsEvent<'_>) {
        if let Some(stats) = &self.stats {
            stats.record(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_window_bound_is_clamped() {
        let limiter =
            RateLimiter::new(RateLimitConfig::empty().route("/", 1).max_tracked_windows(0));
        assert_eq!(limiter.config().max_tracked_windows, 1);

        assert!(limiter.admit("c", "/").is_allowed());
        for _ in 0..20 {
            limiter.sweep();
            assert!(!limiter.admit("c", "/").is_allowed());
        }
    }

    #[test]
    fn window_admits_up_to_limit() {
        let now = Instant::now();
        let mut window = RateWindow::new(now);
        let w = Duration::from_secs(60);
        assert_eq!(
            window.try_admit(now, 2, w),
            Admission::Allowed { remaining: Some(1) }
        );
        assert_eq!(
            window.try_admit(now, 2, w),
            Admission::Allowed { remaining: Some(0) }
        );
        assert!(!window.try_admit(now, 2, w).is_allowed());
        assert_eq!(window.count, 2);
    }

    #[test]
    fn window_resets_exactly_at_length() {
        let start = Instant::now();
        let w = Duration::from_secs(60);
        let mut window = RateWindow::new(start);
        window.try_admit(start, 1, w);

        let just_before = start + Duration::from_secs(59);
        assert!(!window.try_admit(just_before, 1, w).is_allowed());

        let at_edge = start + w;
        assert!(window.try_admit(at_edge, 1, w).is_allowed());
        assert_eq!(window.window_start, at_edge);
        assert_eq!(window.count, 1);
    }

    #[test]
    fn throttle_reports_time_until_reset() {
        let start = Instant::now();
        let w = Duration::from_secs(60);
        let mut window = RateWindow::new(start);
        window.try_admit(start, 1, w);
        let later = start + Duration::from_secs(45);
        assert_eq!(
            window.try_admit(later, 1, w),
            Admission::Throttled {
                scope: LimitScope::Route,
                retry_after: Duration::from_secs(15),
            }
        );
    }

    #[test]
    fn route_limit_falls_back_to_default() {
        let limiter = RateLimiter::new(
            RateLimitConfig::empty()
                .route("/api/metrics", 30)
                .default_limit(Some(5)),
        );
        assert_eq!(limiter.limit_for("/api/metrics"), Some(30));
        assert_eq!(limiter.limit_for("/other"), Some(5));

        let unlimited = RateLimiter::new(RateLimitConfig::empty());
        assert_eq!(unlimited.limit_for("/other"), None);
    }

    #[test]
    fn default_config_matches_dashboard_routes() {
        let config = RateLimitConfig::default();
        assert_eq!(config.routes.get("/analisar_logs"), Some(&10));
        assert_eq!(config.routes.get("/classificar_solucao"), Some(&50));
        assert_eq!(config.global_limit, Some(1_000));
        assert_eq!(config.window_duration(), Duration::from_secs(60));
    }
}
