//! Caching subsystem.
//!
//! [`CacheStore`] is a time-bounded, capacity-bounded key/value cache for
//! results that are expensive to recompute (AI diagnoses, dashboard metric
//! aggregates). Keys are caller-supplied fingerprints of the computation's
//! inputs; this module never derives them.
//!
//! # Semantics
//!
//! - An entry is readable only while `now < expires_at`. Expiry is checked
//!   lazily on every read; an optional periodic sweep (owned by
//!   [`Resilience`](crate::Resilience)) only reclaims memory earlier.
//! - Inserting a new key into a full store evicts the least-recently-used
//!   entry. Reads count as use; overwrites replace the entry wholesale.
//! - Entries last used at the same instant are evicted oldest-created
//!   first, then in insertion order, so two entries never tie.
//!
//! Eviction order must be exact LRU, which moka's TinyLFU admission policy
//! does not provide, so the store keeps its own recency index.

mod store;

pub use store::{CacheStats, CacheStore, EntryInfo};

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a [`CacheStore`].
///
/// ```rust
/// # use resilio::CacheConfig;
/// # use std::time::Duration;
/// let config = CacheConfig::new()
///     .max_entries(200)
///     .ttl(Duration::from_secs(600));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of live entries. Default: 100.
    pub max_entries: usize,
    /// Time-to-live for each entry, in seconds. Default: 300.
    pub ttl_secs: u64,
    /// Age after which a live entry is reported as stale. Default: 60.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_after_secs: Option<u64>,
    /// Interval of the background expiry sweep; 0 disables it. Default: 30.
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 100,
            ttl_secs: 300,
            stale_after_secs: Some(60),
            sweep_interval_secs: 30,
        }
    }
}

impl CacheConfig {
    /// Create a new config with the dashboard defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of entries.
    pub fn max_entries(mut self, n: usize) -> Self {
        self.max_entries = n;
        self
    }

    /// Set the time-to-live (whole seconds; sub-second parts are dropped).
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl_secs = ttl.as_secs();
        self
    }

    /// Set the staleness threshold, or `None` to never report staleness.
    pub fn stale_after(mut self, age: Option<Duration>) -> Self {
        self.stale_after_secs = age.map(|d| d.as_secs());
        self
    }

    /// Set the sweep interval; `Duration::ZERO` disables the sweep.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_secs = interval.as_secs();
        self
    }

    pub fn ttl_duration(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn stale_after_duration(&self) -> Option<Duration> {
        self.stale_after_secs.map(Duration::from_secs)
    }

    /// `None` when the background sweep is disabled.
    pub fn sweep_interval_duration(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}
