//! Bounded pool of reusable database handles.
//!
//! The driver itself is opaque: a [`ConnectionManager`] knows how to open,
//! validate and close one connection, and [`Pool`] does the bookkeeping.
//!
//! # Capacity
//!
//! A `tokio::sync::Semaphore` with `max_size` permits gates checkout. Every
//! checked-out [`PooledConnection`] owns one permit until it is back in the
//! idle list (or discarded), so `in_use + idle <= max_size` holds at all
//! times.
//!
//! # Release
//!
//! [`PooledConnection::release`] health-checks the handle: healthy handles
//! go back to the idle list, broken ones are closed and replaced by a fresh
//! connection when the idle list is below `min_idle`. A guard dropped
//! without `release` (early return, panic, cancelled future) is checked in
//! by a spawned task, so capacity never leaks. [`Pool::with_connection`] is
//! the scoped form and should be preferred.

mod connection;

pub use connection::PooledConnection;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::stats::{StatsEvent, StatsRegistry};
use crate::{ResilioError, Result};

/// Driver adapter for one kind of database connection.
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    /// The driver's connection handle.
    type Connection: Send + 'static;

    /// Open a new connection.
    async fn connect(&self) -> Result<Self::Connection>;

    /// Cheap liveness probe (e.g. `SELECT 1`).
    async fn is_valid(&self, conn: &mut Self::Connection) -> bool;

    /// Close a connection the pool no longer wants.
    async fn close(&self, conn: Self::Connection) {
        drop(conn);
    }
}

/// Lifecycle of a pooled handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleState {
    Idle,
    InUse,
    /// Failed its health check; discarded, never handed out again.
    Broken,
}

/// Pool sizing and timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle handles kept open eagerly. Default: 1.
    pub min_idle: usize,
    /// Hard cap on open handles. Default: 10.
    pub max_size: usize,
    /// Default wait for [`Pool::get`] and scoped acquisition. Default: 5000 ms.
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 1,
            max_size: 10,
            acquire_timeout_ms: 5_000,
        }
    }
}

impl PoolConfig {
    /// Create a config with the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how many idle handles to keep open.
    pub fn min_idle(mut self, n: usize) -> Self {
        self.min_idle = n;
        self
    }

    /// Set the cap on open handles.
    pub fn max_size(mut self, n: usize) -> Self {
        self.max_size = n;
        self
    }

    /// Set the default wait for a free handle.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn acquire_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Point-in-time view of pool occupancy and counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    #[serde(rename = "active")]
    pub in_use: usize,
    pub idle: usize,
    pub max_size: usize,
    pub min_idle: usize,
    pub timeouts: u64,
    pub created: u64,
    pub broken: u64,
}

struct IdleConnection<C> {
    id: u64,
    conn: C,
}

pub(crate) struct Shared<M: ConnectionManager> {
    manager: M,
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConnection<M::Connection>>>,
    closed: AtomicBool,
    next_id: AtomicU64,
    timeouts: AtomicU64,
    created: AtomicU64,
    broken: AtomicU64,
    stats: Option<Arc<StatsRegistry>>,
}

/// Bounded connection pool. Cloning is cheap and shares the same pool.
pub struct Pool<M: ConnectionManager> {
    shared: Arc<Shared<M>>,
}

impl<M: ConnectionManager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: ConnectionManager> fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool").field("status", &self.status()).finish()
    }
}

impl<M: ConnectionManager> Pool<M> {
    /// Create an empty pool. No connection is opened until
    /// [`warm_up`](Self::warm_up) or the first acquisition.
    ///
    /// A `max_size` of 0 is treated as 1.
    pub fn new(manager: M, config: PoolConfig) -> Self {
        Self::build(manager, config, None)
    }

    /// Like [`new`](Self::new), forwarding events to a shared registry.
    pub fn with_stats(manager: M, config: PoolConfig, stats: Arc<StatsRegistry>) -> Self {
        Self::build(manager, config, Some(stats))
    }

    fn build(manager: M, config: PoolConfig, stats: Option<Arc<StatsRegistry>>) -> Self {
        let config = PoolConfig {
            max_size: config.max_size.max(1),
            min_idle: config.min_idle.min(config.max_size.max(1)),
            ..config
        };
        Self {
            shared: Arc::new(Shared {
                manager,
                semaphore: Arc::new(Semaphore::new(config.max_size)),
                config,
                idle: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
                timeouts: AtomicU64::new(0),
                created: AtomicU64::new(0),
                broken: AtomicU64::new(0),
                stats,
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// The driver adapter this pool was built with.
    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    /// Open idle connections until `min_idle` is reached.
    ///
    /// Returns the number of connections opened. Stops at the first
    /// connection error and returns it.
    pub async fn warm_up(&self) -> Result<usize> {
        let shared = &self.shared;
        let mut opened = 0;
        while shared.idle.lock().len() < shared.config.min_idle {
            let Ok(permit) = Arc::clone(&shared.semaphore).try_acquire_owned() else {
                break;
            };
            // The new handle becomes idle once our permit is returned.
            if shared.idle.lock().len() + shared.in_use() > shared.config.max_size {
                break;
            }
            let (id, conn) = shared.open().await?;
            shared.idle.lock().push(IdleConnection { id, conn });
            drop(permit);
            opened += 1;
        }
        shared.publish_gauges();
        if opened > 0 {
            info!(opened, min_idle = shared.config.min_idle, "connection pool warmed up");
        }
        Ok(opened)
    }

    /// Check out a connection, waiting at most `timeout` for capacity.
    ///
    /// Fails with [`ResilioError::PoolExhausted`] on timeout and
    /// [`ResilioError::PoolClosed`] after [`close`](Self::close). Dropping the
    /// returned future before it completes never leaks a handle.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection<M>> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(ResilioError::PoolClosed);
        }
        match tokio::time::timeout(timeout, Arc::clone(&self.shared).checkout()).await {
            Ok(result) => result,
            Err(_) => {
                self.shared.timeouts.fetch_add(1, Ordering::Relaxed);
                self.shared.emit(StatsEvent::PoolTimeout);
                warn!(
                    waited_ms = timeout.as_millis() as u64,
                    max_size = self.shared.config.max_size,
                    "connection pool exhausted"
                );
                Err(ResilioError::PoolExhausted { waited: timeout })
            }
        }
    }

    /// Check out a connection with the configured acquire timeout.
    pub async fn get(&self) -> Result<PooledConnection<M>> {
        self.acquire(self.shared.config.acquire_timeout_duration())
            .await
    }

    /// Return a connection to the pool. Equivalent to
    /// [`PooledConnection::release`].
    pub async fn release(&self, conn: PooledConnection<M>) {
        conn.release().await;
    }

    /// Run `f` with a checked-out connection, releasing it afterwards
    /// whatever `f` returns.
    ///
    /// ```rust,ignore
    /// let rows = pool
    ///     .with_connection(|conn| Box::pin(async move { conn.query("SELECT 1").await }))
    ///     .await?;
    /// ```
    pub async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut M::Connection) -> BoxFuture<'c, Result<T>>,
    {
        let mut conn = self.get().await?;
        let result = f(&mut *conn).await;
        conn.release().await;
        result
    }

    /// Acquire one handle, probe it, and release it.
    pub async fn health_check(&self) -> bool {
        match self.get().await {
            Ok(mut conn) => {
                let healthy = self.shared.manager.is_valid(&mut *conn).await;
                conn.release().await;
                if !healthy {
                    warn!("database health check failed");
                }
                healthy
            }
            Err(e) => {
                warn!(error = %e, "database health check could not acquire a connection");
                false
            }
        }
    }

    /// Stop handing out connections and close every idle one.
    ///
    /// Connections still checked out are closed when they come back.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.semaphore.close();
        let drained = std::mem::take(&mut *self.shared.idle.lock());
        let count = drained.len();
        for idle in drained {
            self.shared.manager.close(idle.conn).await;
        }
        self.shared.publish_gauges();
        info!(closed = count, "connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn status(&self) -> PoolStatus {
        let shared = &self.shared;
        PoolStatus {
            in_use: shared.in_use(),
            idle: shared.idle.lock().len(),
            max_size: shared.config.max_size,
            min_idle: shared.config.min_idle,
            timeouts: shared.timeouts.load(Ordering::Relaxed),
            created: shared.created.load(Ordering::Relaxed),
            broken: shared.broken.load(Ordering::Relaxed),
        }
    }
}

impl<M: ConnectionManager> Shared<M> {
    fn in_use(&self) -> usize {
        self.config
            .max_size
            .saturating_sub(self.semaphore.available_permits())
    }

    async fn checkout(self: Arc<Self>) -> Result<PooledConnection<M>> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| ResilioError::PoolClosed)?;
        let reused = self.idle.lock().pop();
        let (id, conn) = match reused {
            Some(idle) => (idle.id, idle.conn),
            None => self.open().await?,
        };
        debug!(connection_id = id, state = ?HandleState::InUse, "connection checked out");
        self.emit(StatsEvent::PoolAcquired);
        self.publish_gauges();
        Ok(PooledConnection::new(id, conn, self, permit))
    }

    async fn open(&self) -> Result<(u64, M::Connection)> {
        let conn = self.manager.connect().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.created.fetch_add(1, Ordering::Relaxed);
        self.emit(StatsEvent::PoolHandleCreated);
        debug!(connection_id = id, "opened connection");
        Ok((id, conn))
    }

    /// Health-check a returned handle and put it back (or replace it).
    ///
    /// The permit is held until the handle is idle or discarded.
    pub(crate) async fn check_in(
        &self,
        id: u64,
        mut conn: M::Connection,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        if self.closed.load(Ordering::Acquire) {
            self.manager.close(conn).await;
        } else if self.manager.is_valid(&mut conn).await {
            self.idle.lock().push(IdleConnection { id, conn });
            debug!(connection_id = id, state = ?HandleState::Idle, "connection checked in");
        } else {
            warn!(connection_id = id, state = ?HandleState::Broken, "discarding broken connection");
            self.broken.fetch_add(1, Ordering::Relaxed);
            self.emit(StatsEvent::PoolHandleBroken);
            self.manager.close(conn).await;
            self.replace_broken().await;
        }
        drop(permit);
        self.publish_gauges();
    }

    /// Put a handle back without probing it. Used when no runtime is
    /// available to run the health check.
    pub(crate) fn return_unchecked(
        &self,
        id: u64,
        conn: M::Connection,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        if !self.closed.load(Ordering::Acquire) {
            self.idle.lock().push(IdleConnection { id, conn });
        }
        drop(permit);
        self.publish_gauges();
    }

    /// Open one replacement using the broken handle's slot, if the idle
    /// list has fallen below `min_idle`.
    async fn replace_broken(&self) {
        if self.idle.lock().len() >= self.config.min_idle {
            return;
        }
        match self.open().await {
            Ok((id, conn)) => self.idle.lock().push(IdleConnection { id, conn }),
            Err(e) => warn!(error = %e, "could not replace broken connection"),
        }
    }

    fn publish_gauges(&self) {
        let idle = self.idle.lock().len();
        self.emit(StatsEvent::PoolGauge {
            in_use: self.in_use(),
            idle,
        });
    }

    fn emit(&self, event: StatsEvent<'_>) {
        if let Some(stats) = &self.stats {
            stats.record(event);
        }
    }
}
