use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tokio::sync::OwnedSemaphorePermit;

use super::{ConnectionManager, Shared};

/// A connection checked out of a [`Pool`](super::Pool).
///
/// Dereferences to the driver connection. Hand it back with
/// [`release`](Self::release); `release` consumes the guard, so a handle
/// can never be returned twice. Dropping the guard instead schedules the
/// same check-in on the current tokio runtime.
pub struct PooledConnection<M: ConnectionManager> {
    id: u64,
    conn: Option<M::Connection>,
    shared: Arc<Shared<M>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl<M: ConnectionManager> PooledConnection<M> {
    pub(super) fn new(
        id: u64,
        conn: M::Connection,
        shared: Arc<Shared<M>>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            id,
            conn: Some(conn),
            shared,
            permit: Some(permit),
        }
    }

    /// Pool-assigned identifier, stable across reuse of the same handle.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Health-check the connection and return it to the pool.
    pub async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.check_in(self.id, conn, self.permit.take()).await;
        }
    }
}

impl<M: ConnectionManager> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .expect("connection is present until released")
    }
}

impl<M: ConnectionManager> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_mut()
            .expect("connection is present until released")
    }
}

impl<M: ConnectionManager> fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .finish()
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let id = self.id;
        let permit = self.permit.take();
        let shared = Arc::clone(&self.shared);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    shared.check_in(id, conn, permit).await;
                });
            }
            Err(_) => shared.return_unchecked(id, conn, permit),
        }
    }
}
