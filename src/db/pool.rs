//! Async connection pool.
//!
//! # Design
//!
//! - **Idle queue + semaphore**: idle connections sit in a `VecDeque` behind a
//!   `parking_lot` mutex; a semaphore holds one permit per queued connection,
//!   so waiting for a connection is waiting for a permit (bounded by the
//!   acquire timeout).
//! - **Structural lock**: lazy initialisation and `close_all` serialise on a
//!   `tokio::sync::Mutex`, so concurrent first acquires never initialise
//!   twice and close never races initialisation.
//! - **Closed flag under the queue lock**: `release` checks the flag and
//!   pushes in one critical section, so a connection released during
//!   `close_all` is closed by exactly one side.
//! - **Validation**: a dequeued connection is probed with `version`; a dead
//!   one is closed and a freshly created, probed replacement is returned
//!   directly. Released connections are probed the same way before being
//!   queued again.
//! - **Cancellation**: while a probe is in flight the connection sits in a
//!   [`PooledConnection`], so dropping the acquiring or releasing future
//!   hands it back instead of losing it. A guard dropped with a transaction
//!   open rolls it back before the connection is queued again.
//!
//! # Accounting
//!
//! `open` counts connections owned by the pool, queued or checked out. It
//! never exceeds `pool_size` except transiently while an acquire replaces a
//! dead connection.

use crate::config::DatabaseConfig;
use crate::db::connection::{AsyncConnection, AsyncConnector, establish_async};
use crate::db::executor::AsyncExecutor;
use crate::db::retry::RetryExecutor;
use crate::db::transaction::AsyncTransaction;
use crate::error::{DbError, DbResult};
use crate::models::PoolStats;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Semaphore;
use tracing::{Span, debug, error, info, info_span, warn};

const CREATE_FAILED_HINT: &str = "Verify the server is running and the URL is correct";

struct IdleQueue<C> {
    connections: VecDeque<C>,
    closed: bool,
}

struct PoolInner<K: AsyncConnector> {
    connector: K,
    config: DatabaseConfig,
    retry: RetryExecutor,
    idle: Mutex<IdleQueue<K::Connection>>,
    permits: Semaphore,
    structural: tokio::sync::Mutex<()>,
    initialized: AtomicBool,
    open: AtomicUsize,
    span: Span,
}

/// Pool of async connections created by a connector.
///
/// Cloning is cheap and yields a handle to the same pool.
pub struct AsyncConnectionPool<K: AsyncConnector> {
    inner: Arc<PoolInner<K>>,
}

impl<K: AsyncConnector> Clone for AsyncConnectionPool<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: AsyncConnector> std::fmt::Debug for AsyncConnectionPool<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncConnectionPool")
            .field("endpoint", &self.inner.config.endpoint.masked())
            .field("stats", &self.stats())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<K: AsyncConnector> AsyncConnectionPool<K> {
    /// Create a pool. No connection is opened until the first acquire.
    pub fn new(connector: K, config: DatabaseConfig) -> DbResult<Self> {
        config.validate()?;
        let span = info_span!(
            "pool",
            component = "async_pool",
            endpoint = %config.endpoint.masked(),
        );
        let retry = RetryExecutor::new(config.retry_policy()).with_span(span.clone());
        Ok(Self {
            inner: Arc::new(PoolInner {
                connector,
                retry,
                idle: Mutex::new(IdleQueue {
                    connections: VecDeque::with_capacity(config.pool_size),
                    closed: false,
                }),
                permits: Semaphore::new(0),
                structural: tokio::sync::Mutex::new(()),
                initialized: AtomicBool::new(false),
                open: AtomicUsize::new(0),
                config,
                span,
            }),
        })
    }

    /// Log under `span` instead of the default component span.
    ///
    /// Only affects a pool that has not been cloned yet.
    pub fn with_span(mut self, span: Span) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.retry = inner.retry.clone().with_span(span.clone());
            inner.span = span;
        }
        self
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    pub fn pool_size(&self) -> usize {
        self.inner.config.pool_size
    }

    /// Connections currently waiting in the queue.
    pub fn available_connections(&self) -> usize {
        self.inner.idle.lock().connections.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.idle.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pool_size: self.pool_size(),
            available: self.available_connections(),
            open: self.inner.open.load(Ordering::SeqCst),
        }
    }

    /// Check a connection out of the pool.
    ///
    /// Initialises the pool on first use, then waits up to the acquire
    /// timeout for a queued connection. The caller must hand the connection
    /// back with [`release`](Self::release).
    pub async fn acquire(&self) -> DbResult<K::Connection> {
        if self.is_closed() {
            return Err(DbError::PoolClosed);
        }
        self.ensure_initialized().await?;

        let timeout = self.inner.config.acquire_timeout;
        let permit = match tokio::time::timeout(timeout, self.inner.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(DbError::PoolClosed),
            Err(_) => {
                warn!(
                    parent: &self.inner.span,
                    timeout_ms = timeout.as_millis() as u64,
                    "Timed out waiting for an available connection"
                );
                return Err(DbError::timeout(
                    "acquire connection",
                    timeout.as_millis() as u64,
                ));
            }
        };
        // The permit stands for the connection popped below.
        permit.forget();

        let popped = {
            let mut idle = self.inner.idle.lock();
            if idle.closed {
                return Err(DbError::PoolClosed);
            }
            idle.connections.pop_front()
        };
        let Some(connection) = popped else {
            return Err(DbError::internal("idle queue is out of sync with its permits"));
        };

        let (probe, connection) = self.probe(connection).await?;
        match probe {
            Ok(_) => Ok(connection),
            Err(err) => {
                warn!(
                    parent: &self.inner.span,
                    error = %err,
                    "Connection validation failed, creating a replacement"
                );
                self.discard(connection).await;
                self.create_validated().await
            }
        }
    }

    /// Return a connection to the pool.
    ///
    /// A live connection is queued again. A dead one is closed and, if the
    /// queue has room, replaced; a failed replacement only shrinks the pool.
    /// On a closed pool the connection is closed.
    pub async fn release(&self, connection: K::Connection) {
        if self.is_closed() {
            self.discard(connection).await;
            return;
        }

        let Ok((probe, connection)) = self.probe(connection).await else {
            return;
        };
        match probe {
            Ok(_) => self.push_idle(connection).await,
            Err(err) => {
                warn!(
                    parent: &self.inner.span,
                    error = %err,
                    "Released connection is invalid, discarding"
                );
                self.replace(connection).await;
            }
        }
    }

    /// Check out a connection wrapped in a guard that releases it on drop.
    pub async fn connection(&self) -> DbResult<PooledConnection<K>> {
        let connection = self.acquire().await?;
        Ok(self.guard(connection))
    }

    /// Acquire a connection, run `operation` on it with retry, and release it
    /// on every exit path.
    pub async fn execute_with_connection<T, F>(&self, operation: F) -> DbResult<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut K::Connection) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        let mut guard = self.connection().await?;
        let result = self.inner.retry.execute(&mut *guard, operation).await;
        guard.release().await;
        result
    }

    /// Run `body` in a transaction on one pooled connection.
    ///
    /// The connection is released after the commit or rollback.
    pub async fn transaction<T, F>(&self, body: F) -> DbResult<T>
    where
        T: Send,
        F: for<'a, 't> FnOnce(
            &'t mut AsyncTransaction<'a, K::Connection>,
        ) -> BoxFuture<'t, DbResult<T>>,
    {
        let mut guard = self.connection().await?;
        // Cleared only once the scope has committed or rolled back.
        guard.in_transaction = true;
        let result = match AsyncTransaction::begin_with_span(&mut *guard, self.inner.span.clone())
            .await
        {
            Ok(mut tx) => {
                let outcome = body(&mut tx).await;
                tx.finish(outcome).await
            }
            Err(err) => Err(err),
        };
        guard.in_transaction = false;
        guard.release().await;
        result
    }

    /// Close the pool and every queued connection.
    ///
    /// Checked-out connections are closed when they are released. Close
    /// failures are logged and do not stop the drain. Calling this again is a
    /// no-op.
    pub async fn close_all(&self) {
        let _structural = self.inner.structural.lock().await;
        let drained: Vec<_> = {
            let mut idle = self.inner.idle.lock();
            if idle.closed {
                return;
            }
            idle.closed = true;
            idle.connections.drain(..).collect()
        };
        self.inner.permits.close();

        let count = drained.len();
        for connection in drained {
            self.discard(connection).await;
        }
        info!(
            parent: &self.inner.span,
            closed = count,
            "Connection pool closed"
        );
    }

    async fn ensure_initialized(&self) -> DbResult<()> {
        if self.inner.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        let _structural = self.inner.structural.lock().await;
        if self.inner.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.is_closed() {
            return Err(DbError::PoolClosed);
        }

        let pool_size = self.pool_size();
        info!(
            parent: &self.inner.span,
            pool_size,
            "Initializing connection pool"
        );
        let mut created = 0usize;
        let mut last_error = None;
        for _ in 0..pool_size {
            match self.create().await {
                Ok(connection) => {
                    self.push_idle(connection).await;
                    created += 1;
                }
                Err(err) => {
                    error!(
                        parent: &self.inner.span,
                        error = %err,
                        "Failed to initialize connection"
                    );
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(err) if created == 0 => Err(DbError::connection_caused_by(
                "Failed to initialize connection pool",
                CREATE_FAILED_HINT,
                err,
            )),
            _ => {
                if created < pool_size {
                    warn!(
                        parent: &self.inner.span,
                        created,
                        pool_size,
                        "Connection pool initialized with fewer connections"
                    );
                }
                self.inner.initialized.store(true, Ordering::Release);
                Ok(())
            }
        }
    }

    async fn create(&self) -> DbResult<K::Connection> {
        let connection = establish_async(&self.inner.connector, &self.inner.config)
            .await
            .map_err(|err| {
                DbError::connection_caused_by("Failed to create connection", CREATE_FAILED_HINT, err)
            })?;
        self.inner.open.fetch_add(1, Ordering::SeqCst);
        Ok(connection)
    }

    /// Create a connection and probe it once before handing it out.
    async fn create_validated(&self) -> DbResult<K::Connection> {
        let connection = self.create().await?;
        let (probe, connection) = self.probe(connection).await?;
        match probe {
            Ok(_) => {
                debug!(parent: &self.inner.span, "Replacement connection created");
                Ok(connection)
            }
            Err(err) => {
                self.discard(connection).await;
                Err(DbError::connection_caused_by(
                    "Replacement connection failed validation",
                    CREATE_FAILED_HINT,
                    err,
                ))
            }
        }
    }

    /// Queue a connection, or close it if the pool closed or the queue is full.
    async fn push_idle(&self, connection: K::Connection) {
        let rejected = {
            let mut idle = self.inner.idle.lock();
            if idle.closed || idle.connections.len() >= self.pool_size() {
                Some(connection)
            } else {
                idle.connections.push_back(connection);
                None
            }
        };
        match rejected {
            Some(connection) => self.discard(connection).await,
            None => self.inner.permits.add_permits(1),
        }
    }

    fn guard(&self, connection: K::Connection) -> PooledConnection<K> {
        PooledConnection {
            connection: Some(connection),
            pool: self.clone(),
            in_transaction: false,
        }
    }

    /// Run the liveness probe with the connection held by a guard, so a
    /// dropped caller returns it to the pool.
    async fn probe(
        &self,
        connection: K::Connection,
    ) -> DbResult<(DbResult<String>, K::Connection)> {
        let mut guard = self.guard(connection);
        let probe = guard.version().await;
        let connection = guard
            .detach()
            .ok_or_else(|| DbError::internal("probed connection missing from its guard"))?;
        Ok((probe, connection))
    }

    /// Close a dead connection and queue a fresh one if there is room. A
    /// failed replacement only shrinks the pool.
    async fn replace(&self, connection: K::Connection) {
        self.discard(connection).await;

        let pool_size = self.pool_size();
        let has_room = self.available_connections() < pool_size
            && self.inner.open.load(Ordering::SeqCst) < pool_size;
        if !has_room || self.is_closed() {
            return;
        }
        match self.create_validated().await {
            Ok(replacement) => self.push_idle(replacement).await,
            Err(err) => error!(
                parent: &self.inner.span,
                error = %err,
                "Failed to create replacement connection"
            ),
        }
    }

    /// Roll back the transaction an abandoned scope left open, then release
    /// the connection. One that cannot roll back is replaced.
    async fn release_open_transaction(&self, connection: K::Connection) {
        if self.is_closed() {
            self.discard(connection).await;
            return;
        }

        let mut guard = self.guard(connection);
        guard.in_transaction = true;
        let rolled_back = guard.rollback_transaction().await;
        let Some(connection) = guard.detach() else {
            return;
        };
        match rolled_back {
            Ok(()) => {
                warn!(
                    parent: &self.inner.span,
                    "Rolled back a transaction left open by an abandoned scope"
                );
                self.release(connection).await;
            }
            Err(err) => {
                error!(
                    parent: &self.inner.span,
                    error = %err,
                    "Rollback of abandoned transaction failed, replacing connection"
                );
                self.replace(connection).await;
            }
        }
    }

    /// Close a connection the pool no longer owns. Never fails.
    async fn discard(&self, mut connection: K::Connection) {
        self.forget_one();
        if let Err(err) = connection.close().await {
            warn!(parent: &self.inner.span, error = %err, "Error closing connection");
        }
    }

    fn forget_one(&self) {
        let _ = self
            .inner
            .open
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

#[async_trait]
impl<K: AsyncConnector> AsyncExecutor for AsyncConnectionPool<K> {
    type Connection = K::Connection;

    async fn execute_with_retry<T, F>(&self, operation: F) -> DbResult<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut K::Connection) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        self.execute_with_connection(operation).await
    }
}

/// A connection checked out of an [`AsyncConnectionPool`].
///
/// Prefer [`release`](Self::release). Dropping the guard spawns the release
/// on the current tokio runtime; without a runtime the connection is
/// dropped without being closed.
pub struct PooledConnection<K: AsyncConnector> {
    connection: Option<K::Connection>,
    pool: AsyncConnectionPool<K>,
    in_transaction: bool,
}

impl<K: AsyncConnector> PooledConnection<K> {
    /// Hand the connection back to the pool.
    pub async fn release(mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        if self.in_transaction {
            self.pool.release_open_transaction(connection).await;
        } else {
            self.pool.release(connection).await;
        }
    }

    /// Take the connection out of the guard. The caller becomes responsible
    /// for passing it to [`AsyncConnectionPool::release`].
    pub fn detach(mut self) -> Option<K::Connection> {
        self.connection.take()
    }
}

impl<K: AsyncConnector> Deref for PooledConnection<K> {
    type Target = K::Connection;

    fn deref(&self) -> &Self::Target {
        self.connection.as_ref().expect("connection taken")
    }
}

impl<K: AsyncConnector> DerefMut for PooledConnection<K> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection.as_mut().expect("connection taken")
    }
}

impl<K: AsyncConnector> Drop for PooledConnection<K> {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        let pool = self.pool.clone();
        let in_transaction = self.in_transaction;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if in_transaction {
                        pool.release_open_transaction(connection).await;
                    } else {
                        pool.release(connection).await;
                    }
                    debug!(
                        parent: &pool.inner.span,
                        "Connection released via Drop - consider using explicit release()"
                    );
                });
            }
            Err(_) => {
                warn!(
                    parent: &pool.inner.span,
                    "Pooled connection dropped outside a runtime, closing skipped"
                );
                drop(connection);
                pool.forget_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockConnector;
    use std::time::Duration;

    fn config(pool_size: usize) -> DatabaseConfig {
        DatabaseConfig::new("ws://localhost:8000/rpc", "app", "main")
            .unwrap()
            .with_pool_size(pool_size)
            .with_max_retries(2)
            .with_retry_base_delay(Duration::from_millis(10))
            .with_acquire_timeout(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_lazy_initialization() {
        let connector = MockConnector::new();
        let pool = AsyncConnectionPool::new(connector.clone(), config(3)).unwrap();
        assert_eq!(connector.connect_count(), 0);

        let conn = pool.acquire().await.unwrap();
        assert_eq!(connector.connect_count(), 3);
        assert_eq!(pool.available_connections(), 2);
        pool.release(conn).await;
        assert_eq!(pool.available_connections(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_first_acquire_initializes_once() {
        let connector = MockConnector::new();
        let pool = AsyncConnectionPool::new(connector.clone(), config(4)).unwrap();

        let (a, b) = tokio::join!(pool.acquire(), pool.acquire());
        assert_eq!(connector.connect_count(), 4);
        pool.release(a.unwrap()).await;
        pool.release(b.unwrap()).await;
        assert_eq!(pool.stats().open, 4);
    }

    #[tokio::test]
    async fn test_all_connections_failing_is_connection_error() {
        let connector = MockConnector::new();
        connector.fail_next_connects(2);
        let pool = AsyncConnectionPool::new(connector.clone(), config(2)).unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, DbError::Connection { .. }));

        // Initialization is retried once the server is back.
        let conn = pool.acquire().await.unwrap();
        pool.release(conn).await;
        assert_eq!(pool.available_connections(), 2);
    }

    #[tokio::test]
    async fn test_acquire_on_closed_pool() {
        let pool = AsyncConnectionPool::new(MockConnector::new(), config(1)).unwrap();
        pool.close_all().await;
        assert!(matches!(pool.acquire().await, Err(DbError::PoolClosed)));
    }

    #[tokio::test]
    async fn test_dead_connection_replaced_on_acquire() {
        let connector = MockConnector::new();
        let pool = AsyncConnectionPool::new(connector.clone(), config(1)).unwrap();
        let conn = pool.acquire().await.unwrap();
        let first = conn.id();
        pool.release(conn).await;

        connector.controls(first).unwrap().set_alive(false);
        let conn = pool.acquire().await.unwrap();
        assert_ne!(conn.id(), first);
        assert_eq!(connector.close_count(first), 1);
        pool.release(conn).await;
        assert_eq!(pool.stats().open, 1);
    }

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let connector = MockConnector::new();
        let pool = AsyncConnectionPool::new(connector, config(1)).unwrap();
        {
            let _guard = pool.connection().await.unwrap();
            assert_eq!(pool.available_connections(), 0);
        }
        // The release runs on a spawned task.
        let conn = pool.acquire().await.unwrap();
        pool.release(conn).await;
        assert_eq!(pool.available_connections(), 1);
    }

    #[tokio::test]
    async fn test_release_after_close_closes_connection() {
        let connector = MockConnector::new();
        let pool = AsyncConnectionPool::new(connector.clone(), config(2)).unwrap();
        let conn = pool.acquire().await.unwrap();
        let id = conn.id();

        pool.close_all().await;
        pool.release(conn).await;
        assert_eq!(connector.close_count(id), 1);
        assert_eq!(connector.max_close_count(), 1);
        assert_eq!(pool.stats().open, 0);
    }
}
