//! Blocking connection pool.
//!
//! Same lifecycle as [`AsyncConnectionPool`](super::AsyncConnectionPool),
//! built on OS-thread primitives: idle connections travel through a bounded
//! crossbeam channel of capacity `pool_size`, and the structural state
//! (initialised, closed) lives behind a `parking_lot` mutex. Waiting for a
//! connection blocks the calling thread until one is released, the acquire
//! timeout passes, or the pool is closed.

use crate::config::DatabaseConfig;
use crate::db::connection::{SyncConnection, SyncConnector, establish_sync};
use crate::db::executor::SyncExecutor;
use crate::db::retry::RetryExecutor;
use crate::db::transaction::SyncTransaction;
use crate::error::{DbError, DbResult};
use crate::models::PoolStats;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{Span, debug, error, info, info_span, warn};

const CREATE_FAILED_HINT: &str = "Verify the server is running and the URL is correct";

#[derive(Debug, Default)]
struct PoolState {
    initialized: bool,
    closed: bool,
    /// Dropped on close to wake blocked acquirers.
    shutdown: Option<Sender<()>>,
}

struct SyncPoolInner<K: SyncConnector> {
    connector: K,
    config: DatabaseConfig,
    retry: RetryExecutor,
    sender: Sender<K::Connection>,
    receiver: Receiver<K::Connection>,
    shutdown: Receiver<()>,
    state: Mutex<PoolState>,
    open: AtomicUsize,
    span: Span,
}

/// Pool of blocking connections created by a connector.
///
/// Cloning is cheap and yields a handle to the same pool.
pub struct SyncConnectionPool<K: SyncConnector> {
    inner: Arc<SyncPoolInner<K>>,
}

impl<K: SyncConnector> Clone for SyncConnectionPool<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: SyncConnector> std::fmt::Debug for SyncConnectionPool<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConnectionPool")
            .field("endpoint", &self.inner.config.endpoint.masked())
            .field("stats", &self.stats())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<K: SyncConnector> SyncConnectionPool<K> {
    /// Create a pool. No connection is opened until the first acquire.
    pub fn new(connector: K, config: DatabaseConfig) -> DbResult<Self> {
        config.validate()?;
        let span = info_span!(
            "pool",
            component = "sync_pool",
            endpoint = %config.endpoint.masked(),
        );
        let (sender, receiver) = channel::bounded(config.pool_size);
        let (shutdown_tx, shutdown_rx) = channel::bounded(0);
        Ok(Self {
            inner: Arc::new(SyncPoolInner {
                connector,
                retry: RetryExecutor::new(config.retry_policy()).with_span(span.clone()),
                sender,
                receiver,
                shutdown: shutdown_rx,
                state: Mutex::new(PoolState {
                    shutdown: Some(shutdown_tx),
                    ..PoolState::default()
                }),
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

    pub fn available_connections(&self) -> usize {
        self.inner.receiver.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pool_size: self.pool_size(),
            available: self.available_connections(),
            open: self.inner.open.load(Ordering::SeqCst),
        }
    }

    /// Check a connection out of the pool, blocking up to the acquire
    /// timeout. The caller must hand it back with [`release`](Self::release).
    pub fn acquire(&self) -> DbResult<K::Connection> {
        if self.is_closed() {
            return Err(DbError::PoolClosed);
        }
        self.ensure_initialized()?;

        let timeout = self.inner.config.acquire_timeout;
        let mut connection = channel::select! {
            recv(self.inner.receiver) -> msg => msg.map_err(|_| DbError::PoolClosed)?,
            recv(self.inner.shutdown) -> _ => return Err(DbError::PoolClosed),
            default(timeout) => {
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

        match connection.version() {
            Ok(_) => Ok(connection),
            Err(err) => {
                warn!(
                    parent: &self.inner.span,
                    error = %err,
                    "Connection validation failed, creating a replacement"
                );
                self.discard(connection);
                self.create_validated()
            }
        }
    }

    /// Return a connection to the pool.
    ///
    /// A live connection is queued again. A dead one is closed and, if the
    /// queue has room, replaced; a failed replacement only shrinks the pool.
    /// On a closed pool the connection is closed.
    pub fn release(&self, mut connection: K::Connection) {
        if self.is_closed() {
            self.discard(connection);
            return;
        }

        match connection.version() {
            Ok(_) => self.push_idle(connection),
            Err(err) => {
                warn!(
                    parent: &self.inner.span,
                    error = %err,
                    "Released connection is invalid, discarding"
                );
                self.discard(connection);

                let pool_size = self.pool_size();
                let has_room = self.available_connections() < pool_size
                    && self.inner.open.load(Ordering::SeqCst) < pool_size;
                if !has_room || self.is_closed() {
                    return;
                }
                match self.create_validated() {
                    Ok(replacement) => self.push_idle(replacement),
                    Err(err) => error!(
                        parent: &self.inner.span,
                        error = %err,
                        "Failed to create replacement connection"
                    ),
                }
            }
        }
    }

    /// Check out a connection wrapped in a guard that releases it on drop.
    pub fn connection(&self) -> DbResult<SyncPooledConnection<K>> {
        let connection = self.acquire()?;
        Ok(SyncPooledConnection {
            connection: Some(connection),
            pool: self.clone(),
        })
    }

    /// Acquire a connection, run `operation` on it with retry, and release it
    /// on every exit path.
    pub fn execute_with_connection<T, F>(&self, operation: F) -> DbResult<T>
    where
        F: FnMut(&mut K::Connection) -> DbResult<T>,
    {
        let mut guard = self.connection()?;
        self.inner.retry.execute_blocking(&mut *guard, operation)
    }

    /// Run `body` in a transaction on one pooled connection, releasing it
    /// after the commit or rollback.
    pub fn transaction<T, F>(&self, body: F) -> DbResult<T>
    where
        F: for<'a> FnOnce(&mut SyncTransaction<'a, K::Connection>) -> DbResult<T>,
    {
        let mut guard = self.connection()?;
        let mut tx = SyncTransaction::begin_with_span(&mut *guard, self.inner.span.clone())?;
        let outcome = body(&mut tx);
        tx.finish(outcome)
    }

    /// Close the pool and every queued connection.
    ///
    /// Checked-out connections are closed when they are released. Close
    /// failures are logged and do not stop the drain. Calling this again is a
    /// no-op.
    pub fn close_all(&self) {
        let drained: Vec<_> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.shutdown = None;
            self.inner.receiver.try_iter().collect()
        };

        let count = drained.len();
        for connection in drained {
            self.discard(connection);
        }
        info!(
            parent: &self.inner.span,
            closed = count,
            "Connection pool closed"
        );
    }

    fn ensure_initialized(&self) -> DbResult<()> {
        let mut state = self.inner.state.lock();
        if state.initialized {
            return Ok(());
        }
        if state.closed {
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
            match self.create() {
                Ok(connection) => {
                    // Capacity is pool_size and nothing was queued yet.
                    if let Err(TrySendError::Full(connection) | TrySendError::Disconnected(connection)) =
                        self.inner.sender.try_send(connection)
                    {
                        self.discard(connection);
                        continue;
                    }
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
                state.initialized = true;
                Ok(())
            }
        }
    }

    fn create(&self) -> DbResult<K::Connection> {
        let connection = establish_sync(&self.inner.connector, &self.inner.config).map_err(
            |err| DbError::connection_caused_by("Failed to create connection", CREATE_FAILED_HINT, err),
        )?;
        self.inner.open.fetch_add(1, Ordering::SeqCst);
        Ok(connection)
    }

    /// Create a connection and probe it once before handing it out.
    fn create_validated(&self) -> DbResult<K::Connection> {
        let mut connection = self.create()?;
        match connection.version() {
            Ok(_) => {
                debug!(parent: &self.inner.span, "Replacement connection created");
                Ok(connection)
            }
            Err(err) => {
                self.discard(connection);
                Err(DbError::connection_caused_by(
                    "Replacement connection failed validation",
                    CREATE_FAILED_HINT,
                    err,
                ))
            }
        }
    }

    /// Queue a connection, or close it if the pool closed or the queue is full.
    fn push_idle(&self, connection: K::Connection) {
        let rejected = {
            let state = self.inner.state.lock();
            if state.closed {
                Some(connection)
            } else {
                match self.inner.sender.try_send(connection) {
                    Ok(()) => None,
                    Err(TrySendError::Full(c) | TrySendError::Disconnected(c)) => Some(c),
                }
            }
        };
        if let Some(connection) = rejected {
            self.discard(connection);
        }
    }

    /// Close a connection the pool no longer owns. Never fails.
    fn discard(&self, mut connection: K::Connection) {
        if let Err(err) = connection.close() {
            warn!(parent: &self.inner.span, error = %err, "Error closing connection");
        }
        let _ = self
            .inner
            .open
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

impl<K: SyncConnector> SyncExecutor for SyncConnectionPool<K> {
    type Connection = K::Connection;

    fn execute_with_retry<T, F>(&self, operation: F) -> DbResult<T>
    where
        F: FnMut(&mut K::Connection) -> DbResult<T>,
    {
        self.execute_with_connection(operation)
    }
}

/// A connection checked out of a [`SyncConnectionPool`]; released on drop.
pub struct SyncPooledConnection<K: SyncConnector> {
    connection: Option<K::Connection>,
    pool: SyncConnectionPool<K>,
}

impl<K: SyncConnector> SyncPooledConnection<K> {
    /// Hand the connection back to the pool now.
    pub fn release(mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection);
        }
    }

    /// Take the connection out of the guard. The caller becomes responsible
    /// for passing it to [`SyncConnectionPool::release`].
    pub fn detach(mut self) -> Option<K::Connection> {
        self.connection.take()
    }
}

impl<K: SyncConnector> Deref for SyncPooledConnection<K> {
    type Target = K::Connection;

    fn deref(&self) -> &Self::Target {
        self.connection.as_ref().expect("connection taken")
    }
}

impl<K: SyncConnector> DerefMut for SyncPooledConnection<K> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection.as_mut().expect("connection taken")
    }
}

impl<K: SyncConnector> Drop for SyncPooledConnection<K> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockConnector;
    use std::time::{Duration, Instant};

    fn config(pool_size: usize) -> DatabaseConfig {
        DatabaseConfig::new("http://localhost:8000", "app", "main")
            .unwrap()
            .with_pool_size(pool_size)
            .with_max_retries(1)
            .with_retry_base_delay(Duration::from_millis(1))
            .with_acquire_timeout(Duration::from_millis(100))
    }

    #[test]
    fn test_acquire_times_out_when_exhausted() {
        let pool = SyncConnectionPool::new(MockConnector::new(), config(1)).unwrap();
        let held = pool.acquire().unwrap();

        let start = Instant::now();
        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, DbError::Timeout { .. }));
        assert!(err.is_connection_error());
        assert!(start.elapsed() >= Duration::from_millis(100));

        pool.release(held);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn test_close_wakes_blocked_acquire() {
        let pool = SyncConnectionPool::new(
            MockConnector::new(),
            config(1).with_acquire_timeout(Duration::from_secs(10)),
        )
        .unwrap();
        let held = pool.acquire().unwrap();

        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.acquire())
        };
        std::thread::sleep(Duration::from_millis(50));
        pool.close_all();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(DbError::PoolClosed)));
        pool.release(held);
        assert_eq!(pool.stats().open, 0);
    }

    #[test]
    fn test_guard_releases_inline() {
        let pool = SyncConnectionPool::new(MockConnector::new(), config(2)).unwrap();
        {
            let _guard = pool.connection().unwrap();
            assert_eq!(pool.available_connections(), 1);
        }
        assert_eq!(pool.available_connections(), 2);
    }

    #[test]
    fn test_execute_with_connection_releases_on_failure() {
        let connector = MockConnector::new();
        let pool = SyncConnectionPool::new(connector.clone(), config(1)).unwrap();
        let id = {
            let conn = pool.acquire().unwrap();
            let id = conn.id();
            pool.release(conn);
            id
        };
        connector.controls(id).unwrap().fail_next(5);

        let result = pool.execute_with_connection(|c| SyncConnection::select(c, "user"));
        assert!(matches!(result, Err(DbError::Connection { .. })));
        assert_eq!(pool.available_connections(), 1);
    }

    #[test]
    fn test_transaction_rolls_back_and_releases() {
        let connector = MockConnector::new();
        let pool = SyncConnectionPool::new(connector.clone(), config(1)).unwrap();

        let result: DbResult<()> = pool.transaction(|tx| {
            tx.create("user:1", None)?;
            Err(DbError::invalid_input("abort"))
        });
        assert!(matches!(result, Err(DbError::InvalidInput { .. })));
        assert!(connector.store().record("user:1").is_none());
        assert_eq!(pool.available_connections(), 1);
    }
}
