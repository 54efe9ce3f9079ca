//! Single shared connection with retry.
//!
//! Used instead of a pool when pooling is disabled. All callers share one
//! connection; calls are serialised on an internal lock because a connection
//! runs one operation at a time.

use crate::config::DatabaseConfig;
use crate::db::connection::{
    AsyncConnection, AsyncConnector, SyncConnection, SyncConnector, establish_async,
    establish_sync,
};
use crate::db::executor::{AsyncExecutor, SyncExecutor};
use crate::db::retry::{RetryExecutor, RetryPolicy};
use crate::db::transaction::{AsyncTransaction, SyncTransaction};
use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{Span, debug, error, info_span, warn};

const CHECK_FAILED_HINT: &str = "Verify the server is running and the URL is correct";

/// One async connection behind a lock, with retried execution.
///
/// A transaction scope that is cancelled or panics leaves its transaction
/// open; the next caller to take the lock rolls it back first.
pub struct AsyncSingleConnection<C: AsyncConnection> {
    connection: tokio::sync::Mutex<Option<C>>,
    open_transaction: AtomicBool,
    retry: RetryExecutor,
    span: Span,
}

impl<C: AsyncConnection> std::fmt::Debug for AsyncSingleConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSingleConnection")
            .field("policy", self.retry.policy())
            .finish_non_exhaustive()
    }
}

impl<C: AsyncConnection + 'static> AsyncSingleConnection<C> {
    /// Wrap an established connection.
    pub fn new(connection: C, policy: RetryPolicy) -> Self {
        let span = info_span!("single_connection", component = "async_single");
        Self {
            connection: tokio::sync::Mutex::new(Some(connection)),
            open_transaction: AtomicBool::new(false),
            retry: RetryExecutor::new(policy).with_span(span.clone()),
            span,
        }
    }

    /// Establish a connection with `connector` and wrap it.
    pub async fn connect<K>(connector: &K, config: &DatabaseConfig) -> DbResult<Self>
    where
        K: AsyncConnector<Connection = C>,
    {
        let connection = establish_async(connector, config).await?;
        Ok(Self::new(connection, config.retry_policy()))
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.retry = self.retry.with_span(span.clone());
        self.span = span;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        self.retry.policy()
    }

    /// Probe the connection with `version`, retrying per the policy.
    pub async fn ensure_connected(&self) -> DbResult<()> {
        match self.execute_with_retry(|conn| conn.version()).await {
            Ok(version) => {
                debug!(parent: &self.span, version = %version, "Connection check passed");
                Ok(())
            }
            Err(err) => Err(DbError::connection_caused_by(
                format!("Connection check failed: {err}"),
                CHECK_FAILED_HINT,
                err,
            )),
        }
    }

    /// Run `body` in a transaction on the shared connection.
    pub async fn transaction<T, F>(&self, body: F) -> DbResult<T>
    where
        T: Send,
        F: for<'a, 't> FnOnce(&'t mut AsyncTransaction<'a, C>) -> BoxFuture<'t, DbResult<T>>,
    {
        let mut guard = self.lock_connection().await;
        let connection = guard.as_mut().ok_or(DbError::PoolClosed)?;
        self.open_transaction.store(true, Ordering::SeqCst);
        let result = match AsyncTransaction::begin_with_span(connection, self.span.clone()).await {
            Ok(mut tx) => {
                let outcome = body(&mut tx).await;
                tx.finish(outcome).await
            }
            Err(err) => Err(err),
        };
        self.open_transaction.store(false, Ordering::SeqCst);
        result
    }

    /// Close the connection. Failures are logged, never returned.
    pub async fn close(&self) {
        let taken = self.connection.lock().await.take();
        self.open_transaction.store(false, Ordering::SeqCst);
        let Some(mut connection) = taken else {
            return;
        };
        match connection.close().await {
            Ok(()) => debug!(parent: &self.span, "Connection closed"),
            Err(err) => warn!(parent: &self.span, error = %err, "Error closing connection"),
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.connection.lock().await.is_none()
    }

    /// Take the lock, rolling back a transaction left open by an abandoned
    /// scope.
    async fn lock_connection(&self) -> tokio::sync::MutexGuard<'_, Option<C>> {
        let mut guard = self.connection.lock().await;
        if self.open_transaction.load(Ordering::SeqCst) {
            if let Some(connection) = guard.as_mut() {
                match connection.rollback_transaction().await {
                    Ok(()) => warn!(
                        parent: &self.span,
                        "Rolled back a transaction left open by an abandoned scope"
                    ),
                    Err(err) => error!(
                        parent: &self.span,
                        error = %err,
                        "Rollback of abandoned transaction failed"
                    ),
                }
            }
            self.open_transaction.store(false, Ordering::SeqCst);
        }
        guard
    }
}

#[async_trait]
impl<C: AsyncConnection + 'static> AsyncExecutor for AsyncSingleConnection<C> {
    type Connection = C;

    async fn execute_with_retry<T, F>(&self, operation: F) -> DbResult<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut C) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        let mut guard = self.lock_connection().await;
        let connection = guard.as_mut().ok_or(DbError::PoolClosed)?;
        self.retry.execute(connection, operation).await
    }
}

/// One blocking connection behind a lock, with retried execution.
pub struct SyncSingleConnection<C: SyncConnection> {
    connection: parking_lot::Mutex<Option<C>>,
    retry: RetryExecutor,
    span: Span,
}

impl<C: SyncConnection> std::fmt::Debug for SyncSingleConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSingleConnection")
            .field("policy", self.retry.policy())
            .finish_non_exhaustive()
    }
}

impl<C: SyncConnection> SyncSingleConnection<C> {
    /// Wrap an established connection.
    pub fn new(connection: C, policy: RetryPolicy) -> Self {
        let span = info_span!("single_connection", component = "sync_single");
        Self {
            connection: parking_lot::Mutex::new(Some(connection)),
            retry: RetryExecutor::new(policy).with_span(span.clone()),
            span,
        }
    }

    /// Establish a connection with `connector` and wrap it.
    pub fn connect<K>(connector: &K, config: &DatabaseConfig) -> DbResult<Self>
    where
        K: SyncConnector<Connection = C>,
    {
        let connection = establish_sync(connector, config)?;
        Ok(Self::new(connection, config.retry_policy()))
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.retry = self.retry.with_span(span.clone());
        self.span = span;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        self.retry.policy()
    }

    /// Probe the connection with `version`, retrying per the policy.
    pub fn ensure_connected(&self) -> DbResult<()> {
        match self.execute_with_retry(|conn| conn.version()) {
            Ok(version) => {
                debug!(parent: &self.span, version = %version, "Connection check passed");
                Ok(())
            }
            Err(err) => Err(DbError::connection_caused_by(
                format!("Connection check failed: {err}"),
                CHECK_FAILED_HINT,
                err,
            )),
        }
    }

    /// Run `body` in a transaction on the shared connection.
    pub fn transaction<T, F>(&self, body: F) -> DbResult<T>
    where
        F: for<'a> FnOnce(&mut SyncTransaction<'a, C>) -> DbResult<T>,
    {
        let mut guard = self.connection.lock();
        let connection = guard.as_mut().ok_or(DbError::PoolClosed)?;
        let mut tx = SyncTransaction::begin_with_span(connection, self.span.clone())?;
        let outcome = body(&mut tx);
        tx.finish(outcome)
    }

    /// Close the connection. Failures are logged, never returned.
    pub fn close(&self) {
        let Some(mut connection) = self.connection.lock().take() else {
            return;
        };
        match connection.close() {
            Ok(()) => debug!(parent: &self.span, "Connection closed"),
            Err(err) => warn!(parent: &self.span, error = %err, "Error closing connection"),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.connection.lock().is_none()
    }
}

impl<C: SyncConnection> SyncExecutor for SyncSingleConnection<C> {
    type Connection = C;

    fn execute_with_retry<T, F>(&self, operation: F) -> DbResult<T>
    where
        F: FnMut(&mut C) -> DbResult<T>,
    {
        let mut guard = self.connection.lock();
        let connection = guard.as_mut().ok_or(DbError::PoolClosed)?;
        self.retry.execute_blocking(connection, operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockConnector, MockEvent};
    use serde_json::json;
    use std::time::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(2, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_async_execute_with_retry_recovers() {
        let connector = MockConnector::new();
        let conn = connector.open();
        conn.controls().fail_next(2);
        let single = AsyncSingleConnection::new(conn, policy());

        let rows = single
            .execute_with_retry(|c| AsyncConnection::query(c, "SELECT * FROM user", None))
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_async_ensure_connected_fails_on_dead_connection() {
        let connector = MockConnector::new();
        let conn = connector.open();
        conn.controls().set_alive(false);
        let single = AsyncSingleConnection::new(conn, policy());

        let err = single.ensure_connected().await.unwrap_err();
        assert!(err.is_connection_error());
        assert!(err.to_string().contains("Connection check failed"));
    }

    #[tokio::test]
    async fn test_async_close_never_fails_and_closes_once() {
        let connector = MockConnector::new();
        let conn = connector.open();
        let id = conn.id();
        conn.controls().fail_close(true);
        let single = AsyncSingleConnection::new(conn, policy());

        single.close().await;
        single.close().await;
        assert_eq!(connector.close_count(id), 1);
        assert!(single.is_closed().await);

        let result = single.execute_with_retry(|c| AsyncConnection::version(c)).await;
        assert!(matches!(result, Err(DbError::PoolClosed)));
    }

    #[tokio::test]
    async fn test_async_connect_selects_namespace() {
        let connector = MockConnector::new();
        let config = DatabaseConfig::new("ws://localhost:8000/rpc", "app", "main").unwrap();
        let single = AsyncSingleConnection::connect(&connector, &config).await.unwrap();
        single.ensure_connected().await.unwrap();
        assert!(
            connector
                .events()
                .contains(&MockEvent::Use(1, "app".into(), "main".into()))
        );
    }

    #[tokio::test]
    async fn test_async_transaction_commits() {
        let connector = MockConnector::new();
        let single = AsyncSingleConnection::new(connector.open(), policy());

        single
            .transaction(|tx| {
                Box::pin(async move {
                    tx.create("order:1", Some(json!({"total": 10}))).await?;
                    Ok(())
                })
            })
            .await
            .unwrap();
        assert!(connector.store().record("order:1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_abandoned_transaction_rolled_back_by_next_caller() {
        let connector = MockConnector::new();
        let single = AsyncSingleConnection::new(connector.open(), policy());

        let outcome = tokio::time::timeout(
            Duration::from_millis(50),
            single.transaction(|tx| {
                Box::pin(async move {
                    tx.create("order:1", Some(json!({"total": 10}))).await?;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, DbError>(())
                })
            }),
        )
        .await;
        assert!(outcome.is_err());

        single
            .transaction(|tx| {
                Box::pin(async move { tx.create("order:2", Some(json!({"total": 5}))).await })
            })
            .await
            .unwrap();
        assert!(connector.store().record("order:1").is_none());
        assert!(connector.store().record("order:2").is_some());
        assert!(connector.events().contains(&MockEvent::Rollback(1)));
    }

    #[test]
    fn test_sync_retry_and_close() {
        let connector = MockConnector::new();
        let conn = connector.open();
        let id = conn.id();
        conn.controls().fail_next(1);
        let single = SyncSingleConnection::new(conn, policy());

        let created = single
            .execute_with_retry(|c| SyncConnection::create(c, "user:1", Some(json!({"name": "a"}))))
            .unwrap();
        assert_eq!(created["id"], "user:1");

        single.close();
        single.close();
        assert_eq!(connector.close_count(id), 1);
    }

    #[test]
    fn test_sync_exhaustion_is_connection_error() {
        let connector = MockConnector::new();
        let conn = connector.open();
        conn.controls().fail_next(10);
        let single = SyncSingleConnection::new(conn, policy());

        let err = single
            .execute_with_retry(|c| SyncConnection::select(c, "user"))
            .unwrap_err();
        assert!(matches!(err, DbError::Connection { .. }));
        assert!(err.to_string().contains("3 attempts"));
    }
}
