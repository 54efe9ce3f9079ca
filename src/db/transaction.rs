//! Transaction scopes.
//!
//! A scope borrows one connection for its lifetime, issues
//! `begin_transaction` on creation and exactly one of `commit_transaction` or
//! `rollback_transaction` when it ends. Calls made through the scope are
//! forwarded unchanged to the borrowed connection; nothing is buffered
//! client-side and nothing is retried.
//!
//! The scope does not own the connection. Returning a pooled connection after
//! the scope ends is up to whoever acquired it (see
//! [`AsyncConnectionPool::transaction`](super::AsyncConnectionPool::transaction)).
//!
//! # Usage
//!
//! ```ignore
//! let created = AsyncTransaction::run(&mut conn, |tx| {
//!     Box::pin(async move {
//!         tx.create("user:john", Some(json!({"name": "John"}))).await?;
//!         tx.create("user:jane", Some(json!({"name": "Jane"}))).await
//!     })
//! })
//! .await?;
//! ```

use crate::db::connection::{AsyncConnection, SyncConnection};
use crate::error::DbResult;
use crate::models::TransactionState;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tracing::{Span, debug, error, warn};

/// Transaction scope over an async connection.
pub struct AsyncTransaction<'c, C: AsyncConnection> {
    connection: &'c mut C,
    state: TransactionState,
    span: Span,
}

impl<'c, C: AsyncConnection> AsyncTransaction<'c, C> {
    /// Start a transaction on `connection`.
    pub async fn begin(connection: &'c mut C) -> DbResult<Self> {
        Self::begin_with_span(connection, Span::current()).await
    }

    /// Start a transaction, logging under `span`.
    pub async fn begin_with_span(connection: &'c mut C, span: Span) -> DbResult<Self> {
        connection.begin_transaction().await?;
        debug!(parent: &span, "Transaction started");
        Ok(Self {
            connection,
            state: TransactionState::Active,
            span,
        })
    }

    /// Run `body` inside a transaction: commit if it returns `Ok`, roll back
    /// and return its error unchanged if it returns `Err`.
    pub async fn run<T, F>(connection: &'c mut C, body: F) -> DbResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut AsyncTransaction<'c, C>) -> BoxFuture<'t, DbResult<T>>,
    {
        let mut tx = Self::begin(connection).await?;
        let outcome = body(&mut tx).await;
        tx.finish(outcome).await
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// End the scope according to `outcome`.
    ///
    /// On `Err`, a failing rollback is logged and the original error is
    /// returned.
    pub async fn finish<T>(self, outcome: DbResult<T>) -> DbResult<T> {
        match outcome {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(err) => {
                let span = self.span.clone();
                if let Err(rollback_err) = self.rollback().await {
                    error!(
                        parent: &span,
                        error = %rollback_err,
                        original_error = %err,
                        "Rollback failed while handling a transaction failure"
                    );
                }
                Err(err)
            }
        }
    }

    /// Commit the transaction.
    ///
    /// If the commit fails, a rollback is attempted before the commit error
    /// is returned.
    pub async fn commit(mut self) -> DbResult<()> {
        match self.connection.commit_transaction().await {
            Ok(()) => {
                self.state = TransactionState::Committed;
                debug!(parent: &self.span, "Transaction committed");
                Ok(())
            }
            Err(err) => {
                self.state = TransactionState::RolledBack;
                warn!(parent: &self.span, error = %err, "Commit failed, rolling back");
                if let Err(rollback_err) = self.connection.rollback_transaction().await {
                    error!(parent: &self.span, error = %rollback_err, "Rollback after failed commit failed");
                }
                Err(err)
            }
        }
    }

    /// Roll the transaction back.
    pub async fn rollback(mut self) -> DbResult<()> {
        self.state = TransactionState::RolledBack;
        self.connection.rollback_transaction().await?;
        debug!(parent: &self.span, "Transaction rolled back");
        Ok(())
    }

    /// Execute a query within the transaction.
    pub async fn query(&mut self, statement: &str, vars: Option<Value>) -> DbResult<Vec<Value>> {
        self.connection.query(statement, vars).await
    }

    /// Create a record within the transaction.
    pub async fn create(&mut self, target: &str, data: Option<Value>) -> DbResult<Value> {
        self.connection.create(target, data).await
    }

    /// Replace a record within the transaction.
    pub async fn update(&mut self, target: &str, data: Option<Value>) -> DbResult<Value> {
        self.connection.update(target, data).await
    }

    /// Merge data into a record within the transaction.
    pub async fn merge(&mut self, target: &str, data: Option<Value>) -> DbResult<Value> {
        self.connection.merge(target, data).await
    }

    /// Patch a record within the transaction.
    pub async fn patch(&mut self, target: &str, data: Option<Value>) -> DbResult<Value> {
        self.connection.patch(target, data).await
    }

    /// Upsert a record within the transaction.
    pub async fn upsert(&mut self, target: &str, data: Option<Value>) -> DbResult<Value> {
        self.connection.upsert(target, data).await
    }

    /// Delete a record within the transaction.
    pub async fn delete(&mut self, target: &str) -> DbResult<Value> {
        self.connection.delete(target).await
    }

    /// Select records within the transaction.
    pub async fn select(&mut self, target: &str) -> DbResult<Value> {
        self.connection.select(target).await
    }

    /// Insert records within the transaction.
    pub async fn insert(&mut self, table: &str, data: Value) -> DbResult<Value> {
        self.connection.insert(table, data).await
    }
}

impl<C: AsyncConnection> Drop for AsyncTransaction<'_, C> {
    fn drop(&mut self) {
        // No async drop. Owners that can be cancelled mid-scope (the pool and
        // the shared connection) roll back before the connection is reused.
        if self.state.is_active() {
            warn!(
                parent: &self.span,
                "Transaction dropped without commit or rollback"
            );
        }
    }
}

/// Transaction scope over a blocking connection.
///
/// Dropping an active scope rolls it back, so early returns and panics in
/// the body never commit.
pub struct SyncTransaction<'c, C: SyncConnection> {
    connection: &'c mut C,
    state: TransactionState,
    span: Span,
}

impl<'c, C: SyncConnection> SyncTransaction<'c, C> {
    /// Start a transaction on `connection`.
    pub fn begin(connection: &'c mut C) -> DbResult<Self> {
        Self::begin_with_span(connection, Span::current())
    }

    /// Start a transaction, logging under `span`.
    pub fn begin_with_span(connection: &'c mut C, span: Span) -> DbResult<Self> {
        connection.begin_transaction()?;
        debug!(parent: &span, "Transaction started");
        Ok(Self {
            connection,
            state: TransactionState::Active,
            span,
        })
    }

    /// Run `body` inside a transaction: commit if it returns `Ok`, roll back
    /// and return its error unchanged if it returns `Err`.
    pub fn run<T, F>(connection: &'c mut C, body: F) -> DbResult<T>
    where
        F: FnOnce(&mut SyncTransaction<'c, C>) -> DbResult<T>,
    {
        let mut tx = Self::begin(connection)?;
        let outcome = body(&mut tx);
        tx.finish(outcome)
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// End the scope according to `outcome`.
    ///
    /// On `Err`, a failing rollback is logged and the original error is
    /// returned.
    pub fn finish<T>(self, outcome: DbResult<T>) -> DbResult<T> {
        match outcome {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                let span = self.span.clone();
                if let Err(rollback_err) = self.rollback() {
                    error!(
                        parent: &span,
                        error = %rollback_err,
                        original_error = %err,
                        "Rollback failed while handling a transaction failure"
                    );
                }
                Err(err)
            }
        }
    }

    /// Commit the transaction.
    ///
    /// If the commit fails, a rollback is attempted before the commit error
    /// is returned.
    pub fn commit(mut self) -> DbResult<()> {
        match self.connection.commit_transaction() {
            Ok(()) => {
                self.state = TransactionState::Committed;
                debug!(parent: &self.span, "Transaction committed");
                Ok(())
            }
            Err(err) => {
                self.state = TransactionState::RolledBack;
                warn!(parent: &self.span, error = %err, "Commit failed, rolling back");
                if let Err(rollback_err) = self.connection.rollback_transaction() {
                    error!(parent: &self.span, error = %rollback_err, "Rollback after failed commit failed");
                }
                Err(err)
            }
        }
    }

    /// Roll the transaction back.
    pub fn rollback(mut self) -> DbResult<()> {
        self.state = TransactionState::RolledBack;
        self.connection.rollback_transaction()?;
        debug!(parent: &self.span, "Transaction rolled back");
        Ok(())
    }

    /// Execute a query within the transaction.
    pub fn query(&mut self, statement: &str, vars: Option<Value>) -> DbResult<Vec<Value>> {
        self.connection.query(statement, vars)
    }

    /// Create a record within the transaction.
    pub fn create(&mut self, target: &str, data: Option<Value>) -> DbResult<Value> {
        self.connection.create(target, data)
    }

    /// Replace a record within the transaction.
    pub fn update(&mut self, target: &str, data: Option<Value>) -> DbResult<Value> {
        self.connection.update(target, data)
    }

    /// Merge data into a record within the transaction.
    pub fn merge(&mut self, target: &str, data: Option<Value>) -> DbResult<Value> {
        self.connection.merge(target, data)
    }

    /// Patch a record within the transaction.
    pub fn patch(&mut self, target: &str, data: Option<Value>) -> DbResult<Value> {
        self.connection.patch(target, data)
    }

    /// Upsert a record within the transaction.
    pub fn upsert(&mut self, target: &str, data: Option<Value>) -> DbResult<Value> {
        self.connection.upsert(target, data)
    }

    /// Delete a record within the transaction.
    pub fn delete(&mut self, target: &str) -> DbResult<Value> {
        self.connection.delete(target)
    }

    /// Select records within the transaction.
    pub fn select(&mut self, target: &str) -> DbResult<Value> {
        self.connection.select(target)
    }

    /// Insert records within the transaction.
    pub fn insert(&mut self, table: &str, data: Value) -> DbResult<Value> {
        self.connection.insert(table, data)
    }
}

impl<C: SyncConnection> Drop for SyncTransaction<'_, C> {
    fn drop(&mut self) {
        if !self.state.is_active() {
            return;
        }
        self.state = TransactionState::RolledBack;
        warn!(
            parent: &self.span,
            panicking = std::thread::panicking(),
            "Transaction dropped while active, rolling back"
        );
        if let Err(err) = self.connection.rollback_transaction() {
            error!(parent: &self.span, error = %err, "Rollback on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use crate::testing::{MockConnector, MockEvent};
    use serde_json::json;

    #[tokio::test]
    async fn test_async_commit_on_success() {
        let connector = MockConnector::new();
        let mut conn = connector.open();

        let result = AsyncTransaction::run(&mut conn, |tx| {
            Box::pin(async move {
                tx.create("user:john", Some(json!({"name": "John"}))).await?;
                tx.create("user:jane", Some(json!({"name": "Jane"}))).await
            })
        })
        .await;

        assert!(result.is_ok());
        assert!(connector.store().record("user:john").is_some());
        assert!(connector.store().record("user:jane").is_some());
        let events = connector.events();
        assert!(events.contains(&MockEvent::Begin(conn.id())));
        assert!(events.contains(&MockEvent::Commit(conn.id())));
        assert!(!events.contains(&MockEvent::Rollback(conn.id())));
    }

    #[tokio::test]
    async fn test_async_rollback_on_error_returns_original() {
        let connector = MockConnector::new();
        let mut conn = connector.open();

        let result: DbResult<()> = AsyncTransaction::run(&mut conn, |tx| {
            Box::pin(async move {
                tx.create("user:john", Some(json!({"name": "John"}))).await?;
                Err(DbError::invalid_input("validation failed"))
            })
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
        assert!(connector.store().record("user:john").is_none());
        assert!(connector.events().contains(&MockEvent::Rollback(conn.id())));
    }

    #[tokio::test]
    async fn test_async_rollback_failure_keeps_original_error() {
        let connector = MockConnector::new();
        let mut conn = connector.open();
        conn.controls().fail_rollback(true);

        let result: DbResult<()> = AsyncTransaction::run(&mut conn, |_tx| {
            Box::pin(async move { Err(DbError::invalid_input("body failed")) })
        })
        .await;

        assert!(matches!(result, Err(DbError::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn test_async_explicit_commit_and_state() {
        let connector = MockConnector::new();
        let mut conn = connector.open();

        let mut tx = AsyncTransaction::begin(&mut conn).await.unwrap();
        assert_eq!(tx.state(), TransactionState::Active);
        tx.upsert("item:1", Some(json!({"qty": 1}))).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(connector.store().record("item:1").unwrap()["qty"], 1);
    }

    #[tokio::test]
    async fn test_async_begin_failure_propagates() {
        let connector = MockConnector::new();
        let mut conn = connector.open();
        conn.controls().set_alive(false);

        let result = AsyncTransaction::begin(&mut conn).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_sync_commit_and_rollback() {
        let connector = MockConnector::new();
        let mut conn = connector.open();

        SyncTransaction::run(&mut conn, |tx| {
            tx.create("user:1", Some(json!({"name": "a"})))?;
            Ok(())
        })
        .unwrap();
        assert!(connector.store().record("user:1").is_some());

        let result: DbResult<()> = SyncTransaction::run(&mut conn, |tx| {
            tx.delete("user:1")?;
            Err(DbError::invalid_input("abort"))
        });
        assert!(result.is_err());
        assert!(connector.store().record("user:1").is_some());
    }

    #[test]
    fn test_sync_drop_rolls_back() {
        let connector = MockConnector::new();
        let mut conn = connector.open();
        {
            let mut tx = SyncTransaction::begin(&mut conn).unwrap();
            tx.create("user:9", Some(json!({}))).unwrap();
        }
        assert!(connector.store().record("user:9").is_none());
        assert!(connector.events().contains(&MockEvent::Rollback(conn.id())));
    }

    #[test]
    fn test_sync_panic_in_body_rolls_back() {
        let connector = MockConnector::new();
        let mut conn = connector.open();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: DbResult<()> = SyncTransaction::run(&mut conn, |tx| {
                tx.create("user:7", Some(json!({})))?;
                panic!("body panicked");
            });
        }));

        assert!(outcome.is_err());
        assert!(connector.store().record("user:7").is_none());
    }
}
