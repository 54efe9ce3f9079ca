//! Entry point selecting pooled or single-connection access.
//!
//! [`DatabaseManager`] builds at most one async and one blocking strategy per
//! configuration and memoises them until they are closed.

use crate::config::DatabaseConfig;
use crate::db::connection::{AsyncConnector, SyncConnector};
use crate::db::executor::{AsyncExecutor, SyncExecutor};
use crate::db::pool::AsyncConnectionPool;
use crate::db::single::{AsyncSingleConnection, SyncSingleConnection};
use crate::db::sync_pool::SyncConnectionPool;
use crate::db::transaction::{AsyncTransaction, SyncTransaction};
use crate::error::DbResult;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tracing::{Span, info, info_span};

/// Async strategy chosen by the manager.
pub enum AsyncHandle<K: AsyncConnector> {
    Pool(AsyncConnectionPool<K>),
    Single(AsyncSingleConnection<K::Connection>),
}

impl<K: AsyncConnector> std::fmt::Debug for AsyncHandle<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pool(pool) => f.debug_tuple("Pool").field(pool).finish(),
            Self::Single(single) => f.debug_tuple("Single").field(single).finish(),
        }
    }
}

impl<K: AsyncConnector> AsyncHandle<K> {
    pub fn is_pool(&self) -> bool {
        matches!(self, Self::Pool(_))
    }

    pub fn as_pool(&self) -> Option<&AsyncConnectionPool<K>> {
        match self {
            Self::Pool(pool) => Some(pool),
            Self::Single(_) => None,
        }
    }

    pub fn as_single(&self) -> Option<&AsyncSingleConnection<K::Connection>> {
        match self {
            Self::Pool(_) => None,
            Self::Single(single) => Some(single),
        }
    }

    /// Run `body` in a transaction on one connection.
    pub async fn transaction<T, F>(&self, body: F) -> DbResult<T>
    where
        T: Send,
        F: for<'a, 't> FnOnce(
            &'t mut AsyncTransaction<'a, K::Connection>,
        ) -> BoxFuture<'t, DbResult<T>>,
    {
        match self {
            Self::Pool(pool) => pool.transaction(body).await,
            Self::Single(single) => single.transaction(body).await,
        }
    }

    /// Close the pool or the single connection. Never fails.
    pub async fn close(&self) {
        match self {
            Self::Pool(pool) => pool.close_all().await,
            Self::Single(single) => single.close().await,
        }
    }
}

#[async_trait]
impl<K: AsyncConnector> AsyncExecutor for AsyncHandle<K> {
    type Connection = K::Connection;

    async fn execute_with_retry<T, F>(&self, operation: F) -> DbResult<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut K::Connection) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        match self {
            Self::Pool(pool) => pool.execute_with_connection(operation).await,
            Self::Single(single) => single.execute_with_retry(operation).await,
        }
    }
}

/// Blocking strategy chosen by the manager.
pub enum SyncHandle<K: SyncConnector> {
    Pool(SyncConnectionPool<K>),
    Single(SyncSingleConnection<K::Connection>),
}

impl<K: SyncConnector> std::fmt::Debug for SyncHandle<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pool(pool) => f.debug_tuple("Pool").field(pool).finish(),
            Self::Single(single) => f.debug_tuple("Single").field(single).finish(),
        }
    }
}

impl<K: SyncConnector> SyncHandle<K> {
    pub fn is_pool(&self) -> bool {
        matches!(self, Self::Pool(_))
    }

    pub fn as_pool(&self) -> Option<&SyncConnectionPool<K>> {
        match self {
            Self::Pool(pool) => Some(pool),
            Self::Single(_) => None,
        }
    }

    pub fn as_single(&self) -> Option<&SyncSingleConnection<K::Connection>> {
        match self {
            Self::Pool(_) => None,
            Self::Single(single) => Some(single),
        }
    }

    /// Run `body` in a transaction on one connection.
    pub fn transaction<T, F>(&self, body: F) -> DbResult<T>
    where
        F: for<'a> FnOnce(&mut SyncTransaction<'a, K::Connection>) -> DbResult<T>,
    {
        match self {
            Self::Pool(pool) => pool.transaction(body),
            Self::Single(single) => single.transaction(body),
        }
    }

    /// Close the pool or the single connection. Never fails.
    pub fn close(&self) {
        match self {
            Self::Pool(pool) => pool.close_all(),
            Self::Single(single) => single.close(),
        }
    }
}

impl<K: SyncConnector> SyncExecutor for SyncHandle<K> {
    type Connection = K::Connection;

    fn execute_with_retry<T, F>(&self, operation: F) -> DbResult<T>
    where
        F: FnMut(&mut K::Connection) -> DbResult<T>,
    {
        match self {
            Self::Pool(pool) => pool.execute_with_connection(operation),
            Self::Single(single) => single.execute_with_retry(operation),
        }
    }
}

/// Owns the configuration and lazily built connection strategies.
///
/// # Example
///
/// ```ignore
/// let config = DatabaseConfig::parse("ws://localhost:8000/rpc?ns=app&db=main")?;
/// let manager = DatabaseManager::new(config, WsConnector::new(), BlockingConnector::new())?;
///
/// let db = manager.get_connection().await?;
/// let user = db.execute_with_retry(|conn| conn.select("user:john")).await?;
///
/// manager.close().await;
/// ```
pub struct DatabaseManager<A: AsyncConnector + Clone, S: SyncConnector + Clone> {
    config: DatabaseConfig,
    async_connector: A,
    sync_connector: S,
    async_handle: tokio::sync::Mutex<Option<Arc<AsyncHandle<A>>>>,
    sync_handle: parking_lot::Mutex<Option<Arc<SyncHandle<S>>>>,
    span: Span,
}

impl<A: AsyncConnector + Clone, S: SyncConnector + Clone> std::fmt::Debug
    for DatabaseManager<A, S>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseManager")
            .field("endpoint", &self.config.endpoint.masked())
            .field("namespace", &self.config.namespace)
            .field("database", &self.config.database)
            .field("use_pool", &self.config.use_pool)
            .finish_non_exhaustive()
    }
}

impl<A: AsyncConnector + Clone, S: SyncConnector + Clone> DatabaseManager<A, S> {
    /// Create a manager. Nothing connects until a handle is requested.
    pub fn new(config: DatabaseConfig, async_connector: A, sync_connector: S) -> DbResult<Self> {
        config.validate()?;
        let span = info_span!(
            "manager",
            component = "database_manager",
            namespace = %config.namespace,
            database = %config.database,
        );
        Ok(Self {
            config,
            async_connector,
            sync_connector,
            async_handle: tokio::sync::Mutex::new(None),
            sync_handle: parking_lot::Mutex::new(None),
            span,
        })
    }

    /// Log under `span` instead of the default component span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// The async strategy, built on first call and shared afterwards.
    pub async fn get_connection(&self) -> DbResult<Arc<AsyncHandle<A>>> {
        let mut slot = self.async_handle.lock().await;
        if let Some(handle) = slot.as_ref() {
            return Ok(Arc::clone(handle));
        }

        let handle = if self.config.use_pool {
            let pool = AsyncConnectionPool::new(self.async_connector.clone(), self.config.clone())?
                .with_span(self.span.clone());
            AsyncHandle::Pool(pool)
        } else {
            let single = AsyncSingleConnection::connect(&self.async_connector, &self.config)
                .await?
                .with_span(self.span.clone());
            AsyncHandle::Single(single)
        };
        info!(
            parent: &self.span,
            pooled = handle.is_pool(),
            "Async connection strategy created"
        );
        let handle = Arc::new(handle);
        *slot = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// The blocking strategy, built on first call and shared afterwards.
    pub fn get_sync_connection(&self) -> DbResult<Arc<SyncHandle<S>>> {
        let mut slot = self.sync_handle.lock();
        if let Some(handle) = slot.as_ref() {
            return Ok(Arc::clone(handle));
        }

        let handle = if self.config.use_pool {
            let pool = SyncConnectionPool::new(self.sync_connector.clone(), self.config.clone())?
                .with_span(self.span.clone());
            SyncHandle::Pool(pool)
        } else {
            let single = SyncSingleConnection::connect(&self.sync_connector, &self.config)?
                .with_span(self.span.clone());
            SyncHandle::Single(single)
        };
        info!(
            parent: &self.span,
            pooled = handle.is_pool(),
            "Sync connection strategy created"
        );
        let handle = Arc::new(handle);
        *slot = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Close the async strategy; the next [`get_connection`](Self::get_connection)
    /// builds a new one.
    pub async fn close(&self) {
        let handle = self.async_handle.lock().await.take();
        if let Some(handle) = handle {
            handle.close().await;
            info!(parent: &self.span, "Async connection strategy closed");
        }
    }

    /// Close the blocking strategy; the next
    /// [`get_sync_connection`](Self::get_sync_connection) builds a new one.
    pub fn close_sync(&self) {
        let handle = self.sync_handle.lock().take();
        if let Some(handle) = handle {
            handle.close();
            info!(parent: &self.span, "Sync connection strategy closed");
        }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn url(&self) -> &str {
        self.config.endpoint.url().as_str()
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    pub fn database(&self) -> &str {
        &self.config.database
    }

    pub fn using_pool(&self) -> bool {
        self.config.use_pool
    }
}
