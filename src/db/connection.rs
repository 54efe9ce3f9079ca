//! Connection contracts.
//!
//! A connection executes one logical database operation at a time and is
//! exclusively owned by one caller while in use. The async and blocking
//! contracts are independent traits with the same operation set; nothing in
//! this crate dispatches between them at runtime.
//!
//! Creating connections is delegated to a connector supplied by the
//! integration, which owns the wire protocol.

use crate::config::DatabaseConfig;
use crate::error::DbResult;
use crate::models::{Credentials, Endpoint};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

/// Async connection to a database server.
#[async_trait]
pub trait AsyncConnection: Send {
    /// Authenticate; returns the server's token or session value.
    async fn signin(&mut self, credentials: &Credentials) -> DbResult<Value>;

    /// Select the namespace and database for subsequent calls.
    async fn use_namespace(&mut self, namespace: &str, database: &str) -> DbResult<()>;

    /// Run a statement; returns the rows of its result.
    async fn query(&mut self, statement: &str, vars: Option<Value>) -> DbResult<Vec<Value>>;

    async fn create(&mut self, target: &str, data: Option<Value>) -> DbResult<Value>;

    async fn update(&mut self, target: &str, data: Option<Value>) -> DbResult<Value>;

    async fn merge(&mut self, target: &str, data: Option<Value>) -> DbResult<Value>;

    async fn patch(&mut self, target: &str, data: Option<Value>) -> DbResult<Value>;

    async fn upsert(&mut self, target: &str, data: Option<Value>) -> DbResult<Value>;

    async fn delete(&mut self, target: &str) -> DbResult<Value>;

    async fn select(&mut self, target: &str) -> DbResult<Value>;

    async fn insert(&mut self, table: &str, data: Value) -> DbResult<Value>;

    /// Server version. Used as the liveness probe.
    async fn version(&mut self) -> DbResult<String>;

    /// Close the connection. Callers treat failures as best-effort.
    async fn close(&mut self) -> DbResult<()>;

    async fn begin_transaction(&mut self) -> DbResult<()>;

    async fn commit_transaction(&mut self) -> DbResult<()>;

    async fn rollback_transaction(&mut self) -> DbResult<()>;
}

/// Blocking connection to a database server.
pub trait SyncConnection: Send {
    /// Authenticate; returns the server's token or session value.
    fn signin(&mut self, credentials: &Credentials) -> DbResult<Value>;

    /// Select the namespace and database for subsequent calls.
    fn use_namespace(&mut self, namespace: &str, database: &str) -> DbResult<()>;

    /// Run a statement; returns the rows of its result.
    fn query(&mut self, statement: &str, vars: Option<Value>) -> DbResult<Vec<Value>>;

    fn create(&mut self, target: &str, data: Option<Value>) -> DbResult<Value>;

    fn update(&mut self, target: &str, data: Option<Value>) -> DbResult<Value>;

    fn merge(&mut self, target: &str, data: Option<Value>) -> DbResult<Value>;

    fn patch(&mut self, target: &str, data: Option<Value>) -> DbResult<Value>;

    fn upsert(&mut self, target: &str, data: Option<Value>) -> DbResult<Value>;

    fn delete(&mut self, target: &str) -> DbResult<Value>;

    fn select(&mut self, target: &str) -> DbResult<Value>;

    fn insert(&mut self, table: &str, data: Value) -> DbResult<Value>;

    /// Server version. Used as the liveness probe.
    fn version(&mut self) -> DbResult<String>;

    /// Close the connection. Callers treat failures as best-effort.
    fn close(&mut self) -> DbResult<()>;

    fn begin_transaction(&mut self) -> DbResult<()>;

    fn commit_transaction(&mut self) -> DbResult<()>;

    fn rollback_transaction(&mut self) -> DbResult<()>;
}

/// Factory for async connections.
#[async_trait]
pub trait AsyncConnector: Send + Sync + 'static {
    type Connection: AsyncConnection + 'static;

    /// Open a raw connection to `endpoint`.
    async fn connect(&self, endpoint: &Endpoint) -> DbResult<Self::Connection>;
}

/// Factory for blocking connections.
pub trait SyncConnector: Send + Sync + 'static {
    type Connection: SyncConnection + 'static;

    /// Open a raw connection to `endpoint`.
    fn connect(&self, endpoint: &Endpoint) -> DbResult<Self::Connection>;
}

/// Open a connection, sign in if credentials are configured, and select the
/// namespace and database.
pub async fn establish_async<K: AsyncConnector>(
    connector: &K,
    config: &DatabaseConfig,
) -> DbResult<K::Connection> {
    let mut connection = connector.connect(&config.endpoint).await?;
    if let Some(credentials) = &config.credentials {
        connection.signin(credentials).await?;
    }
    connection
        .use_namespace(&config.namespace, &config.database)
        .await?;
    debug!(
        endpoint = %config.endpoint,
        namespace = %config.namespace,
        database = %config.database,
        "Connection established"
    );
    Ok(connection)
}

/// Blocking counterpart of [`establish_async`].
pub fn establish_sync<K: SyncConnector>(
    connector: &K,
    config: &DatabaseConfig,
) -> DbResult<K::Connection> {
    let mut connection = connector.connect(&config.endpoint)?;
    if let Some(credentials) = &config.credentials {
        connection.signin(credentials)?;
    }
    connection.use_namespace(&config.namespace, &config.database)?;
    debug!(
        endpoint = %config.endpoint,
        namespace = %config.namespace,
        database = %config.database,
        "Connection established"
    );
    Ok(connection)
}
