//! SurrealDB connection layer.
//!
//! This library manages client connections to SurrealDB: bounded retry with
//! exponential backoff, a single shared connection or a fixed-size pool with
//! liveness probing, transaction scopes, and a manager choosing between them
//! per configuration. Every component exists in an async (tokio) and a
//! blocking form.
//!
//! The wire protocol is supplied by the integrator through
//! [`db::AsyncConnector`] / [`db::SyncConnector`].

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;
pub mod query;
pub mod testing;

pub use config::{Config, DatabaseConfig, LogConfig};
pub use db::{
    AsyncConnectionPool, AsyncExecutor, AsyncSingleConnection, DatabaseManager, RetryExecutor,
    RetryPolicy, SyncConnectionPool, SyncExecutor, SyncSingleConnection,
};
pub use error::{DbError, DbResult};
pub use models::{BulkResult, BulkUpdateItem, Credentials, Endpoint, PoolStats, Transport};
pub use query::{AsyncBulkOperations, AsyncCrudHelpers, Filter, SyncBulkOperations, SyncCrudHelpers};
