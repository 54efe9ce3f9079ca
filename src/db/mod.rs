//! Connection lifecycle layer.
//!
//! This module provides:
//! - Connection and connector contracts (async and blocking)
//! - Bounded retry with exponential backoff
//! - Single shared connections
//! - Async and blocking connection pools
//! - Transaction scopes
//! - The manager selecting a pool or a single connection per configuration

pub mod connection;
pub mod executor;
pub mod manager;
pub mod pool;
pub mod retry;
pub mod single;
pub mod sync_pool;
pub mod transaction;

pub use connection::{
    AsyncConnection, AsyncConnector, SyncConnection, SyncConnector, establish_async,
    establish_sync,
};
pub use executor::{AsyncExecutor, SyncExecutor};
pub use manager::{AsyncHandle, DatabaseManager, SyncHandle};
pub use pool::{AsyncConnectionPool, PooledConnection};
pub use retry::{RetryExecutor, RetryPolicy};
pub use single::{AsyncSingleConnection, SyncSingleConnection};
pub use sync_pool::{SyncConnectionPool, SyncPooledConnection};
pub use transaction::{AsyncTransaction, SyncTransaction};
