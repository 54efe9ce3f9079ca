//! Retrying execution seam shared by pools and single connections.
//!
//! The query helpers are written against these traits, so they run the same
//! way whether the manager handed out a pool or a single connection.

use crate::db::connection::{AsyncConnection, SyncConnection};
use crate::error::DbResult;
use async_trait::async_trait;
use futures_util::future::BoxFuture;

/// Something that can lend a connection to a retried async operation.
#[async_trait]
pub trait AsyncExecutor: Send + Sync {
    type Connection: AsyncConnection;

    /// Run `operation` on a connection, retrying per the configured policy.
    ///
    /// The closure is called once per attempt. Data it moves into the
    /// returned future must be cloned per call.
    async fn execute_with_retry<T, F>(&self, operation: F) -> DbResult<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut Self::Connection) -> BoxFuture<'c, DbResult<T>> + Send;
}

/// Blocking counterpart of [`AsyncExecutor`].
pub trait SyncExecutor: Send + Sync {
    type Connection: SyncConnection;

    fn execute_with_retry<T, F>(&self, operation: F) -> DbResult<T>
    where
        F: FnMut(&mut Self::Connection) -> DbResult<T>;
}
