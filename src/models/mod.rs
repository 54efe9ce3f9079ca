//! Data models shared by the connection layer.
//!
//! This module re-exports all model types used throughout the crate.

pub mod bulk;
pub mod connection;

// Re-export commonly used types
pub use bulk::{BulkError, BulkResult, BulkUpdateItem};
pub use connection::{Credentials, Endpoint, PoolStats, TransactionState, Transport};
