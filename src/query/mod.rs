//! Query translation and CRUD convenience layer.
//!
//! Helpers borrow any executor (pool, single connection or manager handle)
//! and run every call through its retry policy.

pub mod builder;
pub mod bulk;
pub mod filter;
pub mod helpers;

pub use builder::{
    build_count, build_delete, build_exists, build_select, build_update, validate_record_id,
};
pub use bulk::{AsyncBulkOperations, SyncBulkOperations};
pub use filter::{Condition, Filter, FilterOperator, to_literal, validate_identifier};
pub use helpers::{AsyncCrudHelpers, SyncCrudHelpers, normalize_many, normalize_single};
