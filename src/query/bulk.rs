//! Batch operations with per-item outcomes.
//!
//! Every item runs as its own retried call. A failing item is recorded in the
//! [`BulkResult`] and the batch continues; use
//! [`BulkResult::into_result`] to turn a partial failure into an error.

use crate::db::executor::{AsyncExecutor, SyncExecutor};
use crate::error::{DbError, DbResult};
use crate::models::{BulkResult, BulkUpdateItem};
use crate::query::filter::validate_identifier;
use crate::query::helpers::{AsyncCrudHelpers, SyncCrudHelpers};
use serde_json::Value;
use tracing::debug;

fn not_found(record_id: &str) -> DbError {
    DbError::protocol(format!("Record not found: {record_id}"))
}

pub struct AsyncBulkOperations<'e, E: AsyncExecutor> {
    crud: AsyncCrudHelpers<'e, E>,
}

impl<'e, E: AsyncExecutor> AsyncBulkOperations<'e, E> {
    pub fn new(executor: &'e E) -> Self {
        Self {
            crud: AsyncCrudHelpers::new(executor),
        }
    }

    /// Create each record in `table`.
    ///
    /// An invalid table name fails the whole batch before anything runs.
    pub async fn insert_bulk(&self, table: &str, records: Vec<Value>) -> DbResult<BulkResult> {
        validate_identifier(table)?;
        let mut result = BulkResult::new();
        for (index, record) in records.into_iter().enumerate() {
            match self.crud.insert_one(table, record.clone()).await {
                Ok(created) => result.push_success(created),
                Err(err) => result.push_error(index, &err, Some(record)),
            }
        }
        debug!(
            table,
            success = result.success_count,
            errors = result.error_count,
            "Bulk insert finished"
        );
        Ok(result)
    }

    pub async fn update_bulk(&self, items: Vec<BulkUpdateItem>) -> BulkResult {
        let mut result = BulkResult::new();
        for (index, item) in items.into_iter().enumerate() {
            let outcome = self
                .crud
                .update_one(&item.record_id, item.data.clone(), item.merge)
                .await
                .and_then(|updated| updated.ok_or_else(|| not_found(&item.record_id)));
            match outcome {
                Ok(updated) => result.push_success(updated),
                Err(err) => result.push_error(index, &err, Some(item.data)),
            }
        }
        debug!(
            success = result.success_count,
            errors = result.error_count,
            "Bulk update finished"
        );
        result
    }

    /// Delete each record id. Success entries carry the deleted id.
    pub async fn delete_bulk(&self, record_ids: &[&str]) -> BulkResult {
        let mut result = BulkResult::new();
        for (index, record_id) in record_ids.iter().enumerate() {
            let outcome = self.crud.delete_one(record_id).await.and_then(|deleted| {
                if deleted {
                    Ok(())
                } else {
                    Err(not_found(record_id))
                }
            });
            match outcome {
                Ok(()) => result.push_success(Value::from(*record_id)),
                Err(err) => result.push_error(index, &err, None),
            }
        }
        debug!(
            success = result.success_count,
            errors = result.error_count,
            "Bulk delete finished"
        );
        result
    }
}

pub struct SyncBulkOperations<'e, E: SyncExecutor> {
    crud: SyncCrudHelpers<'e, E>,
}

impl<'e, E: SyncExecutor> SyncBulkOperations<'e, E> {
    pub fn new(executor: &'e E) -> Self {
        Self {
            crud: SyncCrudHelpers::new(executor),
        }
    }

    pub fn insert_bulk(&self, table: &str, records: Vec<Value>) -> DbResult<BulkResult> {
        validate_identifier(table)?;
        let mut result = BulkResult::new();
        for (index, record) in records.into_iter().enumerate() {
            match self.crud.insert_one(table, record.clone()) {
                Ok(created) => result.push_success(created),
                Err(err) => result.push_error(index, &err, Some(record)),
            }
        }
        Ok(result)
    }

    pub fn update_bulk(&self, items: Vec<BulkUpdateItem>) -> BulkResult {
        let mut result = BulkResult::new();
        for (index, item) in items.into_iter().enumerate() {
            let outcome = self
                .crud
                .update_one(&item.record_id, item.data.clone(), item.merge)
                .and_then(|updated| updated.ok_or_else(|| not_found(&item.record_id)));
            match outcome {
                Ok(updated) => result.push_success(updated),
                Err(err) => result.push_error(index, &err, Some(item.data)),
            }
        }
        result
    }

    pub fn delete_bulk(&self, record_ids: &[&str]) -> BulkResult {
        let mut result = BulkResult::new();
        for (index, record_id) in record_ids.iter().enumerate() {
            match self.crud.delete_one(record_id) {
                Ok(true) => result.push_success(Value::from(*record_id)),
                Ok(false) => result.push_error(index, &not_found(record_id), None),
                Err(err) => result.push_error(index, &err, None),
            }
        }
        result
    }
}
