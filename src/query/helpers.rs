//! CRUD helpers over any retrying executor.
//!
//! Each helper maps one logical operation onto one connection call (or one
//! generated statement) run through
//! [`execute_with_retry`](crate::db::AsyncExecutor::execute_with_retry), so
//! it behaves the same on a pool, a single connection or a manager handle.
//! Retried writes may be applied twice; see [`crate::db::retry`].

use crate::db::connection::{AsyncConnection, SyncConnection};
use crate::db::executor::{AsyncExecutor, SyncExecutor};
use crate::error::{DbError, DbResult};
use crate::query::builder::{
    build_count, build_delete, build_exists, build_select, build_update, validate_record_id,
};
use crate::query::filter::{Filter, validate_identifier};
use serde_json::{Map, Value};

/// The single record of a call result: the first element of a non-empty
/// array, `None` for null or an empty array.
pub fn normalize_single(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Array(items) => items.into_iter().next(),
        other => Some(other),
    }
}

/// The records of a call result as a list.
pub fn normalize_many(value: Value) -> Vec<Value> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        other => vec![other],
    }
}

fn count_of(rows: &[Value]) -> u64 {
    rows.first()
        .and_then(|row| row.get("count"))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

fn exists_of(rows: &[Value]) -> bool {
    rows.first().and_then(Value::as_bool).unwrap_or(false)
}

fn object_of(data: &Value) -> DbResult<&Map<String, Value>> {
    data.as_object()
        .ok_or_else(|| DbError::invalid_input("Record data must be an object"))
}

/// Record id for an upsert keyed on `key_field`, if the record carries one.
fn keyed_record_id(table: &str, record: &Value, key_field: &str) -> Option<String> {
    let key = record.get(key_field)?;
    let key = match key {
        Value::String(s) => s.strip_prefix(&format!("{table}:")).unwrap_or(s).to_string(),
        Value::Null => return None,
        other => other.to_string(),
    };
    Some(format!("{table}:{key}"))
}

/// Async CRUD helpers.
pub struct AsyncCrudHelpers<'e, E: AsyncExecutor> {
    executor: &'e E,
}

impl<'e, E: AsyncExecutor> AsyncCrudHelpers<'e, E> {
    pub fn new(executor: &'e E) -> Self {
        Self { executor }
    }

    /// Create one record in `table`; returns the created record.
    pub async fn insert_one(&self, table: &str, data: Value) -> DbResult<Value> {
        validate_identifier(table)?;
        let table = table.to_string();
        let created = self
            .executor
            .execute_with_retry(move |conn| {
                let table = table.clone();
                let data = data.clone();
                Box::pin(async move { conn.create(&table, Some(data)).await })
            })
            .await?;
        normalize_single(created).ok_or_else(|| DbError::protocol("Create returned no record"))
    }

    /// Insert several records in one call.
    pub async fn insert_many(&self, table: &str, data: Vec<Value>) -> DbResult<Vec<Value>> {
        validate_identifier(table)?;
        let table = table.to_string();
        let payload = Value::Array(data);
        let inserted = self
            .executor
            .execute_with_retry(move |conn| {
                let table = table.clone();
                let payload = payload.clone();
                Box::pin(async move { conn.insert(&table, payload).await })
            })
            .await?;
        Ok(normalize_many(inserted))
    }

    /// Replace (or with `merge`, merge into) one record. `None` if it does not
    /// exist.
    pub async fn update_one(
        &self,
        record_id: &str,
        data: Value,
        merge: bool,
    ) -> DbResult<Option<Value>> {
        validate_record_id(record_id)?;
        let record_id = record_id.to_string();
        let updated = self
            .executor
            .execute_with_retry(move |conn| {
                let record_id = record_id.clone();
                let data = data.clone();
                Box::pin(async move {
                    if merge {
                        conn.merge(&record_id, Some(data)).await
                    } else {
                        conn.update(&record_id, Some(data)).await
                    }
                })
            })
            .await?;
        Ok(normalize_single(updated))
    }

    /// Update every record of `table` matching `filter`.
    pub async fn update_many(
        &self,
        table: &str,
        filter: &Filter,
        data: &Value,
        merge: bool,
    ) -> DbResult<Vec<Value>> {
        let statement = build_update(table, Some(filter), object_of(data)?, merge)?;
        self.run_query(statement).await
    }

    /// Create or replace one record.
    pub async fn upsert_one(&self, record_id: &str, data: Value) -> DbResult<Value> {
        validate_record_id(record_id)?;
        let record_id = record_id.to_string();
        let upserted = self
            .executor
            .execute_with_retry(move |conn| {
                let record_id = record_id.clone();
                let data = data.clone();
                Box::pin(async move { conn.upsert(&record_id, Some(data)).await })
            })
            .await?;
        normalize_single(upserted).ok_or_else(|| DbError::protocol("Upsert returned no record"))
    }

    /// Upsert records keyed on `key_field` as `table:<key>`; records without
    /// the key are inserted.
    pub async fn upsert_many(
        &self,
        table: &str,
        data: Vec<Value>,
        key_field: &str,
    ) -> DbResult<Vec<Value>> {
        validate_identifier(table)?;
        let mut results = Vec::with_capacity(data.len());
        for record in data {
            let result = match keyed_record_id(table, &record, key_field) {
                Some(record_id) => self.upsert_one(&record_id, record).await?,
                None => self.insert_one(table, record).await?,
            };
            results.push(result);
        }
        Ok(results)
    }

    /// Delete one record; `false` if it did not exist.
    pub async fn delete_one(&self, record_id: &str) -> DbResult<bool> {
        validate_record_id(record_id)?;
        let record_id = record_id.to_string();
        let deleted = self
            .executor
            .execute_with_retry(move |conn| {
                let record_id = record_id.clone();
                Box::pin(async move { conn.delete(&record_id).await })
            })
            .await?;
        Ok(normalize_single(deleted).is_some())
    }

    /// Delete every record of `table` matching `filter`; returns how many.
    pub async fn delete_many(&self, table: &str, filter: &Filter) -> DbResult<usize> {
        let statement = build_delete(table, Some(filter))?;
        Ok(self.run_query(statement).await?.len())
    }

    pub async fn select_one(&self, record_id: &str) -> DbResult<Option<Value>> {
        validate_record_id(record_id)?;
        let record_id = record_id.to_string();
        let selected = self
            .executor
            .execute_with_retry(move |conn| {
                let record_id = record_id.clone();
                Box::pin(async move { conn.select(&record_id).await })
            })
            .await?;
        Ok(normalize_single(selected))
    }

    pub async fn select_many(
        &self,
        table: &str,
        filter: Option<&Filter>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> DbResult<Vec<Value>> {
        let statement = build_select(table, filter, limit, offset)?;
        self.run_query(statement).await
    }

    pub async fn count(&self, table: &str, filter: Option<&Filter>) -> DbResult<u64> {
        let statement = build_count(table, filter)?;
        Ok(count_of(&self.run_query(statement).await?))
    }

    pub async fn exists(&self, record_id: &str) -> DbResult<bool> {
        let statement = build_exists(record_id)?;
        Ok(exists_of(&self.run_query(statement).await?))
    }

    /// Select records matching a suffix-operator filter object such as
    /// `{"age__gte": 18, "name": "Bob"}`.
    pub async fn find(&self, table: &str, filters: &Value) -> DbResult<Vec<Value>> {
        let filter = Filter::from_value(filters)?;
        self.select_many(table, Some(&filter), None, None).await
    }

    async fn run_query(&self, statement: String) -> DbResult<Vec<Value>> {
        self.executor
            .execute_with_retry(move |conn| {
                let statement = statement.clone();
                Box::pin(async move { conn.query(&statement, None).await })
            })
            .await
    }
}

/// Blocking CRUD helpers.
pub struct SyncCrudHelpers<'e, E: SyncExecutor> {
    executor: &'e E,
}

impl<'e, E: SyncExecutor> SyncCrudHelpers<'e, E> {
    pub fn new(executor: &'e E) -> Self {
        Self { executor }
    }

    /// Create one record in `table`; returns the created record.
    pub fn insert_one(&self, table: &str, data: Value) -> DbResult<Value> {
        validate_identifier(table)?;
        let created = self
            .executor
            .execute_with_retry(|conn| conn.create(table, Some(data.clone())))?;
        normalize_single(created).ok_or_else(|| DbError::protocol("Create returned no record"))
    }

    pub fn insert_many(&self, table: &str, data: Vec<Value>) -> DbResult<Vec<Value>> {
        validate_identifier(table)?;
        let payload = Value::Array(data);
        let inserted = self
            .executor
            .execute_with_retry(|conn| conn.insert(table, payload.clone()))?;
        Ok(normalize_many(inserted))
    }

    pub fn update_one(&self, record_id: &str, data: Value, merge: bool) -> DbResult<Option<Value>> {
        validate_record_id(record_id)?;
        let updated = self.executor.execute_with_retry(|conn| {
            if merge {
                conn.merge(record_id, Some(data.clone()))
            } else {
                conn.update(record_id, Some(data.clone()))
            }
        })?;
        Ok(normalize_single(updated))
    }

    pub fn update_many(
        &self,
        table: &str,
        filter: &Filter,
        data: &Value,
        merge: bool,
    ) -> DbResult<Vec<Value>> {
        let statement = build_update(table, Some(filter), object_of(data)?, merge)?;
        self.run_query(&statement)
    }

    pub fn upsert_one(&self, record_id: &str, data: Value) -> DbResult<Value> {
        validate_record_id(record_id)?;
        let upserted = self
            .executor
            .execute_with_retry(|conn| conn.upsert(record_id, Some(data.clone())))?;
        normalize_single(upserted).ok_or_else(|| DbError::protocol("Upsert returned no record"))
    }

    pub fn upsert_many(&self, table: &str, data: Vec<Value>, key_field: &str) -> DbResult<Vec<Value>> {
        validate_identifier(table)?;
        data.into_iter()
            .map(|record| match keyed_record_id(table, &record, key_field) {
                Some(record_id) => self.upsert_one(&record_id, record),
                None => self.insert_one(table, record),
            })
            .collect()
    }

    pub fn delete_one(&self, record_id: &str) -> DbResult<bool> {
        validate_record_id(record_id)?;
        let deleted = self.executor.execute_with_retry(|conn| conn.delete(record_id))?;
        Ok(normalize_single(deleted).is_some())
    }

    pub fn delete_many(&self, table: &str, filter: &Filter) -> DbResult<usize> {
        let statement = build_delete(table, Some(filter))?;
        Ok(self.run_query(&statement)?.len())
    }

    pub fn select_one(&self, record_id: &str) -> DbResult<Option<Value>> {
        validate_record_id(record_id)?;
        let selected = self.executor.execute_with_retry(|conn| conn.select(record_id))?;
        Ok(normalize_single(selected))
    }

    pub fn select_many(
        &self,
        table: &str,
        filter: Option<&Filter>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> DbResult<Vec<Value>> {
        let statement = build_select(table, filter, limit, offset)?;
        self.run_query(&statement)
    }

    pub fn count(&self, table: &str, filter: Option<&Filter>) -> DbResult<u64> {
        let statement = build_count(table, filter)?;
        Ok(count_of(&self.run_query(&statement)?))
    }

    pub fn exists(&self, record_id: &str) -> DbResult<bool> {
        let statement = build_exists(record_id)?;
        Ok(exists_of(&self.run_query(&statement)?))
    }

    pub fn find(&self, table: &str, filters: &Value) -> DbResult<Vec<Value>> {
        let filter = Filter::from_value(filters)?;
        self.select_many(table, Some(&filter), None, None)
    }

    fn run_query(&self, statement: &str) -> DbResult<Vec<Value>> {
        self.executor
            .execute_with_retry(|conn| conn.query(statement, None))
    }
}
