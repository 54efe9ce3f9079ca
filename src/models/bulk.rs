//! Bulk operation models.

use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single update in a bulk update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkUpdateItem {
    pub record_id: String,
    pub data: Value,
    /// Merge into the record instead of replacing it.
    #[serde(default)]
    pub merge: bool,
}

impl BulkUpdateItem {
    pub fn replace(record_id: impl Into<String>, data: Value) -> Self {
        Self {
            record_id: record_id.into(),
            data,
            merge: false,
        }
    }

    pub fn merge(record_id: impl Into<String>, data: Value) -> Self {
        Self {
            record_id: record_id.into(),
            data,
            merge: true,
        }
    }
}

/// Failure of one item in a bulk operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkError {
    /// Position of the item in the submitted batch.
    pub index: usize,
    pub error: String,
    /// The item that failed, when it carried data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<Value>,
}

/// Aggregate outcome of a bulk operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkResult {
    pub success_count: usize,
    pub error_count: usize,
    pub errors: Vec<BulkError>,
    pub results: Vec<Value>,
}

impl BulkResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful item.
    pub fn push_success(&mut self, result: Value) {
        self.success_count += 1;
        self.results.push(result);
    }

    /// Record a failed item.
    pub fn push_error(&mut self, index: usize, error: &DbError, item: Option<Value>) {
        self.error_count += 1;
        self.errors.push(BulkError {
            index,
            error: error.to_string(),
            item,
        });
    }

    /// Total number of operations attempted.
    pub fn total_count(&self) -> usize {
        self.success_count + self.error_count
    }

    /// Success rate as a percentage; 0.0 for an empty batch.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_count();
        if total == 0 {
            return 0.0;
        }
        (self.success_count as f64 / total as f64) * 100.0
    }

    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }

    /// Turn a batch with failures into `DbError::Bulk`.
    pub fn into_result(self) -> DbResult<Self> {
        if self.has_errors() {
            let message = self
                .errors
                .first()
                .map(|e| format!("item {}: {}", e.index, e.error))
                .unwrap_or_default();
            return Err(DbError::bulk(message, self.error_count));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_result() {
        let result = BulkResult::new();
        assert_eq!(result.total_count(), 0);
        assert_eq!(result.success_rate(), 0.0);
        assert!(result.into_result().is_ok());
    }

    #[test]
    fn test_counts_and_rate() {
        let mut result = BulkResult::new();
        result.push_success(json!({"id": "user:1"}));
        result.push_success(json!({"id": "user:2"}));
        result.push_success(json!({"id": "user:3"}));
        result.push_error(3, &DbError::protocol("duplicate"), Some(json!({"name": "x"})));

        assert_eq!(result.total_count(), 4);
        assert_eq!(result.success_rate(), 75.0);
        assert_eq!(result.errors[0].index, 3);
        assert_eq!(result.results.len(), 3);
    }

    #[test]
    fn test_into_result_with_errors() {
        let mut result = BulkResult::new();
        result.push_error(0, &DbError::protocol("boom"), None);
        let err = result.into_result().unwrap_err();
        assert!(matches!(err, DbError::Bulk { error_count: 1, .. }));
        assert!(err.to_string().contains("item 0"));
    }

    #[test]
    fn test_update_item_constructors() {
        assert!(!BulkUpdateItem::replace("user:1", json!({})).merge);
        assert!(BulkUpdateItem::merge("user:1", json!({})).merge);
    }
}
