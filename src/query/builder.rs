//! SurrealQL statement builders used by the CRUD helpers.

use crate::error::{DbError, DbResult};
use crate::query::filter::{Filter, to_literal, validate_identifier};
use serde_json::{Map, Value};

/// `SELECT * FROM table [WHERE ..] [LIMIT n] [START n]`.
///
/// A zero limit or offset is omitted.
pub fn build_select(
    table: &str,
    filter: Option<&Filter>,
    limit: Option<usize>,
    offset: Option<usize>,
) -> DbResult<String> {
    validate_identifier(table)?;
    let mut query = format!("SELECT * FROM {table}{}", where_of(filter));
    if let Some(limit) = limit.filter(|n| *n > 0) {
        query.push_str(&format!(" LIMIT {limit}"));
    }
    if let Some(offset) = offset.filter(|n| *n > 0) {
        query.push_str(&format!(" START {offset}"));
    }
    Ok(query)
}

/// `SELECT count() FROM table [WHERE ..] GROUP ALL`.
pub fn build_count(table: &str, filter: Option<&Filter>) -> DbResult<String> {
    validate_identifier(table)?;
    Ok(format!(
        "SELECT count() FROM {table}{} GROUP ALL",
        where_of(filter)
    ))
}

/// `UPDATE table SET a = .., b = .. [WHERE ..]`, or with `merge`
/// `UPDATE table MERGE {a: ..} [WHERE ..]`.
pub fn build_update(
    table: &str,
    filter: Option<&Filter>,
    data: &Map<String, Value>,
    merge: bool,
) -> DbResult<String> {
    validate_identifier(table)?;
    if data.is_empty() {
        return Err(DbError::invalid_input("Update data cannot be empty"));
    }
    for field in data.keys() {
        validate_identifier(field)?;
    }

    let changes = if merge {
        format!("MERGE {}", to_literal(&Value::Object(data.clone())))
    } else {
        let assignments = data
            .iter()
            .map(|(field, value)| format!("{field} = {}", to_literal(value)))
            .collect::<Vec<_>>()
            .join(", ");
        format!("SET {assignments}")
    };
    Ok(format!("UPDATE {table} {changes}{}", where_of(filter)))
}

/// `DELETE FROM table [WHERE ..] RETURN BEFORE`.
///
/// Returning the deleted rows lets callers count them.
pub fn build_delete(table: &str, filter: Option<&Filter>) -> DbResult<String> {
    validate_identifier(table)?;
    Ok(format!(
        "DELETE FROM {table}{} RETURN BEFORE",
        where_of(filter)
    ))
}

/// `RETURN record::exists(r'table:id')`.
pub fn build_exists(record_id: &str) -> DbResult<String> {
    validate_record_id(record_id)?;
    Ok(format!("RETURN record::exists(r{})", to_literal(&Value::from(record_id))))
}

/// A record id is `table:key` with a valid table name and a non-empty key.
pub fn validate_record_id(record_id: &str) -> DbResult<&str> {
    match record_id.split_once(':') {
        Some((table, key)) if !key.is_empty() => {
            validate_identifier(table)?;
            Ok(record_id)
        }
        _ => Err(DbError::invalid_input(format!(
            "Invalid record id '{record_id}', expected table:key"
        ))),
    }
}

fn where_of(filter: Option<&Filter>) -> String {
    filter.map(Filter::to_where).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filter(value: Value) -> Filter {
        Filter::from_value(&value).unwrap()
    }

    #[test]
    fn test_build_select() {
        assert_eq!(build_select("user", None, None, None).unwrap(), "SELECT * FROM user");
        assert_eq!(
            build_select("user", Some(&filter(json!({"age__gte": 18}))), Some(10), Some(20))
                .unwrap(),
            "SELECT * FROM user WHERE age >= 18 LIMIT 10 START 20"
        );
        assert_eq!(
            build_select("user", None, Some(0), Some(0)).unwrap(),
            "SELECT * FROM user"
        );
    }

    #[test]
    fn test_build_count() {
        assert_eq!(
            build_count("user", None).unwrap(),
            "SELECT count() FROM user GROUP ALL"
        );
        assert_eq!(
            build_count("user", Some(&Filter::raw("active = true"))).unwrap(),
            "SELECT count() FROM user WHERE active = true GROUP ALL"
        );
    }

    #[test]
    fn test_build_update_set_and_merge() {
        let data = json!({"status": "archived", "score": 0});
        let data = data.as_object().unwrap();
        let f = filter(json!({"age__lt": 18}));

        assert_eq!(
            build_update("user", Some(&f), data, false).unwrap(),
            "UPDATE user SET status = 'archived', score = 0 WHERE age < 18"
        );
        assert_eq!(
            build_update("user", None, data, true).unwrap(),
            "UPDATE user MERGE {status: 'archived', score: 0}"
        );
    }

    #[test]
    fn test_build_update_rejects_empty_and_bad_fields() {
        assert!(build_update("user", None, &Map::new(), false).is_err());
        let data = json!({"a = 1; DELETE user; --": 1});
        assert!(build_update("user", None, data.as_object().unwrap(), false).is_err());
    }

    #[test]
    fn test_build_delete() {
        assert_eq!(
            build_delete("user", Some(&filter(json!({"name": "Bob"})))).unwrap(),
            "DELETE FROM user WHERE name = 'Bob' RETURN BEFORE"
        );
    }

    #[test]
    fn test_build_exists() {
        assert_eq!(
            build_exists("user:john").unwrap(),
            "RETURN record::exists(r'user:john')"
        );
        assert!(build_exists("user").is_err());
    }

    #[test]
    fn test_invalid_table_name() {
        assert!(matches!(
            build_select("user WHERE 1=1", None, None, None),
            Err(DbError::InvalidInput { .. })
        ));
    }
}
