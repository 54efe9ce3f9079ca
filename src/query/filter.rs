//! Suffix-operator filters.
//!
//! Filter keys carry their comparison in a suffix: `age__gte` means
//! `age >= value`, a key without a known suffix means equality. The
//! translation is purely syntactic and independent of the value's type.
//! Conditions are joined with `AND` in the order they were supplied.
//!
//! # Examples
//!
//! ```
//! use serde_json::json;
//! use surreal_conn::query::Filter;
//!
//! let filter = Filter::from_value(&json!({"age__gte": 18, "name": "Bob"})).unwrap();
//! assert_eq!(filter.to_where(), " WHERE age >= 18 AND name = 'Bob'");
//! ```

use crate::error::{DbError, DbResult};
use serde_json::{Map, Value};
use std::fmt::Write as _;

/// Comparison selected by a filter key suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Set membership; needs an array value.
    In,
    /// Containment or substring test.
    Contains,
}

/// Recognised suffixes, longest first where they share a prefix.
const SUFFIXES: &[(&str, FilterOperator)] = &[
    ("__gte", FilterOperator::Gte),
    ("__lte", FilterOperator::Lte),
    ("__gt", FilterOperator::Gt),
    ("__lt", FilterOperator::Lt),
    ("__ne", FilterOperator::Ne),
    ("__in", FilterOperator::In),
    ("__contains", FilterOperator::Contains),
];

impl FilterOperator {
    /// SurrealQL operator text.
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::In => "IN",
            Self::Contains => "CONTAINS",
        }
    }

    /// Split a filter key into its field and operator.
    ///
    /// A key made only of a suffix (`__gt`) is treated as a plain field.
    pub fn parse_key(key: &str) -> (&str, Self) {
        SUFFIXES
            .iter()
            .find_map(|(suffix, op)| {
                key.strip_suffix(suffix)
                    .filter(|field| !field.is_empty())
                    .map(|field| (field, *op))
            })
            .unwrap_or((key, Self::Eq))
    }
}

/// One `field <op> value` predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub operator: FilterOperator,
    pub value: Value,
}

impl Condition {
    /// Build a condition, rejecting field names that are not plain
    /// identifiers.
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: Value) -> DbResult<Self> {
        let field = field.into();
        validate_identifier(&field)?;
        Ok(Self {
            field,
            operator,
            value,
        })
    }

    /// Render as SurrealQL.
    ///
    /// `In` with a non-array value falls back to equality.
    pub fn render(&self) -> String {
        let operator = match (self.operator, &self.value) {
            (FilterOperator::In, value) if !value.is_array() => FilterOperator::Eq,
            (op, _) => op,
        };
        format!("{} {} {}", self.field, operator.symbol(), to_literal(&self.value))
    }
}

/// A WHERE clause: conditions from a suffix map, or caller-written text.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Conditions(Vec<Condition>),
    /// Inserted verbatim. Never build this from untrusted input.
    Raw(String),
}

impl Default for Filter {
    fn default() -> Self {
        Self::Conditions(Vec::new())
    }
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate a suffix-operator map, keeping its key order.
    pub fn from_map(map: &Map<String, Value>) -> DbResult<Self> {
        let conditions = map
            .iter()
            .map(|(key, value)| {
                let (field, operator) = FilterOperator::parse_key(key);
                Condition::new(field, operator, value.clone())
            })
            .collect::<DbResult<Vec<_>>>()?;
        Ok(Self::Conditions(conditions))
    }

    /// Translate a JSON object of suffix-operator keys.
    pub fn from_value(value: &Value) -> DbResult<Self> {
        match value {
            Value::Object(map) => Self::from_map(map),
            Value::Null => Ok(Self::default()),
            other => Err(DbError::invalid_input(format!(
                "Filter must be an object, got {other}"
            ))),
        }
    }

    pub fn raw(clause: impl Into<String>) -> Self {
        Self::Raw(clause.into())
    }

    /// Add a condition. Turns a raw filter into a conjunction with it.
    pub fn and(self, field: &str, operator: FilterOperator, value: Value) -> DbResult<Self> {
        let condition = Condition::new(field, operator, value)?;
        Ok(match self {
            Self::Conditions(mut conditions) => {
                conditions.push(condition);
                Self::Conditions(conditions)
            }
            Self::Raw(clause) => Self::Raw(format!("({clause}) AND {}", condition.render())),
        })
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Conditions(conditions) => conditions.is_empty(),
            Self::Raw(clause) => clause.trim().is_empty(),
        }
    }

    /// The predicate text without `WHERE`, or `None` when empty.
    pub fn to_clause(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        Some(match self {
            Self::Conditions(conditions) => conditions
                .iter()
                .map(Condition::render)
                .collect::<Vec<_>>()
                .join(" AND "),
            Self::Raw(clause) => clause.trim().to_string(),
        })
    }

    /// ` WHERE <clause>` with a leading space, or an empty string.
    pub fn to_where(&self) -> String {
        self.to_clause()
            .map(|clause| format!(" WHERE {clause}"))
            .unwrap_or_default()
    }
}

/// Render a JSON value as a SurrealQL literal.
///
/// Strings are single-quoted with `\` and `'` escaped.
pub fn to_literal(value: &Value) -> String {
    let mut out = String::new();
    write_literal(&mut out, value);
    out
}

fn write_literal(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("NULL"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            let _ = write!(out, "{n}");
        }
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_literal(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            out.push('{');
            for (i, (key, item)) in map.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                if is_bare_key(key) {
                    out.push_str(key);
                } else {
                    write_string(out, key);
                }
                out.push_str(": ");
                write_literal(out, item);
            }
            out.push('}');
        }
    }
}

fn write_string(out: &mut String, s: &str) {
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            c => out.push(c),
        }
    }
    out.push('\'');
}

fn is_bare_key(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Accept table and field names made of ASCII letters, digits, `_`, `.`,
/// `:` and backticks.
pub fn validate_identifier(name: &str) -> DbResult<&str> {
    if name.is_empty() {
        return Err(DbError::invalid_input("Identifier cannot be empty"));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '`')))
    {
        return Err(DbError::invalid_input(format!(
            "Invalid character {bad:?} in identifier '{name}'"
        )));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_key_suffixes() {
        assert_eq!(FilterOperator::parse_key("age__gte"), ("age", FilterOperator::Gte));
        assert_eq!(FilterOperator::parse_key("age__gt"), ("age", FilterOperator::Gt));
        assert_eq!(FilterOperator::parse_key("age__lte"), ("age", FilterOperator::Lte));
        assert_eq!(FilterOperator::parse_key("age__lt"), ("age", FilterOperator::Lt));
        assert_eq!(FilterOperator::parse_key("name__ne"), ("name", FilterOperator::Ne));
        assert_eq!(FilterOperator::parse_key("tag__in"), ("tag", FilterOperator::In));
        assert_eq!(
            FilterOperator::parse_key("tags__contains"),
            ("tags", FilterOperator::Contains)
        );
        assert_eq!(FilterOperator::parse_key("name"), ("name", FilterOperator::Eq));
        assert_eq!(FilterOperator::parse_key("__gt"), ("__gt", FilterOperator::Eq));
    }

    #[test]
    fn test_filter_preserves_order_and_quotes_strings() {
        let filter = Filter::from_value(&json!({"age__gte": 18, "name": "Bob"})).unwrap();
        assert_eq!(
            filter.to_clause().unwrap(),
            "age >= 18 AND name = 'Bob'"
        );

        let filter = Filter::from_value(&json!({"name": "Bob", "age__lt": 65})).unwrap();
        assert_eq!(filter.to_clause().unwrap(), "name = 'Bob' AND age < 65");
    }

    #[test]
    fn test_in_operator() {
        let filter = Filter::from_value(&json!({"status__in": ["a", "b"]})).unwrap();
        assert_eq!(filter.to_clause().unwrap(), "status IN ['a', 'b']");

        let filter = Filter::from_value(&json!({"status__in": "a"})).unwrap();
        assert_eq!(filter.to_clause().unwrap(), "status = 'a'");
    }

    #[test]
    fn test_contains_and_ne() {
        let filter =
            Filter::from_value(&json!({"tags__contains": "rust", "active__ne": false})).unwrap();
        assert_eq!(
            filter.to_clause().unwrap(),
            "tags CONTAINS 'rust' AND active != false"
        );
    }

    #[test]
    fn test_literal_escaping() {
        assert_eq!(to_literal(&json!("O'Brien")), r"'O\'Brien'");
        assert_eq!(to_literal(&json!("a\\b")), r"'a\\b'");
        assert_eq!(to_literal(&json!(null)), "NULL");
        assert_eq!(to_literal(&json!(1.5)), "1.5");
        assert_eq!(
            to_literal(&json!({"a": 1, "b c": "x"})),
            "{a: 1, 'b c': 'x'}"
        );
    }

    #[test]
    fn test_empty_filter() {
        let filter = Filter::from_value(&json!({})).unwrap();
        assert!(filter.is_empty());
        assert_eq!(filter.to_where(), "");
    }

    #[test]
    fn test_rejects_injection_in_field() {
        let result = Filter::from_value(&json!({"name; DELETE user": 1}));
        assert!(matches!(result, Err(DbError::InvalidInput { .. })));
    }

    #[test]
    fn test_raw_filter_and_condition() {
        let filter = Filter::raw("age > 18")
            .and("name", FilterOperator::Eq, json!("Bob"))
            .unwrap();
        assert_eq!(filter.to_clause().unwrap(), "(age > 18) AND name = 'Bob'");
    }

    #[test]
    fn test_non_object_filter_rejected() {
        assert!(Filter::from_value(&json!([1, 2])).is_err());
    }
}
