use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::OnceLock;

use super::QueryBuildError;

/// A literal bound to a `$n` placeholder.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl SqlParam {
    /// Converts a scalar JSON value. Arrays and objects are not literals.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => Some(SqlParam::Null),
            serde_json::Value::Bool(b) => Some(SqlParam::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(SqlParam::Int)
                .or_else(|| n.as_f64().map(SqlParam::Float)),
            serde_json::Value::String(s) => Some(SqlParam::Text(s.clone())),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
        }
    }

    /// Escaped SQL literal for value substitution.
    pub fn to_sql_literal(&self) -> String {
        match self {
            SqlParam::Null => "NULL".to_string(),
            SqlParam::Bool(true) => "TRUE".to_string(),
            SqlParam::Bool(false) => "FALSE".to_string(),
            SqlParam::Int(i) => i.to_string(),
            SqlParam::Float(f) if f.is_finite() => f.to_string(),
            SqlParam::Float(_) => "NULL".to_string(),
            SqlParam::Text(s) => format!("'{}'", s.replace('\'', "''")),
            SqlParam::Date(d) => format!("DATE '{}'", d.format("%Y-%m-%d")),
            SqlParam::Timestamp(ts) => format!("TIMESTAMP '{}'", ts.format("%Y-%m-%d %H:%M:%S%.f")),
        }
    }
}

impl fmt::Display for SqlParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlParam::Text(s) => write!(f, "{}", s),
            other => write!(f, "{}", other.to_sql_literal()),
        }
    }
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        SqlParam::Text(value.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        SqlParam::Text(value)
    }
}

impl From<i32> for SqlParam {
    fn from(value: i32) -> Self {
        SqlParam::Int(value.into())
    }
}

impl From<i64> for SqlParam {
    fn from(value: i64) -> Self {
        SqlParam::Int(value)
    }
}

impl From<f64> for SqlParam {
    fn from(value: f64) -> Self {
        SqlParam::Float(value)
    }
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$(\d+)").expect("placeholder regex is valid"))
}

/// Distinct placeholder indexes used in `sql`, ascending.
pub fn placeholder_indexes(sql: &str) -> Vec<usize> {
    let mut indexes: Vec<usize> = placeholder_regex()
        .captures_iter(sql)
        .filter_map(|c| c[1].parse().ok())
        .collect();
    indexes.sort_unstable();
    indexes.dedup();
    indexes
}

/// Checks that placeholders are exactly `$1..=$n` for `n` params.
pub fn check_placeholders(sql: &str, params: &[SqlParam]) -> Result<(), QueryBuildError> {
    let indexes = placeholder_indexes(sql);
    let expected: Vec<usize> = (1..=params.len()).collect();
    if indexes != expected {
        return Err(QueryBuildError::PlaceholderMismatch {
            placeholders: indexes.len(),
            params: params.len(),
        });
    }
    Ok(())
}

/// Substitutes every `$n` with the escaped literal of `params[n - 1]`.
///
/// The backing store receives plain SQL text, so this is the only place
/// values meet the statement. The regex matches whole numbers, so `$12` is
/// never read as `$1` followed by `2`.
pub fn render_sql(sql: &str, params: &[SqlParam]) -> Result<String, QueryBuildError> {
    let mut missing = None;
    let rendered = placeholder_regex().replace_all(sql, |caps: &regex::Captures| {
        let literal = caps[1]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i))
            .map(SqlParam::to_sql_literal);
        match literal {
            Some(literal) => literal,
            None => {
                missing.get_or_insert_with(|| caps[0].to_string());
                String::new()
            }
        }
    });

    if let Some(placeholder) = missing {
        return Err(QueryBuildError::UnboundPlaceholder(placeholder));
    }
    Ok(rendered.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_literals_are_escaped() {
        let sql = render_sql("name = $1", &[SqlParam::from("O'Brien")]).unwrap();
        assert_eq!(sql, "name = 'O''Brien'");
    }

    #[test]
    fn double_digit_placeholders_are_not_split() {
        let params: Vec<SqlParam> = (1..=12).map(SqlParam::Int).collect();
        let sql = render_sql("a = $1 AND b = $12 AND c = $10", &params).unwrap();
        assert_eq!(sql, "a = 1 AND b = 12 AND c = 10");
    }

    #[test]
    fn dates_nulls_and_non_finite_floats() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let sql = render_sql(
            "d >= $1 AND x = $2 AND y = $3",
            &[SqlParam::Date(date), SqlParam::Null, SqlParam::Float(f64::NAN)],
        )
        .unwrap();
        assert_eq!(sql, "d >= DATE '2024-03-01' AND x = NULL AND y = NULL");
    }

    #[test]
    fn unbound_placeholder_is_an_error() {
        let err = render_sql("a = $1 AND b = $2", &[SqlParam::Int(1)]).unwrap_err();
        assert!(matches!(err, QueryBuildError::UnboundPlaceholder(p) if p == "$2"));
    }

    #[test]
    fn placeholder_check_requires_contiguous_numbering() {
        assert!(check_placeholders("a = $1 AND b = $2", &[SqlParam::Int(1), SqlParam::Int(2)]).is_ok());
        assert!(check_placeholders("a = $2", &[SqlParam::Int(1)]).is_err());
        assert!(check_placeholders("a = 1", &[]).is_ok());
    }
}
