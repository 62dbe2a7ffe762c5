use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use duckdb::types::ValueRef;
use serde_json::{Number, Value};
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

use super::{DuckDbPool, Row};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),
    #[error("execution task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("only single read-only statements may be executed")]
    NotReadOnly,
    #[error("{0}")]
    Remote(String),
}

/// Runs fully rendered, read-only SQL against the backing store.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<Vec<Row>, ExecutionError>;
}

/// Whether `sql` has a `;` outside quoted literals and identifiers, or
/// leaves a quote unterminated.
fn has_statement_break(sql: &str) -> bool {
    let mut quote: Option<char> = None;
    for c in sql.chars() {
        match quote {
            Some(open) if c == open => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == ';' => return true,
            None => {}
        }
    }
    quote.is_some()
}

/// A single SELECT/WITH statement, optionally followed by one trailing `;`.
pub fn is_read_only(sql: &str) -> bool {
    let trimmed = sql.trim().trim_end_matches(';').trim_end();
    if has_statement_break(trimmed) {
        return false;
    }
    let first = trimmed
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_uppercase();
    matches!(first.as_str(), "SELECT" | "WITH")
}

pub struct DuckDbExecutor {
    pool: DuckDbPool,
}

impl DuckDbExecutor {
    pub fn new(pool: DuckDbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueryExecutor for DuckDbExecutor {
    async fn execute(&self, sql: &str) -> Result<Vec<Row>, ExecutionError> {
        if !is_read_only(sql) {
            return Err(ExecutionError::NotReadOnly);
        }
        let pool = self.pool.clone();
        let sql = sql.to_string();
        let started = Instant::now();

        let rows = tokio::task::spawn_blocking(move || -> Result<Vec<Row>, ExecutionError> {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            let columns: Vec<String> = rows
                .as_ref()
                .map(|s| s.column_names())
                .unwrap_or_default();

            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut record = Row::new();
                for (i, name) in columns.iter().enumerate() {
                    record.insert(name.clone(), to_json(row.get_ref(i)?));
                }
                out.push(record);
            }
            Ok(out)
        })
        .await??;

        debug!("Query returned {} rows in {:?}", rows.len(), started.elapsed());
        Ok(rows)
    }
}

fn float(value: f64) -> Value {
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(b) => Value::Bool(b),
        ValueRef::TinyInt(i) => Value::from(i),
        ValueRef::SmallInt(i) => Value::from(i),
        ValueRef::Int(i) => Value::from(i),
        ValueRef::BigInt(i) => Value::from(i),
        ValueRef::HugeInt(i) => i64::try_from(i).map_or_else(|_| Value::String(i.to_string()), Value::from),
        ValueRef::UTinyInt(i) => Value::from(i),
        ValueRef::USmallInt(i) => Value::from(i),
        ValueRef::UInt(i) => Value::from(i),
        ValueRef::UBigInt(i) => Value::from(i),
        ValueRef::Float(f) => float(f as f64),
        ValueRef::Double(f) => float(f),
        ValueRef::Decimal(d) => d
            .to_string()
            .parse::<f64>()
            .map_or_else(|_| Value::String(d.to_string()), float),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Date32(days) => NaiveDate::from_num_days_from_ce_opt(days + 719_163)
            .map_or(Value::Null, |d| Value::String(d.format("%Y-%m-%d").to_string())),
        ValueRef::Timestamp(unit, raw) => DateTime::from_timestamp_micros(unit.to_micros(raw))
            .map_or(Value::Null, |ts| {
                Value::String(ts.naive_utc().format("%Y-%m-%d %H:%M:%S").to_string())
            }),
        other => Value::String(format!("{:?}", other.to_owned())),
    }
}
