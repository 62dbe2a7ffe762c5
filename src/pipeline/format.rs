use serde_json::Value;
use std::fmt::Write;
use thiserror::Error;

use crate::db::Row;
use crate::query::{QueryBuilderResult, UserContext};
use crate::util::truncate_chars;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("row {row} could not be serialized: {source}")]
    Row {
        row: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("formatter produced no output")]
    Empty,
}

/// Turns result rows into the grounding block handed to the answer prompt.
/// Answer figures are verified against this block, so it carries retrieved
/// data only; the question reaches the prompt separately.
pub trait ContextFormatter: Send + Sync {
    fn format(
        &self,
        rows: &[Row],
        user: &UserContext,
        built: &QueryBuilderResult,
    ) -> Result<String, FormatError>;
}

#[derive(Debug, Clone)]
pub struct GroundingFormatter {
    pub max_rows: usize,
    pub max_value_chars: usize,
}

impl Default for GroundingFormatter {
    fn default() -> Self {
        Self {
            max_rows: 50,
            max_value_chars: 200,
        }
    }
}

impl GroundingFormatter {
    fn render_value(&self, row: usize, value: &Value) -> Result<String, FormatError> {
        let text = match value {
            Value::Null => "null".to_string(),
            Value::String(s) => s.clone(),
            other => serde_json::to_string(other).map_err(|source| FormatError::Row { row, source })?,
        };
        Ok(truncate_chars(&text, self.max_value_chars))
    }
}

impl ContextFormatter for GroundingFormatter {
    fn format(&self, rows: &[Row], user: &UserContext, built: &QueryBuilderResult) -> Result<String, FormatError> {
        let shown = rows.len().min(self.max_rows);
        let mut out = String::new();

        let who = user.display_name.as_deref().unwrap_or(&user.user_id);
        let _ = writeln!(out, "User: {} (role: {})", who, user.role);
        let _ = writeln!(out, "Query: {}", built.explanation);
        let _ = writeln!(out, "Rows returned: {} (showing {})", rows.len(), shown);

        for (i, row) in rows.iter().take(shown).enumerate() {
            let fields = row
                .iter()
                .map(|(column, value)| Ok(format!("{}: {}", column, self.render_value(i, value)?)))
                .collect::<Result<Vec<String>, FormatError>>()?;
            let _ = writeln!(out, "[{}] {}", i + 1, fields.join("; "));
        }

        if out.trim().is_empty() {
            return Err(FormatError::Empty);
        }
        Ok(out)
    }
}

/// Fallback grounding when the formatter fails: rows as compact JSON.
pub fn raw_dump(rows: &[Row], max_chars: usize) -> String {
    let body = rows
        .iter()
        .map(|row| serde_json::to_string(row).unwrap_or_else(|_| format!("{:?}", row)))
        .collect::<Vec<_>>()
        .join("\n");
    format!("Raw results ({} rows):\n{}", rows.len(), truncate_chars(&body, max_chars))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn built() -> QueryBuilderResult {
        QueryBuilderResult {
            sql: "SELECT accounts.name FROM accounts".into(),
            params: Vec::new(),
            explanation: "List accounts".into(),
            affected_tables: vec!["accounts".into()],
            warnings: Vec::new(),
        }
    }

    #[test]
    fn caps_rows_and_reports_totals() {
        let rows: Vec<Row> = (1..=5).map(|n| row(json!({"name": format!("Acct {}", n), "score": n * 10}))).collect();
        let formatter = GroundingFormatter {
            max_rows: 2,
            max_value_chars: 50,
        };
        let mut user = UserContext::new("u1", "rep");
        user.display_name = Some("Dana".into());

        let text = formatter.format(&rows, &user, &built()).unwrap();
        assert!(text.contains("User: Dana (role: rep)"));
        assert!(text.contains("Rows returned: 5 (showing 2)"));
        assert!(text.contains("[2] name: Acct 2; score: 20"));
        assert!(!text.contains("[3]"));
        assert!(!text.contains("Question"));
    }

    #[test]
    fn long_values_are_truncated() {
        let rows = vec![row(json!({"notes": "x".repeat(40)}))];
        let formatter = GroundingFormatter {
            max_rows: 10,
            max_value_chars: 8,
        };
        let text = formatter.format(&rows, &UserContext::anonymous("u1"), &built()).unwrap();
        assert!(text.contains("notes: xxxxxxxx..."));
    }

    #[test]
    fn raw_dump_is_bounded() {
        let rows: Vec<Row> = (0..100).map(|n| row(json!({"id": n}))).collect();
        let dump = raw_dump(&rows, 30);
        assert!(dump.starts_with("Raw results (100 rows):"));
        assert!(dump.len() < 80);
    }
}
