//! Validates and defaults the classifier's JSON into a [`QueryIntent`].
//!
//! The classifier is a language model, so every field may be missing,
//! mistyped or invented. The guard never rejects a well-formed object: it
//! coerces what it can and records a warning for what it drops.

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::debug;

use super::{AggregationType, CompareOp, Filter, QueryCategory, QueryIntent, TimeRange};
use crate::query::SqlParam;

const DEFAULT_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Error)]
pub enum IntentError {
    #[error("classifier output is not a JSON object (got {0})")]
    NotAnObject(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedIntent {
    pub intent: QueryIntent,
    pub confidence: f64,
    pub explanation: String,
    pub group_by: Vec<String>,
    pub aggregate_field: Option<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct IntentGuard {
    fallback_table: String,
}

fn field_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
            .expect("field regex is valid")
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// First present key among spellings the classifier is known to use.
fn pick<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

impl IntentGuard {
    pub fn new(fallback_table: &str) -> Self {
        Self {
            fallback_table: fallback_table.to_string(),
        }
    }

    pub fn validate(&self, raw: &Value) -> Result<ClassifiedIntent, IntentError> {
        let obj = raw
            .as_object()
            .ok_or_else(|| IntentError::NotAnObject(json_kind(raw)))?;
        let mut warnings = Vec::new();

        let category = match pick(obj, &["category", "intent"]).and_then(Value::as_str) {
            Some(raw_category) => {
                let category = QueryCategory::coerce(raw_category);
                if category == QueryCategory::GeneralQuestion
                    && !raw_category.eq_ignore_ascii_case("general_question")
                {
                    warnings.push(format!("unknown category '{}' coerced to GENERAL_QUESTION", raw_category));
                }
                category
            }
            None => QueryCategory::GeneralQuestion,
        };

        let tables = self.tables(obj, &mut warnings);
        let filters = match pick(obj, &["filters", "filter"]) {
            Some(value) => parse_filters(value, &mut warnings),
            None => Vec::new(),
        };

        let (aggregation, aggregate_field) = parse_aggregation(obj, &mut warnings);
        let time_range = pick(obj, &["timeRange", "time_range"]).and_then(parse_time_range);

        let confidence = match pick(obj, &["confidence"]) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(DEFAULT_CONFIDENCE),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(DEFAULT_CONFIDENCE),
            _ => DEFAULT_CONFIDENCE,
        };
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            DEFAULT_CONFIDENCE
        };

        let explanation = pick(obj, &["explanation", "reasoning"])
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let group_by = pick(obj, &["groupBy", "group_by"])
            .map(string_list)
            .unwrap_or_default()
            .into_iter()
            .filter(|f| field_regex().is_match(f))
            .collect();

        debug!(
            "Classified intent: category={}, tables={:?}, filters={}, confidence={:.2}",
            category,
            tables,
            filters.len(),
            confidence
        );

        Ok(ClassifiedIntent {
            intent: QueryIntent {
                category,
                tables,
                filters,
                aggregation,
                time_range,
            },
            confidence,
            explanation,
            group_by,
            aggregate_field,
            warnings,
        })
    }

    fn tables(&self, obj: &Map<String, Value>, warnings: &mut Vec<String>) -> Vec<String> {
        let mut seen = HashSet::new();
        let tables: Vec<String> = pick(obj, &["tables", "table"])
            .map(string_list)
            .unwrap_or_default()
            .into_iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .filter(|t| seen.insert(t.clone()))
            .collect();

        if tables.is_empty() {
            warnings.push(format!("no tables classified, defaulting to '{}'", self.fallback_table));
            return vec![self.fallback_table.clone()];
        }
        tables
    }
}

fn parse_aggregation(
    obj: &Map<String, Value>,
    warnings: &mut Vec<String>,
) -> (Option<AggregationType>, Option<String>) {
    let Some(value) = pick(obj, &["aggregationType", "aggregation_type", "aggregation"]) else {
        return (None, None);
    };
    let (kind, field) = match value {
        Value::String(s) => (Some(s.as_str()), None),
        Value::Object(o) => (
            pick(o, &["type", "function"]).and_then(Value::as_str),
            pick(o, &["field", "column"]).and_then(Value::as_str),
        ),
        _ => (None, None),
    };
    let aggregation = kind.and_then(|k| {
        let parsed = AggregationType::parse(k);
        if parsed.is_none() && !k.eq_ignore_ascii_case("none") {
            warnings.push(format!("unsupported aggregation '{}' ignored", k));
        }
        parsed
    });
    let field = field
        .filter(|f| field_regex().is_match(f))
        .map(str::to_string);
    (aggregation, field)
}

fn parse_time_range(value: &Value) -> Option<TimeRange> {
    let range = match value {
        Value::String(s) => TimeRange {
            start: Some(s.clone()),
            end: None,
            field: None,
        },
        Value::Object(o) => TimeRange {
            start: pick(o, &["start", "from"]).and_then(Value::as_str).map(str::to_string),
            end: pick(o, &["end", "to"]).and_then(Value::as_str).map(str::to_string),
            field: pick(o, &["field", "column"])
                .and_then(Value::as_str)
                .filter(|f| field_regex().is_match(f))
                .map(str::to_string),
        },
        _ => return None,
    };
    if range.start.is_none() && range.end.is_none() {
        return None;
    }
    Some(range)
}

/// Accepts `{field: value | {op: value}}`, a single
/// `{field, operator, value}` entry, or an array of such entries.
pub fn parse_filters(value: &Value, warnings: &mut Vec<String>) -> Vec<Filter> {
    let mut filters = Vec::new();
    match value {
        Value::Object(map) if is_filter_entry(map) => parse_filter_entry(map, &mut filters, warnings),
        Value::Object(map) => {
            for (field, spec) in map {
                parse_field_spec(field, spec, &mut filters, warnings);
            }
        }
        Value::Array(items) => {
            for item in items {
                let Some(obj) = item.as_object() else {
                    warnings.push(format!("filter entry of type {} ignored", json_kind(item)));
                    continue;
                };
                parse_filter_entry(obj, &mut filters, warnings);
            }
        }
        Value::Null => {}
        other => warnings.push(format!("filters of type {} ignored", json_kind(other))),
    }
    filters
}

fn is_filter_entry(map: &Map<String, Value>) -> bool {
    pick(map, &["field", "column"]).is_some_and(Value::is_string)
        && pick(map, &["operator", "op"]).is_some_and(Value::is_string)
}

fn parse_filter_entry(obj: &Map<String, Value>, filters: &mut Vec<Filter>, warnings: &mut Vec<String>) {
    let Some(field) = pick(obj, &["field", "column"]).and_then(Value::as_str) else {
        warnings.push("filter entry without a field ignored".to_string());
        return;
    };
    let op = pick(obj, &["operator", "op"]).and_then(Value::as_str).unwrap_or("=");
    let operand = obj.get("value").unwrap_or(&Value::Null);
    push_operator(field, op, operand, filters, warnings);
}

fn parse_field_spec(field: &str, spec: &Value, filters: &mut Vec<Filter>, warnings: &mut Vec<String>) {
    match spec {
        Value::Object(ops) => {
            if let Some(op) = pick(ops, &["operator", "op"]).and_then(Value::as_str) {
                let operand = ops.get("value").unwrap_or(&Value::Null);
                push_operator(field, op, operand, filters, warnings);
            } else {
                for (op, operand) in ops {
                    push_operator(field, op, operand, filters, warnings);
                }
            }
        }
        Value::Array(_) => push_operator(field, "in", spec, filters, warnings),
        Value::Null => push_operator(field, "is null", &Value::Bool(true), filters, warnings),
        scalar => push_operator(field, "=", scalar, filters, warnings),
    }
}

fn scalars(value: &Value) -> Vec<SqlParam> {
    match value {
        Value::Array(items) => items.iter().filter_map(SqlParam::from_json).collect(),
        other => SqlParam::from_json(other).into_iter().collect(),
    }
}

fn push_operator(
    field: &str,
    op: &str,
    operand: &Value,
    filters: &mut Vec<Filter>,
    warnings: &mut Vec<String>,
) {
    if !field_regex().is_match(field) {
        warnings.push(format!("filter on invalid field name '{}' ignored", field));
        return;
    }
    let field = field.to_string();
    let normalized = op.trim().to_lowercase().replace(['_', '-'], " ");

    let compare = match normalized.as_str() {
        "=" | "==" | "eq" | "equals" | "is" => Some(CompareOp::Eq),
        "!=" | "<>" | "ne" | "neq" | "not equals" => Some(CompareOp::NotEq),
        ">" | "gt" | "greater than" => Some(CompareOp::Gt),
        ">=" | "gte" => Some(CompareOp::Gte),
        "<" | "lt" | "less than" => Some(CompareOp::Lt),
        "<=" | "lte" => Some(CompareOp::Lte),
        "like" | "contains" => Some(CompareOp::Like),
        _ => None,
    };

    if let Some(op) = compare {
        let value = match SqlParam::from_json(operand) {
            Some(SqlParam::Text(s)) if normalized == "contains" && !s.contains('%') => {
                SqlParam::Text(format!("%{}%", s))
            }
            Some(SqlParam::Null) if op == CompareOp::Eq => {
                filters.push(Filter::Null { field, negated: false });
                return;
            }
            Some(SqlParam::Null) if op == CompareOp::NotEq => {
                filters.push(Filter::Null { field, negated: true });
                return;
            }
            Some(value) => value,
            None => {
                warnings.push(format!("non-scalar value for '{} {}' ignored", field, op.as_sql()));
                return;
            }
        };
        filters.push(Filter::Compare { field, op, value });
        return;
    }

    match normalized.as_str() {
        "in" | "not in" | "nin" | "notin" => {
            let values = scalars(operand);
            if values.is_empty() {
                warnings.push(format!("empty list for '{}' ignored", field));
                return;
            }
            filters.push(Filter::InList {
                field,
                negated: normalized != "in",
                values,
            });
        }
        "is null" | "isnull" | "null" => filters.push(Filter::Null {
            field,
            negated: operand.as_bool() == Some(false),
        }),
        "is not null" | "isnotnull" | "not null" | "notnull" => filters.push(Filter::Null {
            field,
            negated: operand.as_bool() != Some(false),
        }),
        "between" => {
            let bounds = match operand {
                Value::Object(o) => vec![
                    pick(o, &["from", "min", "low", "start"]).and_then(SqlParam::from_json),
                    pick(o, &["to", "max", "high", "end"]).and_then(SqlParam::from_json),
                ],
                other => scalars(other).into_iter().map(Some).collect(),
            };
            match bounds.as_slice() {
                [Some(low), Some(high)] => filters.push(Filter::Between {
                    field,
                    low: low.clone(),
                    high: high.clone(),
                }),
                _ => warnings.push(format!("BETWEEN on '{}' needs exactly two bounds", field)),
            }
        }
        _ => warnings.push(format!("unsupported operator '{}' on '{}' ignored", op, field)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn guard() -> IntentGuard {
        IntentGuard::new("accounts")
    }

    #[test]
    fn well_formed_output_passes_through() {
        let classified = guard()
            .validate(&json!({
                "category": "ACCOUNT_QUERY",
                "tables": ["accounts"],
                "filters": {"engagement_score": {"gt": 70}},
                "confidence": 0.92,
                "explanation": "accounts by engagement"
            }))
            .unwrap();
        assert_eq!(classified.intent.category, QueryCategory::AccountQuery);
        assert_eq!(classified.intent.tables, vec!["accounts"]);
        assert_eq!(
            classified.intent.filters,
            vec![Filter::compare("engagement_score", CompareOp::Gt, 70)]
        );
        assert!((classified.confidence - 0.92).abs() < f64::EPSILON);
        assert!(classified.warnings.is_empty());
    }

    #[test]
    fn missing_fields_are_defaulted() {
        let classified = guard().validate(&json!({"category": "nonsense", "confidence": 7})).unwrap();
        assert_eq!(classified.intent.category, QueryCategory::GeneralQuestion);
        assert_eq!(classified.intent.tables, vec!["accounts"]);
        assert_eq!(classified.confidence, 1.0);
        assert_eq!(classified.warnings.len(), 2);
    }

    #[test]
    fn non_object_output_is_rejected() {
        assert!(guard().validate(&json!(["accounts"])).is_err());
    }

    #[test]
    fn filter_shapes_are_normalized() {
        let mut warnings = Vec::new();
        let filters = parse_filters(
            &json!({
                "status": "active",
                "type": ["customer", "partner"],
                "industry": null,
                "annual_revenue": {"between": [1000, 5000]},
                "name": {"operator": "contains", "value": "acme"}
            }),
            &mut warnings,
        );
        assert!(warnings.is_empty());
        assert_eq!(filters.len(), 5);
        assert!(filters.contains(&Filter::Null {
            field: "industry".into(),
            negated: false
        }));
        assert!(filters.contains(&Filter::compare("name", CompareOp::Like, "%acme%")));
        assert!(filters.contains(&Filter::InList {
            field: "type".into(),
            negated: false,
            values: vec![SqlParam::from("customer"), SqlParam::from("partner")],
        }));
    }

    #[test]
    fn filter_arrays_with_operator_objects() {
        let mut warnings = Vec::new();
        let filters = parse_filters(
            &json!([
                {"field": "x", "operator": ">", "value": 5},
                {"field": "y", "operator": "NOT IN", "value": [1, 2]},
                {"field": "drop table", "operator": "=", "value": 1},
                {"field": "z", "operator": "~", "value": 1}
            ]),
            &mut warnings,
        );
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0], Filter::compare("x", CompareOp::Gt, 5));
        assert!(matches!(&filters[1], Filter::InList { negated: true, values, .. } if values.len() == 2));
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn single_operator_entry_is_one_filter() {
        let guard = IntentGuard::new("accounts");
        let classified = guard
            .validate(&json!({
                "category": "DEAL_QUERY",
                "tables": ["deals"],
                "filters": {"field": "amount", "operator": ">", "value": 5}
            }))
            .unwrap();
        assert_eq!(classified.intent.filters, vec![Filter::compare("amount", CompareOp::Gt, 5)]);
        assert!(classified.warnings.is_empty());

        let mut warnings = Vec::new();
        let plain = parse_filters(&json!({"field": "stage", "status": "open"}), &mut warnings);
        assert_eq!(plain.len(), 2);
    }

    #[test]
    fn time_range_and_aggregation_variants() {
        let classified = guard()
            .validate(&json!({
                "tables": "activities",
                "aggregation": {"type": "avg", "field": "duration_minutes"},
                "timeRange": {"start": "this month", "end": null},
                "groupBy": ["type"]
            }))
            .unwrap();
        assert_eq!(classified.intent.aggregation, Some(AggregationType::Avg));
        assert_eq!(classified.aggregate_field.as_deref(), Some("duration_minutes"));
        assert_eq!(
            classified.intent.time_range.as_ref().and_then(|t| t.start.as_deref()),
            Some("this month")
        );
        assert_eq!(classified.group_by, vec!["type"]);
    }
}
