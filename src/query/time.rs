//! Relative and absolute time bounds.
//!
//! Relative phrases compile to DuckDB/Postgres expressions from a closed
//! vocabulary and are inlined; the only numbers they carry are parsed
//! integers. Anything outside the vocabulary yields no filter.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use std::sync::OnceLock;

use super::SqlParam;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TimeCondition {
    Expression(String),
    Compare(&'static str, SqlParam),
}

fn last_n_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:last|past|previous)\s+(?:(\d{1,4})\s+)?(day|week|month|quarter|year)s?$")
            .expect("relative time regex is valid")
    })
}

fn normalize(phrase: &str) -> String {
    phrase
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub(crate) fn parse_absolute(raw: &str) -> Option<SqlParam> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(SqlParam::Date(date));
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(SqlParam::Timestamp(ts.naive_utc()));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(SqlParam::Timestamp)
}

fn interval(n: u32, unit: &str) -> String {
    let (n, unit) = if unit == "quarter" { (n * 3, "month") } else { (n, unit) };
    if n == 1 {
        format!("INTERVAL '1 {}'", unit)
    } else {
        format!("INTERVAL '{} {}s'", n, unit)
    }
}

/// Lower bound for `column`.
pub(crate) fn start_condition(column: &str, phrase: &str) -> Option<TimeCondition> {
    if let Some(value) = parse_absolute(phrase) {
        return Some(TimeCondition::Compare(">=", value));
    }

    let phrase = normalize(phrase);
    let expr = match phrase.as_str() {
        "today" => format!("{} >= CURRENT_DATE", column),
        "yesterday" => format!(
            "({c} >= CURRENT_DATE - INTERVAL '1 day' AND {c} < CURRENT_DATE)",
            c = column
        ),
        "this week" | "this month" | "this quarter" | "this year" => {
            let unit = phrase.trim_start_matches("this ");
            format!("{} >= date_trunc('{}', CURRENT_DATE)", column, unit)
        }
        _ => {
            let caps = last_n_regex().captures(&phrase)?;
            let n: u32 = match caps.get(1) {
                Some(m) => m.as_str().parse().ok()?,
                None => 1,
            };
            if n == 0 {
                return None;
            }
            format!("{} >= CURRENT_DATE - {}", column, interval(n, &caps[2]))
        }
    };
    Some(TimeCondition::Expression(expr))
}

/// Upper bound for `column`. Relative ends only make sense for phrases that
/// name a point, so the vocabulary is smaller.
pub(crate) fn end_condition(column: &str, phrase: &str) -> Option<TimeCondition> {
    if let Some(value) = parse_absolute(phrase) {
        return Some(TimeCondition::Compare("<=", value));
    }

    let expr = match normalize(phrase).as_str() {
        "now" => format!("{} <= CURRENT_TIMESTAMP", column),
        "today" => format!("{} < CURRENT_DATE + INTERVAL '1 day'", column),
        "yesterday" => format!("{} < CURRENT_DATE", column),
        _ => return None,
    };
    Some(TimeCondition::Expression(expr))
}
