//! Post-generation checks on the model's answer.
//!
//! Figures the model states are compared with the grounding text. Anything
//! that cannot be found is listed in a disclaimer; the answer text itself is
//! never altered except for rephrasing claims of direct database access.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    pub answer: String,
    pub unverified: Vec<String>,
    pub rephrased: usize,
}

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\d{4}-\d{2}-\d{2}|\$?\d{1,3}(?:,\d{3})+(?:\.\d+)?%?|\$?\d+(?:\.\d+)?%?")
            .expect("token regex is valid")
    })
}

fn date_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("date regex is valid"))
}

fn boilerplate() -> &'static [(Regex, &'static str)] {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            (
                r"(?i)\bI (?:have )?(?:checked|queried|searched|accessed|looked (?:in|at)) (?:the|your) (?:database|db)\b",
                "Based on the retrieved data",
            ),
            (
                r"(?i)\bI (?:have|don't have|do not have) (?:direct )?access to (?:the|your) (?:database|db)\b",
                "I am working from the retrieved data",
            ),
            (
                r"(?i)\b(?:according to|from|in) (?:the|your) (?:database|db)\b",
                "according to the retrieved data",
            ),
        ]
        .into_iter()
        .map(|(pattern, replacement)| (Regex::new(pattern).expect("boilerplate regex is valid"), replacement))
        .collect()
    })
}

fn numeric_value(token: &str) -> Option<f64> {
    let cleaned: String = token
        .chars()
        .filter(|c| !matches!(c, ',' | '%' | '$'))
        .collect();
    cleaned.parse::<f64>().ok()
}

fn decimals(token: &str) -> usize {
    token
        .trim_end_matches('%')
        .split_once('.')
        .map(|(_, frac)| frac.len())
        .unwrap_or(0)
}

fn round_to(value: f64, places: usize) -> f64 {
    let factor = 10f64.powi(places.min(10) as i32);
    (value * factor).round() / factor
}

/// Small integers read as prose ("top 3", "2 deals") and are not checked.
fn is_trivial(token: &str, value: f64) -> bool {
    decimals(token) == 0 && !token.ends_with('%') && (0.0..=10.0).contains(&value)
}

fn grounding_numbers(grounding: &str) -> Vec<f64> {
    token_regex()
        .find_iter(grounding)
        .filter(|m| !date_regex().is_match(m.as_str()))
        .filter_map(|m| numeric_value(m.as_str()))
        .collect()
}

fn is_grounded(token: &str, grounding: &str, numbers: &[f64]) -> bool {
    if date_regex().is_match(token) {
        return grounding.contains(token);
    }
    let Some(value) = numeric_value(token) else {
        return true;
    };
    if is_trivial(token, value) {
        return true;
    }
    let places = decimals(token);
    numbers.iter().any(|n| {
        (n - value).abs() <= f64::EPSILON * value.abs().max(1.0)
            || round_to(*n, places) == value
            // Percentages are often stored as fractions.
            || (token.ends_with('%') && round_to(n * 100.0, places) == value)
    })
}

pub fn disclaimer(unverified: &[String]) -> String {
    format!(
        "Note: some figures in this answer ({}) could not be matched to the retrieved data. Please verify them before relying on them.",
        unverified.join(", ")
    )
}

pub fn validate_answer(answer: &str, grounding: &str) -> Validation {
    let mut text = answer.to_string();
    let mut rephrased = 0;
    if !grounding.to_lowercase().contains("database") {
        for (pattern, replacement) in boilerplate() {
            let hits = pattern.find_iter(&text).count();
            if hits > 0 {
                rephrased += hits;
                text = pattern.replace_all(&text, *replacement).into_owned();
            }
        }
    }

    let numbers = grounding_numbers(grounding);
    let mut seen = BTreeSet::new();
    let unverified: Vec<String> = token_regex()
        .find_iter(&text)
        .map(|m| m.as_str().to_string())
        .filter(|token| seen.insert(token.clone()))
        .filter(|token| !is_grounded(token, grounding, &numbers))
        .collect();

    if !unverified.is_empty() {
        text = format!("{}\n\n{}", text.trim_end(), disclaimer(&unverified));
    }

    Validation {
        answer: text,
        unverified,
        rephrased,
    }
}
