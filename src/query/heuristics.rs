use serde::{Deserialize, Serialize};

use crate::intent::AggregationType;

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Keyword tables behind the builder's best-effort guesses: which column to
/// aggregate, which filters imply a grouping, which columns carry ownership.
/// None of these lists is exhaustive; they are configuration, not rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderHeuristics {
    pub fallback_table: String,
    pub default_limit: u32,
    pub max_limit: u32,
    pub sum_preferences: Vec<String>,
    pub avg_preferences: Vec<String>,
    pub min_max_preferences: Vec<String>,
    pub categorical_columns: Vec<String>,
    pub assigned_columns: Vec<String>,
    pub creator_columns: Vec<String>,
    pub date_columns: Vec<String>,
    pub aggregate_terms: Vec<String>,
}

impl Default for BuilderHeuristics {
    fn default() -> Self {
        Self {
            fallback_table: "accounts".to_string(),
            default_limit: 100,
            max_limit: 1000,
            sum_preferences: strings(&["amount", "value", "price", "revenue", "total"]),
            avg_preferences: strings(&["score", "rating", "probability", "duration"]),
            min_max_preferences: strings(&["amount", "value", "score", "price"]),
            categorical_columns: strings(&[
                "type",
                "status",
                "stage",
                "source",
                "industry",
                "assigned_to",
                "assigned_employee_id",
                "created_by",
            ]),
            assigned_columns: strings(&["assigned_to", "assigned_employee_id", "owner_id"]),
            creator_columns: strings(&["created_by", "creator_id"]),
            date_columns: strings(&["activity_date", "created_at", "updated_at", "date"]),
            aggregate_terms: strings(&["count", "sum", "avg", "average", "min", "max", "total"]),
        }
    }
}

impl BuilderHeuristics {
    pub fn preferences_for(&self, aggregation: AggregationType) -> &[String] {
        match aggregation {
            AggregationType::Count => &[],
            AggregationType::Sum => &self.sum_preferences,
            AggregationType::Avg => &self.avg_preferences,
            AggregationType::Min | AggregationType::Max => &self.min_max_preferences,
        }
    }

    /// `total_count`, `avg_score`, `count` look like aggregate results;
    /// `accounts` does not, even though it contains "count".
    pub fn is_aggregate_result(&self, field: &str) -> bool {
        let field = field.to_lowercase();
        field
            .split(['_', '.'])
            .any(|segment| self.aggregate_terms.iter().any(|t| t == segment))
    }

    pub fn is_categorical(&self, column: &str) -> bool {
        self.categorical_columns
            .iter()
            .any(|c| c.eq_ignore_ascii_case(column))
    }

    pub fn effective_limit(&self, requested: Option<u32>) -> u32 {
        requested.unwrap_or(self.default_limit).clamp(1, self.max_limit.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_result_pattern_matches_segments() {
        let h = BuilderHeuristics::default();
        assert!(h.is_aggregate_result("total_count"));
        assert!(h.is_aggregate_result("avg_engagement_score"));
        assert!(!h.is_aggregate_result("accounts"));
        assert!(!h.is_aggregate_result("engagement_score"));
    }

    #[test]
    fn limits_are_clamped() {
        let h = BuilderHeuristics::default();
        assert_eq!(h.effective_limit(None), 100);
        assert_eq!(h.effective_limit(Some(0)), 1);
        assert_eq!(h.effective_limit(Some(50_000)), 1000);
    }
}
