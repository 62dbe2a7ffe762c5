//! Closed-shape query intent produced from a classifier's loose JSON.

pub mod guard;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::query::SqlParam;

pub use guard::{ClassifiedIntent, IntentGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryCategory {
    AccountQuery,
    SubAccountQuery,
    ContactQuery,
    ActivityQuery,
    DealQuery,
    EngagementAnalysis,
    PerformanceMetrics,
    TrendAnalysis,
    StrategicAdvice,
    GeneralQuestion,
}

impl QueryCategory {
    pub const ALL: [QueryCategory; 10] = [
        QueryCategory::AccountQuery,
        QueryCategory::SubAccountQuery,
        QueryCategory::ContactQuery,
        QueryCategory::ActivityQuery,
        QueryCategory::DealQuery,
        QueryCategory::EngagementAnalysis,
        QueryCategory::PerformanceMetrics,
        QueryCategory::TrendAnalysis,
        QueryCategory::StrategicAdvice,
        QueryCategory::GeneralQuestion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryCategory::AccountQuery => "ACCOUNT_QUERY",
            QueryCategory::SubAccountQuery => "SUB_ACCOUNT_QUERY",
            QueryCategory::ContactQuery => "CONTACT_QUERY",
            QueryCategory::ActivityQuery => "ACTIVITY_QUERY",
            QueryCategory::DealQuery => "DEAL_QUERY",
            QueryCategory::EngagementAnalysis => "ENGAGEMENT_ANALYSIS",
            QueryCategory::PerformanceMetrics => "PERFORMANCE_METRICS",
            QueryCategory::TrendAnalysis => "TREND_ANALYSIS",
            QueryCategory::StrategicAdvice => "STRATEGIC_ADVICE",
            QueryCategory::GeneralQuestion => "GENERAL_QUESTION",
        }
    }

    /// Coerces free text ("account query", "Account-Query") into the enum;
    /// anything unrecognised becomes `GeneralQuestion`.
    pub fn coerce(raw: &str) -> Self {
        let normalized: String = raw
            .trim()
            .chars()
            .map(|c| if c == ' ' || c == '-' { '_' } else { c.to_ascii_uppercase() })
            .collect();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .unwrap_or(QueryCategory::GeneralQuestion)
    }
}

impl fmt::Display for QueryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AggregationType {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregationType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "count" => Some(AggregationType::Count),
            "sum" | "total" => Some(AggregationType::Sum),
            "avg" | "average" | "mean" => Some(AggregationType::Avg),
            "min" | "minimum" => Some(AggregationType::Min),
            "max" | "maximum" => Some(AggregationType::Max),
            _ => None,
        }
    }

    pub fn sql_function(&self) -> &'static str {
        match self {
            AggregationType::Count => "COUNT",
            AggregationType::Sum => "SUM",
            AggregationType::Avg => "AVG",
            AggregationType::Min => "MIN",
            AggregationType::Max => "MAX",
        }
    }

    /// Prefix of the result alias, e.g. `total_amount`, `avg_engagement_score`.
    pub fn alias_prefix(&self) -> &'static str {
        match self {
            AggregationType::Count | AggregationType::Sum => "total",
            AggregationType::Avg => "avg",
            AggregationType::Min => "min",
            AggregationType::Max => "max",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompareOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    NotEq,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "LIKE")]
    Like,
}

impl CompareOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "!=",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::Like => "LIKE",
        }
    }
}

/// One filter condition. Parsed once at the boundary; the builder never sees
/// the loose JSON shapes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Filter {
    Compare {
        field: String,
        op: CompareOp,
        value: SqlParam,
    },
    InList {
        field: String,
        negated: bool,
        values: Vec<SqlParam>,
    },
    Null {
        field: String,
        negated: bool,
    },
    Between {
        field: String,
        low: SqlParam,
        high: SqlParam,
    },
}

impl Filter {
    pub fn compare(field: &str, op: CompareOp, value: impl Into<SqlParam>) -> Self {
        Filter::Compare {
            field: field.to_string(),
            op,
            value: value.into(),
        }
    }

    pub fn field(&self) -> &str {
        match self {
            Filter::Compare { field, .. }
            | Filter::InList { field, .. }
            | Filter::Null { field, .. }
            | Filter::Between { field, .. } => field,
        }
    }
}

/// A time bound: either a phrase such as "this month" or a literal date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    pub start: Option<String>,
    pub end: Option<String>,
    pub field: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryIntent {
    pub category: QueryCategory,
    pub tables: Vec<String>,
    pub filters: Vec<Filter>,
    pub aggregation: Option<AggregationType>,
    pub time_range: Option<TimeRange>,
}

impl QueryIntent {
    pub fn new(category: QueryCategory, tables: &[&str]) -> Self {
        Self {
            category,
            tables: tables.iter().map(|t| t.to_string()).collect(),
            filters: Vec::new(),
            aggregation: None,
            time_range: None,
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_aggregation(mut self, aggregation: AggregationType) -> Self {
        self.aggregation = Some(aggregation);
        self
    }

    pub fn with_time_range(mut self, start: Option<&str>, end: Option<&str>) -> Self {
        self.time_range = Some(TimeRange {
            start: start.map(str::to_string),
            end: end.map(str::to_string),
            field: None,
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_coercion_is_forgiving() {
        assert_eq!(QueryCategory::coerce("account query"), QueryCategory::AccountQuery);
        assert_eq!(QueryCategory::coerce("Trend-Analysis"), QueryCategory::TrendAnalysis);
        assert_eq!(QueryCategory::coerce("weather"), QueryCategory::GeneralQuestion);
        assert_eq!(QueryCategory::coerce(""), QueryCategory::GeneralQuestion);
    }

    #[test]
    fn aggregation_aliases() {
        assert_eq!(AggregationType::parse("Average"), Some(AggregationType::Avg));
        assert_eq!(AggregationType::parse("median"), None);
    }
}
