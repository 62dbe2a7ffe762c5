//! Dynamic SQL builder: `{intent, user, options}` to parameterized SQL.
//!
//! The builder degrades instead of failing wherever a safe default exists
//! (unknown table, unresolved field, unreachable join) and records what it
//! skipped in `QueryBuilderResult::warnings`. The only hard error is a
//! mismatch between bound params and `$n` placeholders.

pub mod heuristics;
pub mod params;
mod time;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::intent::{AggregationType, Filter, QueryIntent};
use crate::schema::{SchemaRegistry, TableSchema};
use time::TimeCondition;

pub use heuristics::BuilderHeuristics;
pub use params::{SqlParam, check_placeholders, placeholder_indexes, render_sql};

#[derive(Debug, Error)]
pub enum QueryBuildError {
    #[error("{placeholders} placeholders for {params} bound parameters")]
    PlaceholderMismatch { placeholders: usize, params: usize },
    #[error("placeholder {0} has no bound parameter")]
    UnboundPlaceholder(String),
}

/// Identity and role of the asker, supplied by upstream authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    pub role: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl UserContext {
    pub fn new(user_id: &str, role: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            role: role.to_string(),
            permissions: Vec::new(),
            display_name: None,
        }
    }

    /// Minimal non-admin context used when the directory lookup fails.
    pub fn anonymous(user_id: &str) -> Self {
        Self::new(user_id, "user")
    }

    pub fn is_admin(&self) -> bool {
        self.role.eq_ignore_ascii_case("admin")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    #[serde(default)]
    pub descending: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOptions {
    pub group_by: Vec<String>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<u32>,
    pub aggregate_field: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryBuilderResult {
    pub sql: String,
    pub params: Vec<SqlParam>,
    pub explanation: String,
    pub affected_tables: Vec<String>,
    pub warnings: Vec<String>,
}

impl QueryBuilderResult {
    /// SQL with every placeholder replaced by its escaped literal.
    pub fn rendered_sql(&self) -> Result<String, QueryBuildError> {
        render_sql(&self.sql, &self.params)
    }
}

/// A column resolved against the tables in scope.
struct ResolvedColumn {
    table: String,
    column: String,
}

impl ResolvedColumn {
    fn qualified(&self) -> String {
        format!("{}.{}", self.table, self.column)
    }
}

/// Positional parameter list; every push hands back the next `$n`.
#[derive(Default)]
struct Binder {
    params: Vec<SqlParam>,
}

impl Binder {
    fn bind(&mut self, value: SqlParam) -> String {
        self.params.push(value);
        format!("${}", self.params.len())
    }
}

struct Aggregate {
    expression: String,
    alias: String,
    description: String,
}

pub struct QueryBuilder {
    registry: Arc<SchemaRegistry>,
    heuristics: BuilderHeuristics,
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl QueryBuilder {
    pub fn new(registry: Arc<SchemaRegistry>, heuristics: BuilderHeuristics) -> Self {
        Self { registry, heuristics }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn heuristics(&self) -> &BuilderHeuristics {
        &self.heuristics
    }

    pub fn build_query(
        &self,
        intent: &QueryIntent,
        user: Option<&UserContext>,
        options: &BuildOptions,
    ) -> Result<QueryBuilderResult, QueryBuildError> {
        let mut warnings = Vec::new();
        let requested = self.requested_tables(intent, &mut warnings);
        let primary = requested[0].clone();
        let limit = self.heuristics.effective_limit(options.limit);

        let Some(primary_schema) = self.registry.table(&primary) else {
            warnings.push(format!("table '{}' is not in the schema registry; selecting all columns", primary));
            let sql = format!("SELECT * FROM {}\nLIMIT {}", primary, limit);
            return finish(sql, Vec::new(), format!("Reads {}", primary), vec![primary], warnings);
        };

        // Joins
        let plan = self
            .registry
            .graph()
            .plan_joins(self.registry.relationships(), &primary, &requested);
        for table in &plan.unreachable {
            warnings.push(format!("no join path from '{}' to '{}'; table skipped", primary, table));
        }

        let mut affected_tables = vec![primary.clone()];
        let mut intermediates = Vec::new();
        let mut join_clauses = Vec::with_capacity(plan.steps.len());
        for step in &plan.steps {
            let rel = &step.relationship;
            let kind = if self.registry.foreign_key_nullable(rel) { "LEFT" } else { "INNER" };
            join_clauses.push(format!(
                "{} JOIN {} ON {}.{} = {}.id",
                kind, step.table, rel.from_table, rel.foreign_key, rel.to_table
            ));
            if step.intermediate {
                intermediates.push(step.table.clone());
            } else {
                affected_tables.push(step.table.clone());
            }
        }
        let scope: Vec<&str> = affected_tables
            .iter()
            .chain(intermediates.iter())
            .map(String::as_str)
            .collect();

        let aggregate = intent
            .aggregation
            .map(|agg| self.aggregate(agg, primary_schema, options, &scope, &mut warnings));

        let mut binder = Binder::default();
        let mut where_clauses = Vec::new();
        let mut having_filters = Vec::new();
        let mut categorical = Vec::new();

        // (a) intent filters
        for filter in &intent.filters {
            match self.resolve(filter.field(), &scope) {
                Some(column) => {
                    if aggregate.is_some() && self.heuristics.is_categorical(&column.column) {
                        categorical.push(column.qualified());
                    }
                    where_clauses.push(render_filter(&column.qualified(), filter, &mut binder, &mut warnings));
                }
                None => match &aggregate {
                    Some(agg) if self.heuristics.is_aggregate_result(filter.field()) => {
                        having_filters.push((having_target(filter.field(), agg), filter));
                    }
                    _ => warnings.push(format!("filter field '{}' does not resolve to a column; skipped", filter.field())),
                },
            }
        }
        where_clauses.retain(|c| !c.is_empty());

        // (b) row scoping
        let mut scoped = false;
        if let Some(user) = user.filter(|u| !u.is_admin()) {
            for table in &affected_tables {
                match self.scoping_clause(table, &user.user_id, &mut binder) {
                    Some(clause) => {
                        where_clauses.push(clause);
                        scoped = true;
                    }
                    None => debug!("No ownership columns on {}; rows not scoped", table),
                }
            }
        }

        // (c) time range
        if let Some(range) = &intent.time_range {
            let column = match &range.field {
                Some(field) => self.resolve(field, &scope).map(|c| c.qualified()),
                None => self.time_column(primary_schema),
            };
            match column {
                Some(column) => {
                    let bounds = [
                        (range.start.as_deref(), time::start_condition as fn(&str, &str) -> Option<TimeCondition>),
                        (range.end.as_deref(), time::end_condition),
                    ];
                    for (phrase, compile) in bounds {
                        let Some(phrase) = phrase else { continue };
                        match compile(&column, phrase) {
                            Some(TimeCondition::Expression(expr)) => where_clauses.push(expr),
                            Some(TimeCondition::Compare(op, value)) => {
                                let placeholder = binder.bind(value);
                                where_clauses.push(format!("{} {} {}", column, op, placeholder));
                            }
                            None => warnings.push(format!("unrecognized time expression '{}'; no time filter applied", phrase)),
                        }
                    }
                }
                None => warnings.push(format!("no date column on '{}'; time range ignored", primary)),
            }
        }

        // HAVING, bound after every WHERE source
        let mut having_clauses: Vec<String> = having_filters
            .into_iter()
            .map(|(target, filter)| render_filter(&target, filter, &mut binder, &mut warnings))
            .collect();
        having_clauses.retain(|c| !c.is_empty());

        // GROUP BY
        let mut group_by = Vec::new();
        if !options.group_by.is_empty() {
            for field in &options.group_by {
                match self.resolve(field, &scope) {
                    Some(column) => group_by.push(column.qualified()),
                    None => warnings.push(format!("group-by field '{}' does not resolve; skipped", field)),
                }
            }
        } else {
            group_by = categorical;
        }
        let mut seen = HashSet::new();
        group_by.retain(|c| seen.insert(c.clone()));
        if aggregate.is_none() && !group_by.is_empty() {
            warnings.push("grouping requested without an aggregation; ignored".to_string());
            group_by.clear();
        }

        // SELECT
        let select_list = match &aggregate {
            Some(agg) => {
                let mut items = group_by.clone();
                items.push(format!("{} AS {}", agg.expression, agg.alias));
                items
            }
            None => primary_schema
                .columns
                .iter()
                .map(|c| format!("{}.{}", primary, c.name))
                .collect(),
        };

        // ORDER BY
        let order_by = match &options.order_by {
            Some(order) => {
                let target = match &aggregate {
                    Some(agg) if order.field.eq_ignore_ascii_case(&agg.alias) => Some(agg.alias.clone()),
                    _ => self.resolve(&order.field, &scope).map(|c| c.qualified()),
                };
                match target {
                    Some(t) => Some(format!("{} {}", t, if order.descending { "DESC" } else { "ASC" })),
                    None => {
                        warnings.push(format!("order-by field '{}' does not resolve; skipped", order.field));
                        None
                    }
                }
            }
            None => aggregate
                .as_ref()
                .filter(|_| !group_by.is_empty())
                .map(|agg| format!("{} DESC", agg.alias)),
        };

        let mut lines = vec![format!("SELECT {}", select_list.join(", ")), format!("FROM {}", primary)];
        lines.extend(join_clauses);
        if !where_clauses.is_empty() {
            lines.push(format!("WHERE {}", where_clauses.join(" AND ")));
        }
        if !group_by.is_empty() {
            lines.push(format!("GROUP BY {}", group_by.join(", ")));
        }
        if !having_clauses.is_empty() {
            lines.push(format!("HAVING {}", having_clauses.join(" AND ")));
        }
        if let Some(order) = order_by {
            lines.push(format!("ORDER BY {}", order));
        }
        lines.push(format!("LIMIT {}", limit));

        let mut explanation = format!("Reads {}", primary);
        let joined: Vec<&str> = affected_tables.iter().skip(1).map(String::as_str).collect();
        if !joined.is_empty() {
            explanation.push_str(&format!(" joined with {}", joined.join(", ")));
        }
        if !intermediates.is_empty() {
            explanation.push_str(&format!(" (via {})", intermediates.join(", ")));
        }
        if let Some(agg) = &aggregate {
            explanation.push_str(&format!("; computes {}", agg.description));
        }
        if !group_by.is_empty() {
            explanation.push_str(&format!(" grouped by {}", group_by.join(", ")));
        }
        let filter_count = where_clauses.len() + having_clauses.len();
        if filter_count > 0 {
            explanation.push_str(&format!("; {} condition(s) applied", filter_count));
        }
        if scoped {
            explanation.push_str("; limited to records owned by the requesting user");
        }

        finish(lines.join("\n"), binder.params, explanation, affected_tables, warnings)
    }

    fn requested_tables(&self, intent: &QueryIntent, warnings: &mut Vec<String>) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut tables = Vec::new();
        for (i, raw) in intent.tables.iter().enumerate() {
            let table = raw.trim().to_lowercase();
            if !is_identifier(&table) {
                warnings.push(format!("'{}' is not a valid table name; ignored", raw));
                continue;
            }
            if i > 0 && !self.registry.contains(&table) {
                warnings.push(format!("table '{}' is not in the schema registry; ignored", table));
                continue;
            }
            if seen.insert(table.clone()) {
                tables.push(table);
            }
        }
        if tables.is_empty() {
            tables.push(self.heuristics.fallback_table.clone());
        }
        tables
    }

    /// Resolves `field` (bare or `table.column`) against `scope`, in order.
    fn resolve(&self, field: &str, scope: &[&str]) -> Option<ResolvedColumn> {
        let field = field.trim();
        let candidates: Vec<(&str, &str)> = match field.split_once('.') {
            Some((table, column)) => scope
                .iter()
                .filter(|t| t.eq_ignore_ascii_case(table))
                .map(|t| (*t, column))
                .collect(),
            None => scope.iter().map(|t| (*t, field)).collect(),
        };
        candidates.into_iter().find_map(|(table, column)| {
            self.registry
                .table(table)
                .and_then(|schema| schema.column(column))
                .map(|c| ResolvedColumn {
                    table: table.to_string(),
                    column: c.name.clone(),
                })
        })
    }

    fn aggregate(
        &self,
        aggregation: AggregationType,
        primary: &TableSchema,
        options: &BuildOptions,
        scope: &[&str],
        warnings: &mut Vec<String>,
    ) -> Aggregate {
        let count = || Aggregate {
            expression: "COUNT(*)".to_string(),
            alias: "total_count".to_string(),
            description: "the number of matching rows".to_string(),
        };
        if aggregation == AggregationType::Count {
            return count();
        }

        let explicit = options
            .aggregate_field
            .as_deref()
            .and_then(|field| self.resolve(field, scope));
        let preferred = || {
            self.heuristics
                .preferences_for(aggregation)
                .iter()
                .find_map(|pref| {
                    primary
                        .columns
                        .iter()
                        .find(|c| c.looks_numeric() && c.name.to_lowercase().contains(pref.as_str()))
                })
                .or_else(|| primary.columns.iter().find(|c| c.looks_numeric()))
                .map(|c| ResolvedColumn {
                    table: primary.name.clone(),
                    column: c.name.clone(),
                })
        };

        match explicit.or_else(preferred) {
            Some(column) => Aggregate {
                expression: format!("{}({})", aggregation.sql_function(), column.qualified()),
                alias: format!("{}_{}", aggregation.alias_prefix(), column.column),
                description: format!("{} of {}", aggregation.sql_function(), column.qualified()),
            },
            None => {
                warnings.push(format!(
                    "no numeric column on '{}' for {}; counting rows instead",
                    primary.name,
                    aggregation.sql_function()
                ));
                count()
            }
        }
    }

    fn scoping_clause(&self, table: &str, user_id: &str, binder: &mut Binder) -> Option<String> {
        let schema = self.registry.table(table)?;
        let first_present = |names: &[String]| {
            names
                .iter()
                .find_map(|n| schema.column(n))
                .map(|c| format!("{}.{}", table, c.name))
        };
        let columns: Vec<String> = [
            first_present(&self.heuristics.assigned_columns),
            first_present(&self.heuristics.creator_columns),
        ]
        .into_iter()
        .flatten()
        .collect();

        let conditions: Vec<String> = columns
            .iter()
            .map(|c| format!("{} = {}", c, binder.bind(SqlParam::from(user_id))))
            .collect();
        match conditions.len() {
            0 => None,
            1 => conditions.into_iter().next(),
            _ => Some(format!("({})", conditions.join(" OR "))),
        }
    }

    fn time_column(&self, primary: &TableSchema) -> Option<String> {
        self.heuristics
            .date_columns
            .iter()
            .find_map(|name| primary.column(name))
            .or_else(|| primary.columns.iter().find(|c| c.data_type.is_temporal()))
            .map(|c| format!("{}.{}", primary.name, c.name))
    }
}

fn having_target(field: &str, agg: &Aggregate) -> String {
    if field.eq_ignore_ascii_case(&agg.alias) {
        return agg.expression.clone();
    }
    let lower = field.to_lowercase();
    if lower.split(['_', '.']).any(|s| s == "count") {
        "COUNT(*)".to_string()
    } else {
        agg.expression.clone()
    }
}

fn render_filter(target: &str, filter: &Filter, binder: &mut Binder, warnings: &mut Vec<String>) -> String {
    match filter {
        Filter::Compare { op, value, .. } => format!("{} {} {}", target, op.as_sql(), binder.bind(value.clone())),
        Filter::InList { values, negated, field } => {
            if values.is_empty() {
                warnings.push(format!("empty value list for '{}'; filter skipped", field));
                return String::new();
            }
            let placeholders: Vec<String> = values.iter().map(|v| binder.bind(v.clone())).collect();
            let keyword = if *negated { "NOT IN" } else { "IN" };
            format!("{} {} ({})", target, keyword, placeholders.join(", "))
        }
        Filter::Null { negated: false, .. } => format!("{} IS NULL", target),
        Filter::Null { negated: true, .. } => format!("{} IS NOT NULL", target),
        Filter::Between { low, high, .. } => {
            let low = binder.bind(low.clone());
            let high = binder.bind(high.clone());
            format!("{} BETWEEN {} AND {}", target, low, high)
        }
    }
}

fn finish(
    sql: String,
    params: Vec<SqlParam>,
    explanation: String,
    affected_tables: Vec<String>,
    warnings: Vec<String>,
) -> Result<QueryBuilderResult, QueryBuildError> {
    check_placeholders(&sql, &params)?;
    debug!("Built SQL with {} params and {} warnings", params.len(), warnings.len());
    Ok(QueryBuilderResult {
        sql,
        params,
        explanation,
        affected_tables,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::{CompareOp, QueryCategory};
    use crate::schema::SchemaRegistry;

    fn builder() -> QueryBuilder {
        let registry = SchemaRegistry::crm_default().expect("bundled schema loads");
        QueryBuilder::new(Arc::new(registry), BuilderHeuristics::default())
    }

    fn where_clause(sql: &str) -> Option<&str> {
        sql.lines().find(|l| l.starts_with("WHERE "))
    }

    #[test]
    fn single_table_selects_every_column_once() {
        let b = builder();
        let intent = QueryIntent::new(QueryCategory::AccountQuery, &["accounts"]);
        let result = b.build_query(&intent, None, &BuildOptions::default()).unwrap();

        assert!(!result.sql.contains("WHERE"));
        assert!(!result.sql.contains("JOIN"));
        let schema = b.registry().table("accounts").unwrap();
        for column in &schema.columns {
            let qualified = format!("accounts.{}", column.name);
            let hits = result.sql.matches(&format!("{},", qualified)).count()
                + result.sql.matches(&format!("{}\n", qualified)).count();
            assert_eq!(hits, 1, "column {} selected once", qualified);
        }
        assert!(result.params.is_empty());
        assert_eq!(result.affected_tables, vec!["accounts"]);
    }

    #[test]
    fn compare_filter_binds_first_placeholder() {
        let intent = QueryIntent::new(QueryCategory::DealQuery, &["deals"])
            .with_filter(Filter::compare("amount", CompareOp::Gt, 5));
        let result = builder().build_query(&intent, None, &BuildOptions::default()).unwrap();
        assert!(result.sql.contains("deals.amount > $1"));
        assert_eq!(result.params, vec![SqlParam::Int(5)]);
    }

    #[test]
    fn placeholders_are_contiguous_across_sources() {
        let intent = QueryIntent::new(QueryCategory::ContactQuery, &["contacts"])
            .with_filter(Filter::InList {
                field: "source".into(),
                negated: false,
                values: vec!["webinar".into(), "referral".into()],
            })
            .with_filter(Filter::Between {
                field: "created_at".into(),
                low: "2024-01-01".into(),
                high: "2024-06-30".into(),
            })
            .with_time_range(Some("2024-01-01"), None);
        let user = UserContext::new("u7", "sales");
        let result = builder()
            .build_query(&intent, Some(&user), &BuildOptions::default())
            .unwrap();

        assert_eq!(placeholder_indexes(&result.sql), (1..=result.params.len()).collect::<Vec<_>>());
        assert!(result.sql.contains("contacts.source IN ($1, $2)"));
        assert!(result.sql.contains("contacts.created_at BETWEEN $3 AND $4"));
        assert!(result.sql.contains("(contacts.assigned_to = $5 OR contacts.created_by = $6)"));
        assert!(result.sql.contains("contacts.created_at >= $7"));
    }

    #[test]
    fn non_admin_scoping_uses_or_group() {
        let user = UserContext::new("u1", "sales");
        let intent = QueryIntent::new(QueryCategory::ActivityQuery, &["activities"]);
        let result = builder()
            .build_query(&intent, Some(&user), &BuildOptions::default())
            .unwrap();
        assert!(result
            .sql
            .contains("(activities.assigned_to = $1 OR activities.created_by = $2)"));
        assert_eq!(result.params, vec![SqlParam::from("u1"), SqlParam::from("u1")]);
    }

    #[test]
    fn admin_is_never_scoped() {
        let admin = UserContext::new("boss", "Admin");
        for table in ["accounts", "contacts", "activities", "deals"] {
            let intent = QueryIntent::new(QueryCategory::GeneralQuestion, &[table]);
            let result = builder()
                .build_query(&intent, Some(&admin), &BuildOptions::default())
                .unwrap();
            assert!(where_clause(&result.sql).is_none(), "{}", result.sql);
            assert!(result.params.is_empty());
        }
    }

    #[test]
    fn intermediate_join_stays_out_of_select() {
        let intent = QueryIntent::new(QueryCategory::ContactQuery, &["accounts", "contacts"]);
        let result = builder().build_query(&intent, None, &BuildOptions::default()).unwrap();

        let joins: Vec<&str> = result.sql.lines().filter(|l| l.contains(" JOIN ")).collect();
        assert_eq!(
            joins,
            vec![
                "INNER JOIN sub_accounts ON sub_accounts.account_id = accounts.id",
                "LEFT JOIN contacts ON contacts.sub_account_id = sub_accounts.id",
            ]
        );
        let select = result.sql.lines().next().unwrap();
        assert!(!select.contains("sub_accounts."));
        assert!(!select.contains("contacts."));
        assert_eq!(result.affected_tables, vec!["accounts", "contacts"]);
    }

    #[test]
    fn building_is_idempotent() {
        let b = builder();
        let intent = QueryIntent::new(QueryCategory::DealQuery, &["deals", "activities"])
            .with_filter(Filter::compare("stage", CompareOp::Eq, "won"))
            .with_time_range(Some("last 30 days"), Some("today"));
        let user = UserContext::new("u3", "sales");
        let first = b.build_query(&intent, Some(&user), &BuildOptions::default()).unwrap();
        let second = b.build_query(&intent, Some(&user), &BuildOptions::default()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn aggregate_result_filters_go_to_having() {
        let intent = QueryIntent::new(QueryCategory::PerformanceMetrics, &["activities"])
            .with_aggregation(AggregationType::Count)
            .with_filter(Filter::compare("total_count", CompareOp::Gt, 10))
            .with_filter(Filter::compare("type", CompareOp::Eq, "call"));
        let result = builder().build_query(&intent, None, &BuildOptions::default()).unwrap();

        let where_line = where_clause(&result.sql).unwrap();
        assert!(where_line.contains("activities.type = $1"));
        assert!(!where_line.contains("COUNT"));
        assert!(result.sql.contains("HAVING COUNT(*) > $2"));
        assert!(result.sql.contains("GROUP BY activities.type"));
        assert!(result.sql.starts_with("SELECT activities.type, COUNT(*) AS total_count"));
    }

    #[test]
    fn having_placeholders_follow_scoping_and_time() {
        let intent = QueryIntent::new(QueryCategory::PerformanceMetrics, &["activities"])
            .with_aggregation(AggregationType::Count)
            .with_filter(Filter::compare("total_count", CompareOp::Gt, 10))
            .with_filter(Filter::compare("type", CompareOp::Eq, "call"))
            .with_time_range(Some("2024-01-01"), None);
        let user = UserContext::new("u1", "sales");
        let result = builder()
            .build_query(&intent, Some(&user), &BuildOptions::default())
            .unwrap();

        assert_eq!(placeholder_indexes(&result.sql), (1..=result.params.len()).collect::<Vec<_>>());
        assert!(result.sql.contains("HAVING COUNT(*) > $5"));
        assert_eq!(result.params.last(), Some(&SqlParam::Int(10)));
    }

    #[test]
    fn sum_prefers_amount_like_columns() {
        let intent = QueryIntent::new(QueryCategory::DealQuery, &["deals"])
            .with_aggregation(AggregationType::Sum);
        let result = builder().build_query(&intent, None, &BuildOptions::default()).unwrap();
        assert!(result.sql.contains("SUM(deals.amount) AS total_amount"));
    }

    #[test]
    fn aggregation_without_numeric_column_counts() {
        let registry = SchemaRegistry::from_json_str(
            r#"{"tables":{"notes":{"columns":[{"name":"id","type":"uuid","nullable":false},{"name":"body","type":"text"}]}},"relationships":[]}"#,
        )
        .unwrap();
        let b = QueryBuilder::new(Arc::new(registry), BuilderHeuristics::default());
        let intent = QueryIntent::new(QueryCategory::GeneralQuestion, &["notes"])
            .with_aggregation(AggregationType::Avg);
        let result = b.build_query(&intent, None, &BuildOptions::default()).unwrap();
        assert!(result.sql.contains("COUNT(*) AS total_count"));
        assert!(result.warnings.iter().any(|w| w.contains("no numeric column")));
    }

    #[test]
    fn unknown_table_degrades_to_select_star() {
        let intent = QueryIntent::new(QueryCategory::GeneralQuestion, &["invoices"]);
        let result = builder().build_query(&intent, None, &BuildOptions::default()).unwrap();
        assert_eq!(result.sql, "SELECT * FROM invoices\nLIMIT 100");
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn empty_or_hostile_tables_fall_back() {
        let mut intent = QueryIntent::new(QueryCategory::GeneralQuestion, &[]);
        let result = builder().build_query(&intent, None, &BuildOptions::default()).unwrap();
        assert!(result.sql.contains("FROM accounts"));

        intent.tables = vec!["accounts; DROP TABLE accounts".into()];
        let result = builder().build_query(&intent, None, &BuildOptions::default()).unwrap();
        assert!(result.sql.contains("FROM accounts\n"));
        assert!(!result.sql.contains("DROP"));
    }

    #[test]
    fn unresolved_fields_are_reported() {
        let intent = QueryIntent::new(QueryCategory::AccountQuery, &["accounts"])
            .with_filter(Filter::compare("favourite_colour", CompareOp::Eq, "blue"));
        let result = builder().build_query(&intent, None, &BuildOptions::default()).unwrap();
        assert!(where_clause(&result.sql).is_none());
        assert!(result.params.is_empty());
        assert!(result.warnings[0].contains("favourite_colour"));
    }

    #[test]
    fn explicit_group_and_order_options_win() {
        let intent = QueryIntent::new(QueryCategory::DealQuery, &["deals"])
            .with_aggregation(AggregationType::Sum)
            .with_filter(Filter::compare("probability", CompareOp::Gte, 0.5));
        let options = BuildOptions {
            group_by: vec!["stage".into()],
            order_by: Some(OrderBy {
                field: "total_amount".into(),
                descending: false,
            }),
            limit: Some(5),
            aggregate_field: None,
        };
        let result = builder().build_query(&intent, None, &options).unwrap();
        assert!(result.sql.contains("GROUP BY deals.stage\n"));
        assert!(result.sql.contains("ORDER BY total_amount ASC"));
        assert!(result.sql.ends_with("LIMIT 5"));
    }

    #[test]
    fn rendered_sql_inlines_escaped_literals() {
        let intent = QueryIntent::new(QueryCategory::AccountQuery, &["accounts"])
            .with_filter(Filter::compare("name", CompareOp::Eq, "O'Neil & Sons"));
        let result = builder().build_query(&intent, None, &BuildOptions::default()).unwrap();
        let rendered = result.rendered_sql().unwrap();
        assert!(rendered.contains("accounts.name = 'O''Neil & Sons'"));
    }
}
