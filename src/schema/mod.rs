//! Static schema and relationship registry.
//!
//! The registry is loaded once (from JSON or the built-in CRM layout) and is
//! immutable afterwards. The relationship adjacency is computed at load time so
//! the query builder never rebuilds it per call.

pub mod graph;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

pub use graph::{GraphEdge, JoinPlan, JoinStep, RelationshipGraph};

const CRM_REGISTRY: &str = include_str!("crm.json");

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read schema registry {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid schema registry: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("relationship {from}.{foreign_key} -> {to} references an undeclared table or column")]
    DanglingRelationship {
        from: String,
        to: String,
        foreign_key: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DataType {
    Integer,
    BigInt,
    Numeric,
    Double,
    String,
    Uuid,
    Boolean,
    Date,
    Timestamp,
    Unknown(String),
}

impl DataType {
    pub fn to_sql_type(&self) -> String {
        match self {
            DataType::Integer => "INTEGER".to_string(),
            DataType::BigInt => "BIGINT".to_string(),
            DataType::Numeric => "DECIMAL(18,2)".to_string(),
            DataType::Double => "DOUBLE".to_string(),
            DataType::String => "VARCHAR".to_string(),
            DataType::Uuid => "UUID".to_string(),
            DataType::Boolean => "BOOLEAN".to_string(),
            DataType::Date => "DATE".to_string(),
            DataType::Timestamp => "TIMESTAMP".to_string(),
            DataType::Unknown(t) => t.clone(),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            DataType::Integer | DataType::BigInt | DataType::Numeric | DataType::Double
        )
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, DataType::Date | DataType::Timestamp)
    }
}

impl From<String> for DataType {
    fn from(raw: String) -> Self {
        let lowered = raw.trim().to_lowercase();
        // strip precision/scale, e.g. numeric(10,2) or varchar(255)
        let base = lowered.split('(').next().unwrap_or("").trim();
        match base {
            "int" | "int4" | "integer" | "smallint" | "int2" | "serial" => DataType::Integer,
            "bigint" | "int8" | "bigserial" => DataType::BigInt,
            "numeric" | "decimal" | "money" => DataType::Numeric,
            "double" | "double precision" | "float" | "float4" | "float8" | "real" => {
                DataType::Double
            }
            "text" | "varchar" | "character varying" | "char" | "string" => DataType::String,
            "uuid" => DataType::Uuid,
            "bool" | "boolean" => DataType::Boolean,
            "date" => DataType::Date,
            "timestamp" | "timestamptz" | "timestamp with time zone"
            | "timestamp without time zone" | "datetime" => DataType::Timestamp,
            _ => DataType::Unknown(raw),
        }
    }
}

impl From<DataType> for String {
    fn from(data_type: DataType) -> Self {
        data_type.to_sql_type().to_lowercase()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnSchema {
    pub fn new(name: &str, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            nullable,
        }
    }

    pub fn to_sql_definition(&self) -> String {
        let nullable_str = if self.nullable { "" } else { " NOT NULL" };
        format!("{} {}{}", self.name, self.data_type.to_sql_type(), nullable_str)
    }

    /// Numeric by declared type, or by a name that usually carries a number
    /// when the registry types it loosely.
    pub fn looks_numeric(&self) -> bool {
        if self.data_type.is_numeric() {
            return true;
        }
        if !matches!(self.data_type, DataType::Unknown(_)) {
            return false;
        }
        let name = self.name.to_lowercase();
        ["amount", "count", "score", "value", "price", "total", "revenue", "rating"]
            .iter()
            .any(|hint| name.contains(hint))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn new(name: &str, columns: Vec<ColumnSchema>) -> Self {
        Self {
            name: name.to_string(),
            columns,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn to_create_table_sql(&self) -> String {
        let columns_sql: Vec<String> = self
            .columns
            .iter()
            .map(|col| col.to_sql_definition())
            .collect();

        format!(
            "CREATE TABLE {} (\n    {}\n);",
            self.name,
            columns_sql.join(",\n    ")
        )
    }
}

/// A declared foreign key: `from_table.foreign_key` references `to_table.id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRelationship {
    #[serde(alias = "from_table")]
    pub from_table: String,
    #[serde(alias = "to_table")]
    pub to_table: String,
    #[serde(alias = "foreign_key")]
    pub foreign_key: String,
}

impl TableRelationship {
    pub fn new(from_table: &str, to_table: &str, foreign_key: &str) -> Self {
        Self {
            from_table: from_table.to_string(),
            to_table: to_table.to_string(),
            foreign_key: foreign_key.to_string(),
        }
    }

    pub fn other_side(&self, table: &str) -> &str {
        if self.from_table == table {
            &self.to_table
        } else {
            &self.from_table
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawTable {
    columns: Vec<ColumnSchema>,
}

#[derive(Debug, Deserialize)]
struct RawRegistry {
    tables: BTreeMap<String, RawTable>,
    #[serde(default)]
    relationships: Vec<TableRelationship>,
}

#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    tables: BTreeMap<String, TableSchema>,
    relationships: Vec<TableRelationship>,
    graph: RelationshipGraph,
}

impl SchemaRegistry {
    pub fn new(
        tables: Vec<TableSchema>,
        relationships: Vec<TableRelationship>,
    ) -> Result<Self, SchemaError> {
        let tables: BTreeMap<String, TableSchema> = tables
            .into_iter()
            .map(|t| (t.name.clone(), t))
            .collect();

        for rel in &relationships {
            let owner_has_fk = tables
                .get(&rel.from_table)
                .is_some_and(|t| t.has_column(&rel.foreign_key));
            if !owner_has_fk || !tables.contains_key(&rel.to_table) {
                return Err(SchemaError::DanglingRelationship {
                    from: rel.from_table.clone(),
                    to: rel.to_table.clone(),
                    foreign_key: rel.foreign_key.clone(),
                });
            }
        }

        let graph = RelationshipGraph::new(&relationships);
        debug!(
            "Schema registry loaded: {} tables, {} relationships",
            tables.len(),
            relationships.len()
        );

        Ok(Self {
            tables,
            relationships,
            graph,
        })
    }

    pub fn from_json_str(json: &str) -> Result<Self, SchemaError> {
        let raw: RawRegistry = serde_json::from_str(json)?;
        let tables = raw
            .tables
            .into_iter()
            .map(|(name, table)| TableSchema {
                name,
                columns: table.columns,
            })
            .collect();
        Self::new(tables, raw.relationships)
    }

    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        info!("Loading schema registry from {}", path.display());
        let json = std::fs::read_to_string(path).map_err(|source| SchemaError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// The CRM layout shipped with the crate.
    pub fn crm_default() -> Result<Self, SchemaError> {
        Self::from_json_str(CRM_REGISTRY)
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    pub fn relationships(&self) -> &[TableRelationship] {
        &self.relationships
    }

    pub fn graph(&self) -> &RelationshipGraph {
        &self.graph
    }

    /// Whether the foreign key column owning `rel` accepts NULL. Unknown
    /// columns count as nullable so the join degrades to LEFT.
    pub fn foreign_key_nullable(&self, rel: &TableRelationship) -> bool {
        self.table(&rel.from_table)
            .and_then(|t| t.column(&rel.foreign_key))
            .is_none_or(|c| c.nullable)
    }

    /// DDL plus foreign-key comments, used as model context.
    pub fn to_ddl(&self) -> String {
        let mut ddl: Vec<String> = self.tables.values().map(|t| t.to_create_table_sql()).collect();
        for rel in &self.relationships {
            ddl.push(format!(
                "-- {}.{} references {}.id",
                rel.from_table, rel.foreign_key, rel.to_table
            ));
        }
        ddl.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crm_registry_loads_with_relationships() {
        let registry = SchemaRegistry::crm_default().unwrap();
        assert!(registry.contains("accounts"));
        assert!(registry.contains("activities"));
        assert!(!registry.relationships().is_empty());
        let accounts = registry.table("accounts").unwrap();
        assert!(accounts.has_column("assigned_to"));
        assert!(!accounts.has_column("created_by"));
    }

    #[test]
    fn data_types_parse_loosely() {
        assert_eq!(DataType::from("numeric(10,2)".to_string()), DataType::Numeric);
        assert_eq!(DataType::from("TIMESTAMPTZ".to_string()), DataType::Timestamp);
        assert_eq!(
            DataType::from("jsonb".to_string()),
            DataType::Unknown("jsonb".to_string())
        );
    }

    #[test]
    fn dangling_relationship_is_rejected() {
        let tables = vec![TableSchema::new(
            "a",
            vec![ColumnSchema::new("id", DataType::Uuid, false)],
        )];
        let err = SchemaRegistry::new(tables, vec![TableRelationship::new("a", "b", "b_id")])
            .unwrap_err();
        assert!(matches!(err, SchemaError::DanglingRelationship { .. }));
    }

    #[test]
    fn relationships_accept_snake_case_keys() {
        let json = r#"{
            "tables": {
                "a": {"columns": [{"name": "id", "type": "uuid", "nullable": false}]},
                "b": {"columns": [{"name": "id", "type": "uuid"}, {"name": "a_id", "type": "uuid", "nullable": false}]}
            },
            "relationships": [{"from_table": "b", "to_table": "a", "foreign_key": "a_id"}]
        }"#;
        let registry = SchemaRegistry::from_json_str(json).unwrap();
        let rel = &registry.relationships()[0];
        assert!(!registry.foreign_key_nullable(rel));
        assert!(registry.to_ddl().contains("b.a_id references a.id"));
    }
}
