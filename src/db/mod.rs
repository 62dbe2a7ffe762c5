pub mod db_pool;
pub mod executor;
pub mod users;

use r2d2::Pool;
use tracing::info;

use crate::schema::SchemaRegistry;

pub use db_pool::DuckDBConnectionManager;
pub use executor::{DuckDbExecutor, ExecutionError, QueryExecutor};
pub use users::{DuckDbUserDirectory, UserContextProvider};

/// One result row, column name to JSON value.
pub type Row = serde_json::Map<String, serde_json::Value>;

pub type DuckDbPool = Pool<DuckDBConnectionManager>;

pub fn build_pool(connection_string: &str, pool_size: u32) -> Result<DuckDbPool, ExecutionError> {
    info!("Initializing DuckDB connection pool for {}", connection_string);
    let manager = DuckDBConnectionManager::new(connection_string.to_string())?;
    let pool = Pool::builder().max_size(pool_size.max(1)).build(manager)?;
    Ok(pool)
}

/// Creates any registry table the database does not have yet.
pub async fn bootstrap_schema(pool: &DuckDbPool, registry: &SchemaRegistry) -> Result<(), ExecutionError> {
    let statements: Vec<String> = registry
        .tables()
        .map(|table| {
            let columns: Vec<String> = table.columns.iter().map(|c| c.to_sql_definition()).collect();
            format!("CREATE TABLE IF NOT EXISTS {} ({});", table.name, columns.join(", "))
        })
        .collect();
    let pool = pool.clone();

    tokio::task::spawn_blocking(move || -> Result<(), ExecutionError> {
        let conn = pool.get()?;
        conn.execute_batch(&statements.join("\n"))?;
        info!("Ensured {} registry tables exist", statements.len());
        Ok(())
    })
    .await?
}
