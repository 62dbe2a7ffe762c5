use async_trait::async_trait;
use tracing::debug;

use super::{DuckDbPool, ExecutionError};
use crate::query::{UserContext, is_identifier};

/// Looks up who is asking. Callers fall back to an anonymous context on
/// any error, so implementations need not invent one.
#[async_trait]
pub trait UserContextProvider: Send + Sync {
    async fn user_context(&self, user_id: &str) -> Result<Option<UserContext>, ExecutionError>;
}

/// Reads `id`, `name` and `role` from a directory table such as `employees`.
pub struct DuckDbUserDirectory {
    pool: DuckDbPool,
    table: String,
}

impl DuckDbUserDirectory {
    pub fn new(pool: DuckDbPool, table: &str) -> Self {
        let table = if is_identifier(table) { table } else { "employees" };
        Self {
            pool,
            table: table.to_string(),
        }
    }
}

#[async_trait]
impl UserContextProvider for DuckDbUserDirectory {
    async fn user_context(&self, user_id: &str) -> Result<Option<UserContext>, ExecutionError> {
        let pool = self.pool.clone();
        let sql = format!(
            "SELECT CAST(id AS VARCHAR), name, role FROM {} WHERE CAST(id AS VARCHAR) = ? LIMIT 1",
            self.table
        );
        let user_id = user_id.to_string();

        let found = tokio::task::spawn_blocking(move || -> Result<Option<UserContext>, ExecutionError> {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query_map(duckdb::params![user_id], |row| {
                Ok(UserContext {
                    user_id: row.get::<_, String>(0)?,
                    display_name: row.get::<_, Option<String>>(1)?,
                    role: row.get::<_, Option<String>>(2)?.unwrap_or_else(|| "user".to_string()),
                    permissions: Vec::new(),
                })
            })?;
            Ok(rows.next().transpose()?)
        })
        .await??;

        debug!("User directory lookup found: {}", found.is_some());
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::build_pool;

    #[tokio::test]
    async fn looks_up_role_by_id() {
        let pool = build_pool(":memory:", 1).unwrap();
        pool.get()
            .unwrap()
            .execute_batch(
                "CREATE TABLE employees (id VARCHAR, name VARCHAR, role VARCHAR);
                 INSERT INTO employees VALUES ('e1', 'Dana', 'admin'), ('e2', 'Lee', NULL);",
            )
            .unwrap();
        let directory = DuckDbUserDirectory::new(pool, "employees");

        let dana = directory.user_context("e1").await.unwrap().unwrap();
        assert!(dana.is_admin());
        assert_eq!(dana.display_name.as_deref(), Some("Dana"));

        let lee = directory.user_context("e2").await.unwrap().unwrap();
        assert!(!lee.is_admin());
        assert!(directory.user_context("nobody").await.unwrap().is_none());
    }
}
