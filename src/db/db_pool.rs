use duckdb::Connection;
use r2d2::ManageConnection;
use std::sync::Mutex;

pub const IN_MEMORY: &str = ":memory:";

/// r2d2 manager for DuckDB. The database is opened once; pooled connections
/// are clones of that root handle, so file and in-memory databases alike are
/// shared by every connection in the pool.
pub struct DuckDBConnectionManager {
    connection_string: String,
    root: Mutex<Connection>,
}

impl DuckDBConnectionManager {
    pub fn new(connection_string: String) -> Result<Self, duckdb::Error> {
        let root = if connection_string == IN_MEMORY {
            Connection::open_in_memory()?
        } else {
            Connection::open(&connection_string)?
        };
        Ok(Self {
            connection_string,
            root: Mutex::new(root),
        })
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}

impl ManageConnection for DuckDBConnectionManager {
    type Connection = Connection;
    type Error = duckdb::Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let root = self.root.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        root.try_clone()
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.execute_batch("SELECT 1")
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}
