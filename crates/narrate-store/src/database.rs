use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::info;

use crate::error::StoreError;
use crate::schema;

/// Shared handle to the chunk store. Clones share one connection behind a
/// mutex; every repository call takes the lock for its whole duration.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    /// Open (creating if needed) the store at `path`, including parent dirs.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|e| StoreError::Io(format!("{}: {e}", dir.display())))?;
        }
        let conn = Connection::open(path).map_err(|e| StoreError::Database(e.to_string()))?;
        let db = Self::prepare(conn, path.to_owned())?;
        info!(path = %path.display(), "chunk store opened");
        Ok(db)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().map_err(|e| StoreError::Database(e.to_string()))?;
        Self::prepare(conn, PathBuf::from(":memory:"))
    }

    fn prepare(conn: Connection, path: PathBuf) -> Result<Self, StoreError> {
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Run `f` while holding the connection. Statements inside one call are
    /// never interleaved with another caller's.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        f(&self.conn.lock())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Apply pragmas and tables, then stamp or check the schema version.
fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let setup = |sql: &str, what: &str| {
        conn.execute_batch(sql)
            .map_err(|e| StoreError::Database(format!("{what}: {e}")))
    };
    setup(schema::PRAGMAS, "applying pragmas")?;
    setup(schema::CREATE_TABLES, "creating tables")?;

    let stored: Option<u32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .ok();
    match stored {
        Some(v) if v > schema::SCHEMA_VERSION => Err(StoreError::Database(format!(
            "store was written by a newer schema ({v} > {})",
            schema::SCHEMA_VERSION
        ))),
        Some(_) => Ok(()),
        None => conn
            .execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [schema::SCHEMA_VERSION],
            )
            .map(|_| ())
            .map_err(|e| StoreError::Database(format!("stamping schema version: {e}"))),
    }
}
