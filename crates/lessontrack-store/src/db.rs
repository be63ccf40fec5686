//! SQLite connection shared by the local key/value area and the SQLite
//! durable backend.
//!
//! [`Database`] keeps one `rusqlite::Connection` behind an `Arc<Mutex<>>`.
//! Every query runs on tokio's blocking pool, so callers stay async.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::migration;

/// Busy wait before a locked write fails, in milliseconds.
const BUSY_TIMEOUT_MS: i32 = 5_000;

/// Cloneable handle to one SQLite connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the file at `path`. Blocks on file I/O; async
    /// callers should prefer [`Database::open_and_migrate`].
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");
        Self::from_connection(Connection::open(path)?, true)
    }

    /// A private database that disappears with the last clone.
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("opening in-memory database");
        Self::from_connection(Connection::open_in_memory()?, false)
    }

    /// Open the file off the async runtime and bring its schema up to date.
    pub async fn open_and_migrate(path: impl AsRef<Path> + Send + 'static) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let db = tokio::task::spawn_blocking(move || Self::open(&path)).await??;
        db.run_migrations().await?;
        Ok(db)
    }

    /// In-memory counterpart of [`Database::open_and_migrate`].
    pub async fn in_memory_migrated() -> StoreResult<Self> {
        let db = Self::open_in_memory()?;
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn run_migrations(&self) -> StoreResult<()> {
        self.execute(migration::run_all).await
    }

    /// Run `f` with the connection on the blocking pool.
    pub async fn execute<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = lock(&conn)?;
            f(&guard)
        })
        .await?
    }

    /// Like [`execute`](Self::execute), with `&mut` access for transactions.
    pub async fn execute_mut<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&conn)?;
            f(&mut guard)
        })
        .await?
    }

    fn from_connection(conn: Connection, on_disk: bool) -> StoreResult<Self> {
        // WAL has no meaning for in-memory databases.
        if on_disk {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
        }
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MS)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn lock(conn: &Mutex<Connection>) -> StoreResult<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|e| StoreError::TaskJoin(format!("connection mutex poisoned: {e}")))
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrated_schema_has_every_table() {
        let db = Database::in_memory_migrated().await.unwrap();
        let tables: Vec<String> = db
            .execute(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
                )?;
                let names = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(names)
            })
            .await
            .unwrap();

        for table in [
            "kv",
            "user_progress",
            "exercise_results",
            "daily_activity",
            "profiles",
            "kv_store",
        ] {
            assert!(tables.iter().any(|t| t == table), "missing {table}");
        }
    }

    #[tokio::test]
    async fn file_database_persists_between_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.db");

        let db = Database::open_and_migrate(path.clone()).await.unwrap();
        db.execute_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute("INSERT INTO kv (key, value) VALUES ('a', '1')", [])?;
            tx.commit()?;
            Ok(())
        })
        .await
        .unwrap();
        drop(db);

        let reopened = Database::open_and_migrate(path).await.unwrap();
        let value: String = reopened
            .execute(|conn| {
                Ok(conn.query_row("SELECT value FROM kv WHERE key = 'a'", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(value, "1");
    }
}
