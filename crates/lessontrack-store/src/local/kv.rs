//! SQLite-backed local key/value area.
//!
//! Stores plain string pairs in the `kv` table so the device-local
//! collections, the mode preference and the cached handle survive restarts.

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::LocalStorage;
use crate::db::Database;
use crate::error::StoreResult;

/// Persistent key/value area on a local SQLite file.
#[derive(Clone)]
pub struct KvStore {
    db: Database,
}

impl KvStore {
    /// Create a key/value area backed by `db`. The `kv` table must exist.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// List all keys, sorted. Mostly useful for diagnostics.
    #[instrument(skip(self))]
    pub async fn keys(&self) -> StoreResult<Vec<String>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY key")?;
                let keys = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(keys)
            })
            .await
    }
}

#[async_trait]
impl LocalStorage for KvStore {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let key = key.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    "SELECT value FROM kv WHERE key = ?1",
                    rusqlite::params![key],
                    |row| row.get(0),
                );
                match result {
                    Ok(value) => Ok(Some(value)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }

    #[instrument(skip(self, value))]
    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO kv (key, value) VALUES (?1, ?2) \
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    rusqlite::params![key, value],
                )?;
                debug!(key = %key, "local value updated");
                Ok(())
            })
            .await
    }

    #[instrument(skip(self))]
    async fn remove(&self, key: &str) -> StoreResult<bool> {
        let key = key.to_string();
        self.db
            .execute(move |conn| {
                let deleted =
                    conn.execute("DELETE FROM kv WHERE key = ?1", rusqlite::params![key])?;
                Ok(deleted > 0)
            })
            .await
    }
}

// ── tests ────────────────────────────────────────────────────────────
