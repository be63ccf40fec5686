//! Versioned schema for every SQLite file this crate opens.
//!
//! One schema serves both the local key/value area (`kv`) and the SQLite
//! durable backend (everything else). Applied versions are recorded in
//! `_migrations`; each step runs at most once per file.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

struct Migration {
    version: u32,
    description: &'static str,
    /// One or more `;`-separated statements.
    sql: &'static str,
}

/// Append only; versions strictly increase.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "local key/value area",
        sql: r#"
            CREATE TABLE kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 2,
        description: "durable progress, exercise results and daily activity",
        sql: r#"
            CREATE TABLE user_progress (
                id                   INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id              TEXT NOT NULL,
                lesson_id            INTEGER NOT NULL,
                vocabulary_completed BOOLEAN NOT NULL DEFAULT 0,
                listening_completed  BOOLEAN NOT NULL DEFAULT 0,
                speaking_completed   BOOLEAN NOT NULL DEFAULT 0,
                reading_completed    BOOLEAN NOT NULL DEFAULT 0,
                writing_completed    BOOLEAN NOT NULL DEFAULT 0,
                percentage           INTEGER NOT NULL DEFAULT 0 CHECK(percentage BETWEEN 0 AND 100),
                last_accessed        TEXT,
                UNIQUE(user_id, lesson_id)
            );
            CREATE INDEX idx_user_progress_user ON user_progress(user_id);

            CREATE TABLE exercise_results (
                id                 TEXT PRIMARY KEY,
                user_id            TEXT NOT NULL,
                lesson_id          INTEGER NOT NULL,
                exercise_type      TEXT NOT NULL,
                score              INTEGER NOT NULL DEFAULT 0,
                total_questions    INTEGER NOT NULL DEFAULT 0,
                correct_answers    INTEGER NOT NULL DEFAULT 0 CHECK(correct_answers <= total_questions),
                time_spent_seconds INTEGER NOT NULL DEFAULT 0,
                completed_at       TEXT NOT NULL
            );
            CREATE INDEX idx_exercise_results_user ON exercise_results(user_id, completed_at);

            CREATE TABLE daily_activity (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id       TEXT NOT NULL,
                activity_date TEXT NOT NULL,
                minutes_spent INTEGER NOT NULL DEFAULT 0,
                streak        INTEGER NOT NULL DEFAULT 0,
                UNIQUE(user_id, activity_date)
            );
        "#,
    },
    Migration {
        version: 3,
        description: "profiles and the per-user key/value mirror",
        sql: r#"
            CREATE TABLE profiles (
                id         TEXT PRIMARY KEY,
                username   TEXT,
                updated_at TEXT
            );

            CREATE TABLE kv_store (
                user_id    TEXT NOT NULL,
                key        TEXT NOT NULL,
                value      TEXT,
                updated_at TEXT,
                PRIMARY KEY(user_id, key)
            );
        "#,
    },
];

// ── runner ───────────────────────────────────────────────────────────

/// Bring `conn` up to the newest schema. Synchronous; callers on the
/// async runtime go through [`Database::execute`](crate::db::Database::execute).
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(failed(0, "create _migrations"))?;

    let from = current_version(conn)?;
    let mut applied = 0usize;
    for step in MIGRATIONS.iter().skip_while(|m| m.version <= from) {
        apply(conn, step)?;
        applied += 1;
    }

    if applied == 0 {
        debug!(version = from, "schema up to date");
    } else {
        info!(from, applied, "schema migrated");
    }
    Ok(())
}

/// Highest applied version; 0 on a fresh database.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |row| {
        row.get(0)
    })
    .map_err(failed(0, "read schema version"))
}

/// Runs one step and records it, all or nothing. The transaction rolls
/// back when dropped uncommitted.
fn apply(conn: &Connection, step: &Migration) -> StoreResult<()> {
    info!(version = step.version, description = step.description, "applying migration");

    let tx = conn
        .unchecked_transaction()
        .map_err(failed(step.version, "begin"))?;
    let outcome = tx
        .execute_batch(step.sql)
        .map_err(failed(step.version, "run sql"))
        .and_then(|()| {
            let now = chrono::Utc::now().timestamp();
            tx.execute(
                "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![step.version, step.description, now],
            )
            .map_err(failed(step.version, "record version"))
        });

    match outcome {
        Ok(_) => tx.commit().map_err(failed(step.version, "commit")),
        Err(err) => {
            warn!(version = step.version, %err, "migration rolled back");
            Err(err)
        }
    }
}

fn failed(version: u32, stage: &'static str) -> impl Fn(rusqlite::Error) -> StoreError {
    move |e| StoreError::Migration {
        version,
        message: format!("{stage}: {e}"),
    }
}

// ── tests ────────────────────────────────────────────────────────────
