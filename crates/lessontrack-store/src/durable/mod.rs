//! Durable, identity-scoped store.
//!
//! The engine behind it is a capability, not an implementation: anything
//! that offers equality-filtered selects, counts, inserts and upserts on a
//! conflict key can implement [`DurableBackend`]. Two backends ship here:
//!
//! * [`SqliteBackend`] — a local SQLite file, for tests and self-hosting.
//! * [`RestBackend`] — a PostgREST-style HTTP API.
//!
//! [`DurableStore`] is the typed adapter the rest of the crate talks to. It
//! reaches the backend through a [`SharedDurable`] handle and puts a time
//! budget on every call.

mod handle;
mod rest;
mod sqlite;
mod store;

pub use handle::{ConnectFuture, SharedDurable};
pub use rest::RestBackend;
pub use sqlite::SqliteBackend;
pub use store::{DURABLE_STREAK_PLACEHOLDER, DurableStore};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{StoreError, StoreResult};

/// One row as exchanged with a backend: column name → JSON value.
pub type Row = serde_json::Map<String, Value>;

/// Collections the durable store exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Progress,
    ExerciseResults,
    DailyActivity,
    Profiles,
    /// Optional per-user key/value mirror.
    KvMirror,
}

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Self::Progress => "user_progress",
            Self::ExerciseResults => "exercise_results",
            Self::DailyActivity => "daily_activity",
            Self::Profiles => "profiles",
            Self::KvMirror => "kv_store",
        }
    }

    /// Columns that identify a row when resolving upsert conflicts.
    pub fn conflict_key(self) -> &'static [&'static str] {
        match self {
            Self::Progress => &["user_id", "lesson_id"],
            Self::Profiles | Self::ExerciseResults => &["id"],
            Self::DailyActivity => &["user_id", "activity_date"],
            Self::KvMirror => &["user_id", "key"],
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// `column = value` restriction.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: &'static str,
    pub value: Value,
}

/// Result ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Order {
    pub column: &'static str,
    pub descending: bool,
}

/// A row selection: equality filters, optional projection, order and limit.
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: Table,
    /// `None` selects every column.
    pub columns: Option<Vec<&'static str>>,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl Select {
    pub fn from(table: Table) -> Self {
        Self {
            table,
            columns: None,
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    pub fn columns(mut self, columns: &[&'static str]) -> Self {
        self.columns = Some(columns.to_vec());
        self
    }

    pub fn eq(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            column,
            value: value.into(),
        });
        self
    }

    pub fn order_desc(mut self, column: &'static str) -> Self {
        self.order = Some(Order {
            column,
            descending: true,
        });
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }
}

/// What the core needs from a durable engine.
#[async_trait]
pub trait DurableBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Rows matching `query`.
    async fn select(&self, query: &Select) -> StoreResult<Vec<Row>>;

    /// Number of rows in `table` matching every filter.
    async fn count(&self, table: Table, filters: &[Filter]) -> StoreResult<u64>;

    /// Insert new rows. Fails on any key conflict.
    async fn insert(&self, table: Table, rows: Vec<Row>) -> StoreResult<()>;

    /// Insert rows, or update the columns they carry when a row with the
    /// same [`Table::conflict_key`] already exists. Columns a row does not
    /// carry are left as they are.
    async fn upsert(&self, table: Table, rows: Vec<Row>) -> StoreResult<()>;

    /// At most one row matching `query`; more than one is an error.
    async fn maybe_single(&self, query: &Select) -> StoreResult<Option<Row>> {
        let mut rows = self.select(&query.clone().limit(2)).await?;
        match rows.len() {
            0 => Ok(None),
            1 => Ok(rows.pop()),
            n => Err(StoreError::InvalidArgument(format!(
                "expected at most one row from {}, got {n}",
                query.table
            ))),
        }
    }
}

/// Reject identifiers that could not have come from this crate.
pub(crate) fn check_ident(ident: &str) -> StoreResult<()> {
    let ok = !ident.is_empty()
        && ident
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidArgument(format!(
            "invalid column name: {ident:?}"
        )))
    }
}
