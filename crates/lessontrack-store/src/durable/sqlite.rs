//! [`DurableBackend`] on top of the local SQLite [`Database`].

use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::{Number, Value};
use tracing::{debug, instrument};

use super::{DurableBackend, Filter, Row, Select, Table, check_ident};
use crate::db::Database;
use crate::error::{StoreError, StoreResult};

/// SQLite-backed durable store. The schema comes from the crate migrations.
#[derive(Clone)]
pub struct SqliteBackend {
    db: Database,
}

impl SqliteBackend {
    /// Wrap an already-migrated database.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl DurableBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    #[instrument(skip(self), fields(table = %query.table))]
    async fn select(&self, query: &Select) -> StoreResult<Vec<Row>> {
        let projection = match &query.columns {
            Some(cols) => {
                for c in cols {
                    check_ident(c)?;
                }
                cols.join(", ")
            }
            None => "*".to_string(),
        };
        let (clause, params) = where_clause(&query.filters)?;
        let mut sql = format!("SELECT {projection} FROM {}{clause}", query.table.name());
        if let Some(order) = query.order {
            check_ident(order.column)?;
            let dir = if order.descending { "DESC" } else { "ASC" };
            sql.push_str(&format!(" ORDER BY {} {dir}", order.column));
        }
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let names: Vec<String> =
                    stmt.column_names().iter().map(|s| s.to_string()).collect();
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                        let mut out = Row::new();
                        for (i, name) in names.iter().enumerate() {
                            out.insert(name.clone(), to_json(row.get_ref(i)?));
                        }
                        Ok(out)
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    #[instrument(skip(self))]
    async fn count(&self, table: Table, filters: &[Filter]) -> StoreResult<u64> {
        let (clause, params) = where_clause(filters)?;
        let sql = format!("SELECT COUNT(*) FROM {}{clause}", table.name());
        self.db
            .execute(move |conn| {
                let n: i64 =
                    conn.query_row(&sql, rusqlite::params_from_iter(params.iter()), |row| {
                        row.get(0)
                    })?;
                Ok(n.max(0) as u64)
            })
            .await
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn insert(&self, table: Table, rows: Vec<Row>) -> StoreResult<()> {
        self.write_rows(table, rows, false).await
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn upsert(&self, table: Table, rows: Vec<Row>) -> StoreResult<()> {
        self.write_rows(table, rows, true).await
    }
}

impl SqliteBackend {
    /// Write every row in one transaction; any failure rolls back the batch.
    async fn write_rows(&self, table: Table, rows: Vec<Row>, upsert: bool) -> StoreResult<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut statements = Vec::with_capacity(rows.len());
        for row in rows {
            statements.push(write_statement(table, row, upsert)?);
        }

        let n = statements.len();
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                for (sql, params) in &statements {
                    tx.execute(sql, rusqlite::params_from_iter(params.iter()))?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;

        debug!(table = %table, rows = n, upsert, "rows written");
        Ok(())
    }
}

// ── SQL building ─────────────────────────────────────────────────────

fn where_clause(filters: &[Filter]) -> StoreResult<(String, Vec<SqlValue>)> {
    if filters.is_empty() {
        return Ok((String::new(), Vec::new()));
    }
    let mut parts = Vec::with_capacity(filters.len());
    let mut params = Vec::with_capacity(filters.len());
    for f in filters {
        check_ident(f.column)?;
        if f.value.is_null() {
            parts.push(format!("{} IS NULL", f.column));
        } else {
            params.push(to_sql(&f.value)?);
            parts.push(format!("{} = ?{}", f.column, params.len()));
        }
    }
    Ok((format!(" WHERE {}", parts.join(" AND ")), params))
}

fn write_statement(table: Table, row: Row, upsert: bool) -> StoreResult<(String, Vec<SqlValue>)> {
    if row.is_empty() {
        return Err(StoreError::InvalidArgument(format!(
            "empty row for {table}"
        )));
    }

    let mut columns = Vec::with_capacity(row.len());
    let mut params = Vec::with_capacity(row.len());
    for (column, value) in &row {
        check_ident(column)?;
        columns.push(column.as_str());
        params.push(to_sql(value)?);
    }
    let placeholders: Vec<String> = (1..=params.len()).map(|i| format!("?{i}")).collect();
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table.name(),
        columns.join(", "),
        placeholders.join(", ")
    );

    if upsert {
        let key = table.conflict_key();
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !key.contains(c))
            .map(|c| format!("{c} = excluded.{c}"))
            .collect();
        sql.push_str(&format!(" ON CONFLICT({}) DO ", key.join(", ")));
        if updates.is_empty() {
            sql.push_str("NOTHING");
        } else {
            sql.push_str(&format!("UPDATE SET {}", updates.join(", ")));
        }
    }

    Ok((sql, params))
}

fn to_sql(value: &Value) -> StoreResult<SqlValue> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(serde_json::to_string(value)?),
    })
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(t) | ValueRef::Blob(t) => {
            Value::String(String::from_utf8_lossy(t).into_owned())
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    async fn backend() -> SqliteBackend {
        SqliteBackend::new(Database::in_memory_migrated().await.unwrap())
    }

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn upsert_updates_only_carried_columns() {
        let b = backend().await;
        b.upsert(
            Table::Progress,
            vec![row(json!({"user_id": "u1", "lesson_id": 3, "percentage": 40, "reading_completed": true}))],
        )
        .await
        .unwrap();
        b.upsert(
            Table::Progress,
            vec![row(json!({"user_id": "u1", "lesson_id": 3, "percentage": 70}))],
        )
        .await
        .unwrap();

        let found = b
            .maybe_single(&Select::from(Table::Progress).eq("user_id", "u1").eq("lesson_id", 3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found["percentage"], json!(70));
        assert_eq!(found["reading_completed"], json!(1));
        assert_eq!(b.count(Table::Progress, &[]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn insert_conflict_fails_whole_batch() {
        let b = backend().await;
        let p = row(json!({"id": "u1", "username": "ana"}));
        let result = b.insert(Table::Profiles, vec![p.clone(), p]).await;
        assert!(result.is_err());
        assert_eq!(b.count(Table::Profiles, &[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn select_orders_and_limits() {
        let b = backend().await;
        let rows = (1..=3)
            .map(|i| row(json!({"user_id": "u1", "lesson_id": i})))
            .collect();
        b.upsert(Table::Progress, rows).await.unwrap();

        let q = Select::from(Table::Progress)
            .columns(&["lesson_id"])
            .eq("user_id", "u1")
            .order_desc("lesson_id")
            .limit(2);
        let found = b.select(&q).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0]["lesson_id"], json!(3));
        assert!(!found[0].contains_key("user_id"));
    }

    #[tokio::test]
    async fn maybe_single_rejects_many() {
        let b = backend().await;
        let rows = (1..=2)
            .map(|i| row(json!({"user_id": "u1", "lesson_id": i})))
            .collect();
        b.upsert(Table::Progress, rows).await.unwrap();

        let result = b
            .maybe_single(&Select::from(Table::Progress).eq("user_id", "u1"))
            .await;
        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn null_filter_matches_null() {
        let b = backend().await;
        b.upsert(Table::Profiles, vec![row(json!({"id": "u1"}))])
            .await
            .unwrap();
        let n = b
            .count(
                Table::Profiles,
                &[Filter {
                    column: "username",
                    value: Value::Null,
                }],
            )
            .await
            .unwrap();
        assert_eq!(n, 1);
    }
}
