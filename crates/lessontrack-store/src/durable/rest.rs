//! [`DurableBackend`] over a PostgREST-style HTTP API.
//!
//! Tables live under `{base}/rest/v1/{table}`. Filters are encoded as
//! `column=eq.value`, ordering as `order=column.desc`, and upserts are a
//! `POST` with `on_conflict` plus `Prefer: resolution=merge-duplicates`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response};
use serde_json::Value;
use tracing::{debug, instrument};
use url::Url;

use super::{DurableBackend, Filter, Row, Select, Table, check_ident};
use crate::error::{StoreError, StoreResult};

/// Longest error body kept in a [`StoreError::Remote`] message.
const MAX_ERROR_BODY: usize = 512;

/// HTTP client for a PostgREST endpoint.
#[derive(Clone)]
pub struct RestBackend {
    client: reqwest::Client,
    base: Url,
    api_key: String,
}

impl RestBackend {
    /// Build a client for `base_url` (e.g. `https://project.example.co`).
    pub fn new(base_url: &str, api_key: impl Into<String>, timeout: Duration) -> StoreResult<Self> {
        let mut base = Url::parse(base_url)
            .map_err(|e| StoreError::Config(format!("invalid durable url `{base_url}`: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .user_agent(concat!("lessontrack/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base,
            api_key: api_key.into(),
        })
    }

    fn table_url(&self, table: Table) -> StoreResult<Url> {
        self.base
            .join("rest/v1/")
            .and_then(|u| u.join(table.name()))
            .map_err(|e| StoreError::Config(format!("cannot build url for {table}: {e}")))
    }

    pub(crate) fn select_url(&self, query: &Select) -> StoreResult<Url> {
        let mut url = self.table_url(query.table)?;
        {
            let mut pairs = url.query_pairs_mut();
            let projection = match &query.columns {
                Some(cols) => {
                    for c in cols {
                        check_ident(c)?;
                    }
                    cols.join(",")
                }
                None => "*".to_string(),
            };
            pairs.append_pair("select", &projection);
            append_filters(&mut pairs, &query.filters)?;
            if let Some(order) = query.order {
                check_ident(order.column)?;
                let dir = if order.descending { "desc" } else { "asc" };
                pairs.append_pair("order", &format!("{}.{dir}", order.column));
            }
            if let Some(limit) = query.limit {
                pairs.append_pair("limit", &limit.to_string());
            }
        }
        Ok(url)
    }

    fn count_url(&self, table: Table, filters: &[Filter]) -> StoreResult<Url> {
        let mut url = self.table_url(table)?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("select", "*");
            append_filters(&mut pairs, filters)?;
        }
        Ok(url)
    }

    pub(crate) fn upsert_url(&self, table: Table) -> StoreResult<Url> {
        let mut url = self.table_url(table)?;
        url.query_pairs_mut()
            .append_pair("on_conflict", &table.conflict_key().join(","));
        Ok(url)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Accept", "application/json")
    }

    async fn post_rows(&self, url: Url, rows: Vec<Row>, prefer: &str) -> StoreResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let response = self
            .authed(self.client.post(url))
            .header("Prefer", prefer)
            .json(&rows)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

#[async_trait]
impl DurableBackend for RestBackend {
    fn name(&self) -> &'static str {
        "rest"
    }

    #[instrument(skip(self), fields(table = %query.table))]
    async fn select(&self, query: &Select) -> StoreResult<Vec<Row>> {
        let url = self.select_url(query)?;
        let response = self.authed(self.client.get(url)).send().await?;
        let rows: Vec<Row> = check_status(response).await?.json().await?;
        debug!(rows = rows.len(), "rows fetched");
        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn count(&self, table: Table, filters: &[Filter]) -> StoreResult<u64> {
        let url = self.count_url(table, filters)?;
        let response = self
            .authed(self.client.head(url))
            .header("Prefer", "count=exact")
            .send()
            .await?;
        let response = check_status(response).await?;
        let header = response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        parse_content_range(header).ok_or_else(|| StoreError::Remote {
            status: response.status().as_u16(),
            message: format!("missing or malformed content-range: {header:?}"),
        })
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn insert(&self, table: Table, rows: Vec<Row>) -> StoreResult<()> {
        let url = self.table_url(table)?;
        self.post_rows(url, rows, "return=minimal").await
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn upsert(&self, table: Table, rows: Vec<Row>) -> StoreResult<()> {
        let url = self.upsert_url(table)?;
        self.post_rows(url, rows, "resolution=merge-duplicates,return=minimal")
            .await
    }
}

// ── helpers ──────────────────────────────────────────────────────────

fn append_filters(
    pairs: &mut url::form_urlencoded::Serializer<'_, url::UrlQuery<'_>>,
    filters: &[Filter],
) -> StoreResult<()> {
    for f in filters {
        check_ident(f.column)?;
        let expr = match &f.value {
            Value::Null => "is.null".to_string(),
            Value::String(s) => format!("eq.{s}"),
            other => format!("eq.{other}"),
        };
        pairs.append_pair(f.column, &expr);
    }
    Ok(())
}

async fn check_status(response: Response) -> StoreResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut message = response.text().await.unwrap_or_default();
    if message.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }
    Err(StoreError::Remote {
        status: status.as_u16(),
        message,
    })
}

/// Total from a `Content-Range` header such as `0-24/3573` or `*/0`.
fn parse_content_range(header: &str) -> Option<u64> {
    header.rsplit_once('/')?.1.trim().parse().ok()
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> RestBackend {
        RestBackend::new("https://db.example.com", "anon-key", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn select_url_encodes_filters_order_and_limit() {
        let q = Select::from(Table::Progress)
            .columns(&["lesson_id"])
            .eq("user_id", "u 1")
            .order_desc("lesson_id")
            .limit(1);
        let url = backend().select_url(&q).unwrap();

        assert_eq!(url.path(), "/rest/v1/user_progress");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("select".into(), "lesson_id".into()),
                ("user_id".into(), "eq.u 1".into()),
                ("order".into(), "lesson_id.desc".into()),
                ("limit".into(), "1".into()),
            ]
        );
    }

    #[test]
    fn numeric_and_null_filters() {
        let mut q = Select::from(Table::Profiles).eq("lesson_id", 12);
        q.filters.push(Filter {
            column: "username",
            value: Value::Null,
        });
        let url = backend().select_url(&q).unwrap();
        let query = url.query().unwrap();
        assert!(query.contains("lesson_id=eq.12"));
        assert!(query.contains("username=is.null"));
    }

    #[test]
    fn upsert_url_carries_conflict_key() {
        let url = backend().upsert_url(Table::Progress).unwrap();
        assert_eq!(url.query(), Some("on_conflict=user_id%2Clesson_id"));

        let url = backend().upsert_url(Table::ExerciseResults).unwrap();
        assert_eq!(url.query(), Some("on_conflict=id"));
    }

    #[test]
    fn base_path_is_preserved() {
        let b = RestBackend::new("https://host.example.com/api", "k", Duration::from_secs(1))
            .unwrap();
        let url = b.select_url(&Select::from(Table::KvMirror)).unwrap();
        assert_eq!(url.path(), "/api/rest/v1/kv_store");
    }

    #[test]
    fn invalid_url_is_config_error() {
        let result = RestBackend::new("not a url", "k", Duration::from_secs(1));
        assert!(matches!(result, Err(StoreError::Config(_))));
    }

    #[test]
    fn content_range_parsing() {
        assert_eq!(parse_content_range("0-24/3573"), Some(3573));
        assert_eq!(parse_content_range("*/0"), Some(0));
        assert_eq!(parse_content_range("garbage"), None);
    }
}
