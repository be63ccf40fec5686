//! Process-wide, lazily connected durable backend.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{info, warn};

use super::{DurableBackend, RestBackend, SqliteBackend};
use crate::config::{DurableKind, DurableSettings};
use crate::db::Database;
use crate::error::{StoreError, StoreResult};

/// Future produced by a connect function.
pub type ConnectFuture =
    Pin<Box<dyn Future<Output = StoreResult<Arc<dyn DurableBackend>>> + Send>>;
type Connect = Box<dyn Fn() -> ConnectFuture + Send + Sync>;

/// Shared handle to the durable backend, connected on first use.
///
/// Clones share one cell. Concurrent first callers wait on a single
/// connection attempt; a failed attempt is not cached, so the next call
/// tries again.
#[derive(Clone)]
pub struct SharedDurable {
    inner: Arc<Inner>,
}

struct Inner {
    cell: OnceCell<Arc<dyn DurableBackend>>,
    connect: Connect,
}

impl SharedDurable {
    /// Connect according to `settings` on first use.
    pub fn from_settings(settings: DurableSettings) -> Self {
        Self::lazy(move || -> ConnectFuture {
            let settings = settings.clone();
            Box::pin(async move { connect(&settings).await })
        })
    }

    /// Connect with `connect` on first use.
    pub fn lazy<F>(connect: F) -> Self
    where
        F: Fn() -> ConnectFuture + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                cell: OnceCell::new(),
                connect: Box::new(connect),
            }),
        }
    }

    /// A handle that is already connected to `backend`.
    pub fn ready(backend: Arc<dyn DurableBackend>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cell: OnceCell::new_with(Some(backend)),
                connect: Box::new(not_configured),
            }),
        }
    }

    /// A handle with no backend; every call fails with
    /// [`StoreError::NotConfigured`].
    pub fn unconfigured() -> Self {
        Self::lazy(not_configured)
    }

    /// The backend, connecting first if this is the first call.
    pub async fn get(&self) -> StoreResult<Arc<dyn DurableBackend>> {
        let backend = self
            .inner
            .cell
            .get_or_try_init(|| (self.inner.connect)())
            .await?;
        Ok(Arc::clone(backend))
    }

    pub fn is_connected(&self) -> bool {
        self.inner.cell.initialized()
    }
}

fn not_configured() -> ConnectFuture {
    Box::pin(async { Err(StoreError::NotConfigured) })
}

async fn connect(settings: &DurableSettings) -> StoreResult<Arc<dyn DurableBackend>> {
    match settings.backend {
        DurableKind::None => Err(StoreError::NotConfigured),
        DurableKind::Sqlite => {
            let db = match &settings.path {
                Some(path) => Database::open_and_migrate(path.clone()).await?,
                None => Database::in_memory_migrated().await?,
            };
            info!(path = ?settings.path, "durable store connected (sqlite)");
            Ok(Arc::new(SqliteBackend::new(db)))
        }
        DurableKind::Rest => {
            let Some(url) = settings.url.as_deref() else {
                warn!("rest backend selected without a url");
                return Err(StoreError::Config("durable.url is required".into()));
            };
            let backend = RestBackend::new(
                url,
                settings.api_key.clone().unwrap_or_default(),
                settings.timeout(),
            )?;
            info!(url, "durable store connected (rest)");
            Ok(Arc::new(backend))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn concurrent_first_use_connects_once() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let handle = SharedDurable::lazy(move || -> ConnectFuture {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                let db = Database::in_memory_migrated().await?;
                Ok(Arc::new(SqliteBackend::new(db)) as Arc<dyn DurableBackend>)
            })
        });

        let other = handle.clone();
        let (a, b, c) = tokio::join!(handle.get(), other.get(), handle.get());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(handle.is_connected());
    }

    #[tokio::test]
    async fn failed_connect_is_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let handle = SharedDurable::lazy(move || -> ConnectFuture {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if n == 0 {
                    return Err(StoreError::NotConfigured);
                }
                let db = Database::in_memory_migrated().await?;
                Ok(Arc::new(SqliteBackend::new(db)) as Arc<dyn DurableBackend>)
            })
        });

        assert!(handle.get().await.is_err());
        assert!(!handle.is_connected());
        assert!(handle.get().await.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unconfigured_always_fails() {
        let handle = SharedDurable::unconfigured();
        assert!(matches!(handle.get().await, Err(StoreError::NotConfigured)));
    }

    #[tokio::test]
    async fn sqlite_settings_connect_in_memory() {
        let settings = DurableSettings {
            backend: DurableKind::Sqlite,
            ..DurableSettings::default()
        };
        let handle = SharedDurable::from_settings(settings);
        let backend = handle.get().await.unwrap();
        assert_eq!(backend.name(), "sqlite");
    }
}
