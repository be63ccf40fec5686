//! Error types for the lessontrack-store crate.
//!
//! Internal operations return [`StoreError`] via [`StoreResult`]. The public
//! facade, reconciler and importer never hand these to callers directly;
//! they flatten them into outcome values carrying a message.

use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in either store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The HTTP transport to the durable store failed.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The durable store answered with a non-success status.
    #[error("remote store returned {status}: {message}")]
    Remote { status: u16, message: String },

    /// A durable call did not finish within the configured budget.
    #[error("{operation} timed out after {millis} ms")]
    Timeout { operation: &'static str, millis: u64 },

    /// A schema migration failed.
    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },

    /// An invalid argument was provided to a store operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Settings could not be loaded or are inconsistent.
    #[error("config error: {0}")]
    Config(String),

    /// No durable backend is configured for this process.
    #[error("durable store is not configured")]
    NotConfigured,

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

impl From<toml::de::Error> for StoreError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl StoreError {
    /// Whether the failure came from reaching the durable store at all
    /// (network, timeout, remote status) rather than from bad input.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::Remote { .. } | Self::Timeout { .. } | Self::NotConfigured
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_classification() {
        assert!(StoreError::NotConfigured.is_transport());
        assert!(
            StoreError::Timeout {
                operation: "select",
                millis: 10
            }
            .is_transport()
        );
        assert!(!StoreError::InvalidArgument("x".into()).is_transport());
        assert!(!StoreError::Config("x".into()).is_transport());
    }
}
