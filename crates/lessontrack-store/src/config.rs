//! Settings for both stores.
//!
//! Loaded from TOML, then overridden by `LESSONTRACK_*` environment
//! variables. Every field has a default, so an empty file (or none at all)
//! yields an in-memory local area and no durable store.
//!
//! ```toml
//! [local]
//! path = "data/local.db"
//!
//! [durable]
//! backend = "rest"
//! url = "https://project.example.co"
//! api_key = "..."
//! timeout_ms = 8000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "LESSONTRACK_";

/// Default budget for a single durable call.
pub const DEFAULT_DURABLE_TIMEOUT_MS: u64 = 8_000;

/// Top-level settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub local: LocalSettings,
    pub durable: DurableSettings,
}

/// Device-local key/value area.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSettings {
    /// SQLite file holding the area. `None` keeps it in memory.
    pub path: Option<PathBuf>,
}

/// Which engine backs the durable store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurableKind {
    /// No durable store; every durable call fails and is handled as such.
    #[default]
    None,
    Sqlite,
    Rest,
}

impl DurableKind {
    fn parse(s: &str) -> StoreResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "sqlite" => Ok(Self::Sqlite),
            "rest" => Ok(Self::Rest),
            other => Err(StoreError::Config(format!(
                "unknown durable backend: {other}"
            ))),
        }
    }
}

/// Durable store connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DurableSettings {
    pub backend: DurableKind,
    /// SQLite file for the `sqlite` backend. `None` keeps it in memory.
    pub path: Option<PathBuf>,
    /// Base URL for the `rest` backend.
    pub url: Option<String>,
    pub api_key: Option<String>,
    /// Budget for one durable call, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for DurableSettings {
    fn default() -> Self {
        Self {
            backend: DurableKind::None,
            path: None,
            url: None,
            api_key: None,
            timeout_ms: DEFAULT_DURABLE_TIMEOUT_MS,
        }
    }
}

impl DurableSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Settings {
    /// Parse settings from a TOML string.
    pub fn from_toml_str(raw: &str) -> StoreResult<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Read settings from `path`, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            StoreError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut settings = Self::from_toml_str(&raw)?;
        settings.apply_env(std::env::vars())?;
        settings.validate()?;
        info!(path = %path.display(), backend = ?settings.durable.backend, "settings loaded");
        Ok(settings)
    }

    /// Defaults plus environment overrides, for processes without a file.
    pub fn from_env() -> StoreResult<Self> {
        let mut settings = Self::default();
        settings.apply_env(std::env::vars())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `LESSONTRACK_*` overrides from `vars`. Unrelated keys are ignored.
    pub fn apply_env<I>(&mut self, vars: I) -> StoreResult<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "LOCAL_PATH" => self.local.path = Some(PathBuf::from(value)),
                "DURABLE_BACKEND" => self.durable.backend = DurableKind::parse(&value)?,
                "DURABLE_PATH" => self.durable.path = Some(PathBuf::from(value)),
                "DURABLE_URL" => self.durable.url = Some(value),
                "DURABLE_API_KEY" => self.durable.api_key = Some(value),
                "DURABLE_TIMEOUT_MS" => {
                    self.durable.timeout_ms = value.trim().parse().map_err(|e| {
                        StoreError::Config(format!("{key} must be an integer: {e}"))
                    })?;
                }
                _ => continue,
            }
            debug!(key = %key, "setting overridden from environment");
        }
        Ok(())
    }

    /// Reject combinations that cannot work.
    pub fn validate(&self) -> StoreResult<()> {
        if self.durable.timeout_ms == 0 {
            return Err(StoreError::Config(
                "durable.timeout_ms must be greater than zero".into(),
            ));
        }
        if self.durable.backend == DurableKind::Rest
            && self.durable.url.as_deref().is_none_or(|u| u.trim().is_empty())
        {
            return Err(StoreError::Config(
                "durable.backend = \"rest\" requires durable.url".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_toml_is_all_defaults() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.durable.backend, DurableKind::None);
        assert_eq!(settings.durable.timeout_ms, DEFAULT_DURABLE_TIMEOUT_MS);
    }

    #[test]
    fn parses_rest_section() {
        let settings = Settings::from_toml_str(
            r#"
            [local]
            path = "local.db"

            [durable]
            backend = "rest"
            url = "https://db.example.com"
            api_key = "k"
            timeout_ms = 1500
            "#,
        )
        .unwrap();
        assert_eq!(settings.local.path, Some(PathBuf::from("local.db")));
        assert_eq!(settings.durable.backend, DurableKind::Rest);
        assert_eq!(settings.durable.timeout(), Duration::from_millis(1500));
        settings.validate().unwrap();
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let result = Settings::from_toml_str("[durable]\nbackend = \"mongo\"\n");
        assert!(matches!(result, Err(StoreError::Config(_))));
    }

    #[test]
    fn env_overrides_apply() {
        let mut settings = Settings::default();
        settings
            .apply_env(vars(&[
                ("LESSONTRACK_DURABLE_BACKEND", "sqlite"),
                ("LESSONTRACK_DURABLE_PATH", "/tmp/durable.db"),
                ("LESSONTRACK_DURABLE_TIMEOUT_MS", "250"),
                ("HOME", "/root"),
            ]))
            .unwrap();
        assert_eq!(settings.durable.backend, DurableKind::Sqlite);
        assert_eq!(settings.durable.path, Some(PathBuf::from("/tmp/durable.db")));
        assert_eq!(settings.durable.timeout_ms, 250);
    }

    #[test]
    fn bad_env_timeout_is_config_error() {
        let mut settings = Settings::default();
        let result = settings.apply_env(vars(&[("LESSONTRACK_DURABLE_TIMEOUT_MS", "soon")]));
        assert!(matches!(result, Err(StoreError::Config(_))));
    }

    #[test]
    fn rest_without_url_fails_validation() {
        let mut settings = Settings::default();
        settings.durable.backend = DurableKind::Rest;
        assert!(settings.validate().is_err());

        settings.durable.url = Some("https://db.example.com".into());
        assert!(settings.validate().is_ok());

        settings.durable.timeout_ms = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lessontrack.toml");
        std::fs::write(&path, "[durable]\nbackend = \"sqlite\"\n").unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.durable.backend, DurableKind::Sqlite);
    }
}
