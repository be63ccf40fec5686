//! # lessontrack-store
//!
//! Learner progress storage with two sources.
//!
//! Anonymous learners keep their progress in a device-local key/value area.
//! Signed-in learners keep it in a durable store scoped by user id. The
//! [`HybridStore`] facade decides per call which one to use and hides the
//! difference from callers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  HybridStore (AccessOutcome, AccessStats)            │
//! │    └─ SourceResolver (mode preference + probe)       │
//! ├───────────────────────────┬──────────────────────────┤
//! │  EphemeralStore           │  DurableStore (timeouts) │
//! │    └─ LocalStorage        │    └─ SharedDurable      │
//! │       KvStore | Memory    │       Sqlite | Rest      │
//! ├───────────────────────────┴──────────────────────────┤
//! │  IdentityReconciler   Importer (ephemeral → durable) │
//! ├──────────────────────────────────────────────────────┤
//! │  Database (rusqlite WAL) + versioned migrations      │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use lessontrack_store::{HybridStore, ProgressPatch, SessionIdentity, Settings, Skill};
//!
//! let settings = Settings::load("lessontrack.toml")?;
//! let identity = Arc::new(SessionIdentity::anonymous());
//! let store = HybridStore::open(&settings, identity.clone()).await?;
//!
//! store.save_progress(12, &ProgressPatch::new().with_skill(Skill::Reading, true)).await;
//!
//! identity.sign_in("user-1", Some("ana".into()));
//! let outcome = store.importer().import_ephemeral_to_durable("user-1").await;
//! ```

pub mod config;
pub mod db;
pub mod durable;
pub mod ephemeral;
pub mod error;
pub mod hybrid;
pub mod identity;
pub mod import;
pub mod local;
pub mod migration;
pub mod model;
pub mod reconcile;
pub mod resolver;
pub mod stats;

// ── re-exports ───────────────────────────────────────────────────────

pub use config::{DurableKind, DurableSettings, LocalSettings, Settings};
pub use db::Database;
pub use durable::{
    DURABLE_STREAK_PLACEHOLDER, DurableBackend, DurableStore, RestBackend, Row, Select,
    SharedDurable, SqliteBackend, Table,
};
pub use ephemeral::{EphemeralStore, MAX_LOCAL_RESULTS};
pub use error::{StoreError, StoreResult};
pub use hybrid::{AccessOutcome, HybridStore};
pub use identity::{IdentitySource, SessionIdentity};
pub use import::{ImportOutcome, Importer, PendingImport};
pub use local::{KvStore, LocalStorage, MemoryStorage};
pub use model::{
    DailyActivity, DataMode, ExerciseResult, LessonId, ProgressPatch, ProgressRecord, Skill,
    SkillFlags, Source, UserId,
};
pub use reconcile::{
    ConsistencyReport, CurrentIdentity, IdentityReconciler, LocationState, RepairResult,
};
pub use resolver::SourceResolver;
pub use stats::AccessStats;
