//! Consistency check and repair for the replicated display handle.
//!
//! The handle lives in up to three stored places plus the running session:
//!
//! * the ephemeral cache (`username` key),
//! * the durable profile row,
//! * the durable key/value mirror, which is optional.
//!
//! The session's value is authoritative. The mirror is reported but never
//! counts against consistency.

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::durable::DurableStore;
use crate::ephemeral::EphemeralStore;
use crate::error::StoreResult;
use crate::model::UserId;

/// The identity being checked: who, and which handle the session holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentIdentity {
    pub user_id: UserId,
    pub handle: Option<String>,
}

impl CurrentIdentity {
    pub fn new(user_id: impl Into<UserId>, handle: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            handle,
        }
    }
}

/// What one storage location holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LocationState {
    pub present: bool,
    pub value: Option<String>,
    /// Set when the location could not be read.
    pub error: Option<String>,
}

impl LocationState {
    fn from_read(result: StoreResult<Option<String>>) -> Self {
        match result {
            Ok(value) => Self {
                present: value.is_some(),
                value,
                error: None,
            },
            Err(err) => Self {
                present: false,
                value: None,
                error: Some(err.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    pub user_id: UserId,
    pub ephemeral_cache: LocationState,
    pub durable_profile: LocationState,
    pub durable_mirror: LocationState,
    pub in_memory: Option<String>,
    /// Cache, profile and session agree on a non-empty handle.
    pub synced: bool,
}

/// Outcome of a repair. Each location reports its own write error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairResult {
    /// Both required writes succeeded.
    pub success: bool,
    /// Why the repair did not run at all.
    pub error: Option<String>,
    pub ephemeral_error: Option<String>,
    pub profile_error: Option<String>,
    pub mirror_error: Option<String>,
}

/// Compares and repairs the handle replicas for one user.
#[derive(Clone)]
pub struct IdentityReconciler {
    ephemeral: EphemeralStore,
    durable: DurableStore,
}

impl IdentityReconciler {
    pub fn new(ephemeral: EphemeralStore, durable: DurableStore) -> Self {
        Self { ephemeral, durable }
    }

    #[instrument(skip(self, identity), fields(user_id = %identity.user_id))]
    pub async fn check(&self, identity: &CurrentIdentity) -> ConsistencyReport {
        let user_id = identity.user_id.as_str();
        let (cache, profile, mirror) = tokio::join!(
            self.ephemeral.handle(),
            self.durable.profile_handle(user_id),
            self.durable.mirror_handle(user_id),
        );

        let ephemeral_cache = LocationState::from_read(cache);
        let durable_profile = LocationState::from_read(profile);
        let durable_mirror = LocationState::from_read(mirror);
        let in_memory = identity.handle.clone();

        let synced = ephemeral_cache
            .value
            .as_deref()
            .is_some_and(|v| !v.is_empty())
            && ephemeral_cache.value == durable_profile.value
            && durable_profile.value == in_memory;

        if !synced {
            info!(
                cache = ?ephemeral_cache.value,
                profile = ?durable_profile.value,
                session = ?in_memory,
                "identity handle out of sync"
            );
        }

        ConsistencyReport {
            user_id: identity.user_id.clone(),
            ephemeral_cache,
            durable_profile,
            durable_mirror,
            in_memory,
            synced,
        }
    }

    /// Write the session's handle to every location. The cache and profile
    /// are required; the mirror is best-effort.
    #[instrument(skip(self, identity), fields(user_id = %identity.user_id))]
    pub async fn repair(&self, identity: &CurrentIdentity) -> RepairResult {
        let Some(handle) = identity.handle.as_deref().filter(|h| !h.is_empty()) else {
            warn!("no session handle to repair from");
            return RepairResult {
                error: Some("session holds no display handle".into()),
                ..RepairResult::default()
            };
        };
        let user_id = identity.user_id.as_str();

        let ephemeral_error = self.ephemeral.set_handle(handle).await.err();
        let profile_error = self.durable.set_profile_handle(user_id, handle).await.err();
        let mirror_error = self.durable.set_mirror_handle(user_id, handle).await.err();

        for (location, err) in [
            ("ephemeral cache", &ephemeral_error),
            ("durable profile", &profile_error),
            ("durable mirror", &mirror_error),
        ] {
            if let Some(err) = err {
                warn!(location, %err, "handle write failed");
            }
        }

        let success = ephemeral_error.is_none() && profile_error.is_none();
        if success {
            info!(handle, "identity handle repaired");
        }
        RepairResult {
            success,
            error: None,
            ephemeral_error: ephemeral_error.map(|e| e.to_string()),
            profile_error: profile_error.map(|e| e.to_string()),
            mirror_error: mirror_error.map(|e| e.to_string()),
        }
    }

    /// [`repair`](Self::repair), then a fresh [`check`](Self::check).
    pub async fn repair_and_verify(
        &self,
        identity: &CurrentIdentity,
    ) -> (RepairResult, ConsistencyReport) {
        let repaired = self.repair(identity).await;
        let report = self.check(identity).await;
        (repaired, report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::db::Database;
    use crate::durable::{SharedDurable, SqliteBackend};
    use crate::local::MemoryStorage;
    use crate::stats::AccessStats;

    async fn setup(
        handle: Option<SharedDurable>,
    ) -> (IdentityReconciler, EphemeralStore, DurableStore) {
        let handle = match handle {
            Some(h) => h,
            None => {
                let db = Database::in_memory_migrated().await.unwrap();
                SharedDurable::ready(Arc::new(SqliteBackend::new(db)))
            }
        };
        let ephemeral = EphemeralStore::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(AccessStats::new()),
        );
        let durable = DurableStore::new(handle, Duration::from_secs(5));
        (
            IdentityReconciler::new(ephemeral.clone(), durable.clone()),
            ephemeral,
            durable,
        )
    }

    #[tokio::test]
    async fn fresh_user_is_not_synced() {
        let (reconciler, _, _) = setup(None).await;
        let report = reconciler
            .check(&CurrentIdentity::new("u1", Some("ana".into())))
            .await;
        assert!(!report.synced);
        assert!(!report.ephemeral_cache.present);
        assert!(!report.durable_profile.present);
        assert_eq!(report.in_memory.as_deref(), Some("ana"));
    }

    #[tokio::test]
    async fn mirror_disagreement_does_not_matter() {
        let (reconciler, ephemeral, durable) = setup(None).await;
        ephemeral.set_handle("ana").await.unwrap();
        durable.set_profile_handle("u1", "ana").await.unwrap();
        durable.set_mirror_handle("u1", "someone-else").await.unwrap();

        let report = reconciler
            .check(&CurrentIdentity::new("u1", Some("ana".into())))
            .await;
        assert!(report.synced);
        assert_eq!(report.durable_mirror.value.as_deref(), Some("someone-else"));
    }

    #[tokio::test]
    async fn repair_twice_is_stable() {
        let (reconciler, _, durable) = setup(None).await;
        let identity = CurrentIdentity::new("u1", Some("ana".into()));

        let (first, report) = reconciler.repair_and_verify(&identity).await;
        assert!(first.success);
        assert!(report.synced);

        let (second, report) = reconciler.repair_and_verify(&identity).await;
        assert!(second.success);
        assert!(report.synced);
        assert_eq!(durable.mirror_handle("u1").await.unwrap().as_deref(), Some("ana"));
    }

    #[tokio::test]
    async fn repair_without_session_handle_fails() {
        let (reconciler, ephemeral, _) = setup(None).await;
        let result = reconciler.repair(&CurrentIdentity::new("u1", None)).await;
        assert!(!result.success);
        assert!(result.error.is_some());
        assert!(ephemeral.handle().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unreachable_durable_is_reported_per_location() {
        let (reconciler, ephemeral, _) = setup(Some(SharedDurable::unconfigured())).await;
        let identity = CurrentIdentity::new("u1", Some("ana".into()));

        let (repaired, report) = reconciler.repair_and_verify(&identity).await;
        assert!(!repaired.success);
        assert!(repaired.ephemeral_error.is_none());
        assert!(repaired.profile_error.is_some());
        assert_eq!(ephemeral.handle().await.unwrap().as_deref(), Some("ana"));

        assert!(!report.synced);
        assert!(report.durable_profile.error.is_some());
        assert!(report.durable_mirror.error.is_some());
    }
}
