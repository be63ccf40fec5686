//! The facade callers use for learner data.
//!
//! Every operation asks the [`SourceResolver`] which store to use (unless
//! the view is pinned) and dispatches to that adapter. Failures never
//! escape: they are logged, counted, and handed back inside an
//! [`AccessOutcome`] next to an empty or unchanged value.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tracing::{debug, info, instrument, warn};

use crate::config::Settings;
use crate::db::Database;
use crate::durable::{DurableStore, SharedDurable};
use crate::ephemeral::EphemeralStore;
use crate::error::StoreResult;
use crate::identity::IdentitySource;
use crate::import::Importer;
use crate::local::{KvStore, LocalStorage, MemoryStorage};
use crate::model::{
    DailyActivity, DataMode, ExerciseResult, LessonId, ProgressPatch, ProgressRecord, Source,
    UserId,
};
use crate::reconcile::{ConsistencyReport, CurrentIdentity, IdentityReconciler, RepairResult};
use crate::resolver::SourceResolver;
use crate::stats::AccessStats;

/// Message carried by durable writes attempted while nobody is signed in.
const NO_IDENTITY: &str = "no signed-in identity for the durable store";

/// A value plus the error that produced it, if any.
///
/// On failure `value` is the operation's empty result: `None`, an empty
/// collection, or `()`.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessOutcome<T> {
    pub value: T,
    pub error: Option<String>,
    /// Store the operation was routed to.
    pub source: Source,
}

impl<T> AccessOutcome<T> {
    fn ok(source: Source, value: T) -> Self {
        Self {
            value,
            error: None,
            source,
        }
    }

    fn failed(source: Source, value: T, error: impl Into<String>) -> Self {
        Self {
            value,
            error: Some(error.into()),
            source,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

/// Routes learner data to the ephemeral or durable store.
#[derive(Clone)]
pub struct HybridStore {
    ephemeral: EphemeralStore,
    durable: DurableStore,
    resolver: SourceResolver,
    identity: Arc<dyn IdentitySource>,
    stats: Arc<AccessStats>,
    pinned: Option<Source>,
}

impl HybridStore {
    pub fn new(
        local: Arc<dyn LocalStorage>,
        durable: SharedDurable,
        durable_timeout: Duration,
        identity: Arc<dyn IdentitySource>,
    ) -> Self {
        let stats = Arc::new(AccessStats::new());
        let ephemeral = EphemeralStore::new(local, Arc::clone(&stats));
        let durable = DurableStore::new(durable, durable_timeout);
        let resolver = SourceResolver::new(ephemeral.clone(), durable.clone(), Arc::clone(&stats));
        Self {
            ephemeral,
            durable,
            resolver,
            identity,
            stats,
            pinned: None,
        }
    }

    /// Build the local area and durable handle described by `settings`.
    /// The durable store is not contacted until first use.
    pub async fn open(
        settings: &Settings,
        identity: Arc<dyn IdentitySource>,
    ) -> StoreResult<Self> {
        settings.validate()?;
        let local: Arc<dyn LocalStorage> = match &settings.local.path {
            Some(path) => {
                let db = Database::open_and_migrate(path.clone()).await?;
                Arc::new(KvStore::new(db))
            }
            None => Arc::new(MemoryStorage::new()),
        };
        info!(
            local = ?settings.local.path,
            durable = ?settings.durable.backend,
            "hybrid store opened"
        );
        Ok(Self::new(
            local,
            SharedDurable::from_settings(settings.durable.clone()),
            settings.durable.timeout(),
            identity,
        ))
    }

    /// A view that always uses `source`, skipping resolution.
    pub fn pinned(&self, source: Source) -> Self {
        Self {
            pinned: Some(source),
            ..self.clone()
        }
    }

    pub fn stats(&self) -> &AccessStats {
        &self.stats
    }

    pub fn reconciler(&self) -> IdentityReconciler {
        IdentityReconciler::new(self.ephemeral.clone(), self.durable.clone())
    }

    pub fn importer(&self) -> Importer {
        Importer::new(self.ephemeral.clone(), self.durable.clone())
    }

    /// The store the next unpinned operation would use.
    pub async fn resolve(&self) -> Source {
        self.route().await.0
    }

    async fn route(&self) -> (Source, Option<UserId>) {
        let user_id = self.identity.user_id();
        let source = match self.pinned {
            Some(source) => source,
            None => self.resolver.resolve(user_id.as_deref()).await,
        };
        (source, user_id)
    }

    /// Run the closure for whichever store is picked and fold any error
    /// into the outcome. Durable reads without an identity yield `empty`;
    /// durable writes without one are reported.
    async fn dispatch<T, E, EF, D, DF>(
        &self,
        operation: &'static str,
        write: bool,
        empty: T,
        on_ephemeral: E,
        on_durable: D,
    ) -> AccessOutcome<T>
    where
        E: FnOnce(EphemeralStore) -> EF,
        EF: Future<Output = StoreResult<T>>,
        D: FnOnce(DurableStore, UserId) -> DF,
        DF: Future<Output = StoreResult<T>>,
    {
        let (source, user_id) = self.route().await;
        match (source, user_id) {
            (Source::Ephemeral, _) => match on_ephemeral(self.ephemeral.clone()).await {
                Ok(value) => AccessOutcome::ok(source, value),
                Err(err) => {
                    warn!(operation, %err, "ephemeral store operation failed");
                    AccessOutcome::failed(source, empty, err.to_string())
                }
            },
            (Source::Durable, None) if write => {
                debug!(operation, "durable write skipped without identity");
                AccessOutcome::failed(source, empty, NO_IDENTITY)
            }
            (Source::Durable, None) => AccessOutcome::ok(source, empty),
            (Source::Durable, Some(user_id)) => {
                match on_durable(self.durable.clone(), user_id.clone()).await {
                    Ok(value) => AccessOutcome::ok(source, value),
                    Err(err) => {
                        self.stats.record_durable_failure();
                        warn!(
                            operation,
                            user_id = %user_id,
                            transport = err.is_transport(),
                            %err,
                            "durable store operation failed"
                        );
                        AccessOutcome::failed(source, empty, err.to_string())
                    }
                }
            }
        }
    }

    // ── progress ─────────────────────────────────────────────────────

    #[instrument(skip(self))]
    pub async fn get_progress(
        &self,
        lesson_id: LessonId,
    ) -> AccessOutcome<Option<ProgressRecord>> {
        self.dispatch(
            "get_progress",
            false,
            None,
            |e| async move { e.progress(lesson_id).await },
            |d, user| async move { d.progress(&user, lesson_id).await },
        )
        .await
    }

    /// Merge `patch` into the lesson's record. Fields the patch leaves out
    /// keep their stored values.
    #[instrument(skip(self, patch))]
    pub async fn save_progress(
        &self,
        lesson_id: LessonId,
        patch: &ProgressPatch,
    ) -> AccessOutcome<Option<ProgressRecord>> {
        self.dispatch(
            "save_progress",
            true,
            None,
            |e| async move { e.save_progress(lesson_id, patch).await.map(Some) },
            |d, user| async move { d.save_progress(&user, lesson_id, patch).await.map(Some) },
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn get_all_progress(&self) -> AccessOutcome<BTreeMap<LessonId, ProgressRecord>> {
        self.dispatch(
            "get_all_progress",
            false,
            BTreeMap::new(),
            |e| async move { e.all_progress().await },
            |d, user| async move { d.all_progress(&user).await },
        )
        .await
    }

    // ── exercise results ─────────────────────────────────────────────

    /// Record one attempt. Results with more correct answers than
    /// questions are rejected before reaching either store; the outcome
    /// still names the store the attempt would have gone to.
    #[instrument(skip(self, result), fields(lesson_id = result.lesson_id))]
    pub async fn append_exercise_result(&self, result: ExerciseResult) -> AccessOutcome<()> {
        if let Err(err) = result.validate() {
            self.stats.record_rejected();
            warn!(%err, "exercise result rejected");
            return AccessOutcome::failed(self.resolve().await, (), err.to_string());
        }
        let for_durable = result.clone();
        self.dispatch(
            "append_exercise_result",
            true,
            (),
            |e| async move { e.append_exercise_result(result).await.map(|_| ()) },
            |d, user| async move { d.append_exercise_result(&user, &for_durable).await },
        )
        .await
    }

    /// Results newest first, optionally for one lesson.
    #[instrument(skip(self))]
    pub async fn get_exercise_results(
        &self,
        lesson_id: Option<LessonId>,
    ) -> AccessOutcome<Vec<ExerciseResult>> {
        self.dispatch(
            "get_exercise_results",
            false,
            Vec::new(),
            |e| async move { e.exercise_results(lesson_id).await },
            |d, user| async move { d.exercise_results(&user, lesson_id).await },
        )
        .await
    }

    // ── daily activity ───────────────────────────────────────────────

    /// Today's activity counter (UTC).
    pub async fn get_daily_activity(&self) -> AccessOutcome<Option<DailyActivity>> {
        self.get_daily_activity_on(Utc::now().date_naive()).await
    }

    #[instrument(skip(self))]
    pub async fn get_daily_activity_on(
        &self,
        date: NaiveDate,
    ) -> AccessOutcome<Option<DailyActivity>> {
        self.dispatch(
            "get_daily_activity",
            false,
            None,
            |e| async move { e.daily_activity(date).await },
            |d, user| async move { d.daily_activity(&user, date).await },
        )
        .await
    }

    /// Add one tick to today's counter (UTC).
    pub async fn update_daily_activity(&self) -> AccessOutcome<Option<DailyActivity>> {
        self.update_daily_activity_on(Utc::now().date_naive()).await
    }

    #[instrument(skip(self))]
    pub async fn update_daily_activity_on(
        &self,
        date: NaiveDate,
    ) -> AccessOutcome<Option<DailyActivity>> {
        self.dispatch(
            "update_daily_activity",
            true,
            None,
            |e| async move { e.record_activity(date).await.map(Some) },
            |d, user| async move { d.record_activity(&user, date).await.map(Some) },
        )
        .await
    }

    // ── preferences ──────────────────────────────────────────────────

    pub async fn data_mode(&self) -> StoreResult<DataMode> {
        self.ephemeral.data_mode().await
    }

    pub async fn set_data_mode(&self, mode: DataMode) -> StoreResult<()> {
        info!(%mode, "data mode changed");
        self.ephemeral.set_data_mode(mode).await
    }

    pub async fn demo_enabled(&self) -> StoreResult<bool> {
        self.ephemeral.demo_enabled().await
    }

    pub async fn set_demo_enabled(&self, enabled: bool) -> StoreResult<()> {
        self.ephemeral.set_demo_enabled(enabled).await
    }

    // ── identity and import, for the signed-in user ──────────────────

    fn current_identity(&self) -> Option<CurrentIdentity> {
        let user_id = self.identity.user_id()?;
        Some(CurrentIdentity::new(user_id, self.identity.handle()))
    }

    /// Check the handle replicas of the signed-in user. `None` when
    /// anonymous.
    pub async fn check_identity(&self) -> Option<ConsistencyReport> {
        let identity = self.current_identity()?;
        Some(self.reconciler().check(&identity).await)
    }

    /// Repair the handle replicas of the signed-in user, then check them.
    pub async fn repair_identity(&self) -> Option<(RepairResult, ConsistencyReport)> {
        let identity = self.current_identity()?;
        Some(self.reconciler().repair_and_verify(&identity).await)
    }
}
