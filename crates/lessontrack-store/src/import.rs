//! One-way import of device-local data into the durable store.
//!
//! Runs once, typically right after sign-in. Replaying it is harmless:
//! progress is upserted on (user, lesson) and results on ids derived from
//! their content.
//! The local collections are left in place; [`Importer::clear_ephemeral`]
//! removes them as a separate step.

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::durable::DurableStore;
use crate::ephemeral::EphemeralStore;
use crate::error::StoreResult;
use crate::model::{ExerciseResult, ProgressRecord};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportOutcome {
    pub success: bool,
    pub error: Option<String>,
    /// Progress rows written.
    pub progress_rows: usize,
    /// Exercise results written.
    pub results_imported: usize,
    /// Set when the best-effort result import failed.
    pub results_error: Option<String>,
}

impl ImportOutcome {
    fn failed(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::default()
        }
    }
}

/// What an import would move.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingImport {
    pub progress: usize,
    pub exercise_results: usize,
}

impl PendingImport {
    pub fn is_empty(&self) -> bool {
        self.progress == 0 && self.exercise_results == 0
    }
}

#[derive(Clone)]
pub struct Importer {
    ephemeral: EphemeralStore,
    durable: DurableStore,
}

impl Importer {
    pub fn new(ephemeral: EphemeralStore, durable: DurableStore) -> Self {
        Self { ephemeral, durable }
    }

    /// Copy local progress, then local results, to `user_id`'s durable rows.
    ///
    /// Fails without writing anything when `user_id` is blank or there is
    /// no local progress. A failed result import does not fail the whole.
    #[instrument(skip(self))]
    pub async fn import_ephemeral_to_durable(&self, user_id: &str) -> ImportOutcome {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return ImportOutcome::failed("a signed-in identity is required to import");
        }

        let entries = match self.ephemeral.read_progress_entries().await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(%err, "local progress unreadable");
                return ImportOutcome::failed(format!("cannot read local progress: {err}"));
            }
        };
        if entries.is_empty() {
            return ImportOutcome::failed("no local progress to import");
        }

        // Missing fields already defaulted to false / 0 on read.
        let records: Vec<ProgressRecord> = entries
            .into_iter()
            .map(|(lesson_id, stored)| stored.into_record(lesson_id))
            .collect();

        let progress_rows = match self.durable.upsert_progress(user_id, &records).await {
            Ok(n) => n,
            Err(err) => {
                warn!(%err, "progress import failed");
                return ImportOutcome::failed(format!("progress import failed: {err}"));
            }
        };

        let (results_imported, results_error) = match self.import_results(user_id).await {
            Ok(n) => (n, None),
            Err(err) => {
                warn!(%err, "exercise result import failed, progress kept");
                (0, Some(err.to_string()))
            }
        };

        info!(progress_rows, results_imported, "local data imported");
        ImportOutcome {
            success: true,
            error: None,
            progress_rows,
            results_imported,
            results_error,
        }
    }

    async fn import_results(&self, user_id: &str) -> StoreResult<usize> {
        let results: Vec<ExerciseResult> = self
            .ephemeral
            .exercise_results(None)
            .await?
            .into_iter()
            .filter(|r| match r.validate() {
                Ok(()) => true,
                Err(err) => {
                    warn!(lesson_id = r.lesson_id, %err, "skipping invalid local result");
                    false
                }
            })
            .collect();
        if results.is_empty() {
            return Ok(0);
        }
        self.durable.upsert_exercise_results(user_id, &results).await
    }

    /// Counts of what [`import_ephemeral_to_durable`](Self::import_ephemeral_to_durable)
    /// would move.
    pub async fn pending_import(&self) -> StoreResult<PendingImport> {
        Ok(PendingImport {
            progress: self.ephemeral.read_progress_entries().await?.len(),
            exercise_results: self.ephemeral.exercise_results(None).await?.len(),
        })
    }

    /// Remove the local progress, result and activity collections.
    pub async fn clear_ephemeral(&self) -> StoreResult<()> {
        self.ephemeral.clear().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::db::Database;
    use crate::durable::{SharedDurable, SqliteBackend};
    use crate::ephemeral::KEY_PROGRESS;
    use crate::local::{LocalStorage, MemoryStorage};
    use crate::model::ProgressPatch;
    use crate::stats::AccessStats;

    async fn setup(
        handle: Option<SharedDurable>,
    ) -> (Importer, EphemeralStore, DurableStore, Arc<MemoryStorage>) {
        let handle = match handle {
            Some(h) => h,
            None => {
                let db = Database::in_memory_migrated().await.unwrap();
                SharedDurable::ready(Arc::new(SqliteBackend::new(db)))
            }
        };
        let storage = Arc::new(MemoryStorage::new());
        let ephemeral = EphemeralStore::new(storage.clone(), Arc::new(AccessStats::new()));
        let durable = DurableStore::new(handle, Duration::from_secs(5));
        (
            Importer::new(ephemeral.clone(), durable.clone()),
            ephemeral,
            durable,
            storage,
        )
    }

    #[tokio::test]
    async fn missing_fields_default_on_import() {
        let (importer, _, durable, storage) = setup(None).await;
        storage
            .set(KEY_PROGRESS, r#"{"12": {"completed": false, "totalScore": 40}}"#)
            .await
            .unwrap();

        let outcome = importer.import_ephemeral_to_durable("u1").await;
        assert!(outcome.success, "{outcome:?}");
        assert_eq!(outcome.progress_rows, 1);

        let row = durable.progress("u1", 12).await.unwrap().unwrap();
        assert_eq!(row.total_score, 40);
        assert!(!row.skills.vocabulary && !row.skills.writing);
        assert!(!row.completed());
    }

    #[tokio::test]
    async fn preconditions_are_reported() {
        let (importer, ephemeral, _, _) = setup(None).await;

        let outcome = importer.import_ephemeral_to_durable("u1").await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("no local progress"));

        ephemeral
            .save_progress(1, &ProgressPatch::new().with_score(5))
            .await
            .unwrap();
        let outcome = importer.import_ephemeral_to_durable(" ").await;
        assert!(!outcome.success);
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn results_come_along_and_local_data_stays() {
        let (importer, ephemeral, durable, _) = setup(None).await;
        ephemeral
            .save_progress(1, &ProgressPatch::new().with_score(5))
            .await
            .unwrap();
        ephemeral
            .append_exercise_result(ExerciseResult {
                lesson_id: 1,
                exercise_type: "speaking".into(),
                score: 50,
                total_questions: 2,
                correct_answers: 1,
                time_spent_seconds: 20,
                completed_at: Utc::now(),
            })
            .await
            .unwrap();

        assert_eq!(
            importer.pending_import().await.unwrap(),
            PendingImport {
                progress: 1,
                exercise_results: 1
            }
        );

        let outcome = importer.import_ephemeral_to_durable("u1").await;
        assert!(outcome.success);
        assert_eq!(outcome.results_imported, 1);
        assert_eq!(durable.exercise_results("u1", None).await.unwrap().len(), 1);
        assert_eq!(ephemeral.all_progress().await.unwrap().len(), 1);

        importer.clear_ephemeral().await.unwrap();
        assert!(importer.pending_import().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn durable_failure_fails_the_import() {
        let (importer, ephemeral, _, _) = setup(Some(SharedDurable::unconfigured())).await;
        ephemeral
            .save_progress(1, &ProgressPatch::new().with_score(5))
            .await
            .unwrap();

        let outcome = importer.import_ephemeral_to_durable("u1").await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("progress import failed"));
    }
}
