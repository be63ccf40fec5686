//! Typed adapter over the device-local key/value area.
//!
//! Each logical collection lives under one key as a JSON document:
//!
//! | key               | shape                                          |
//! |-------------------|------------------------------------------------|
//! | `progress`        | `{ "<lessonId>": { vocabularyCompleted, ... } }` |
//! | `exerciseResults` | `[ ExerciseResult, ... ]`                      |
//! | `dailyActivity`   | `{ "YYYY-MM-DD": { minutesSpent, streak } }`   |
//!
//! Unparseable documents or entries read as absent; they are logged and
//! counted, never returned as errors.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::error::StoreResult;
use crate::local::LocalStorage;
use crate::model::{
    ACTIVITY_TICK_MINUTES, DailyActivity, DataMode, ExerciseResult, LessonId, MAX_SCORE,
    ProgressPatch, ProgressRecord, SkillFlags, sort_newest_first,
};
use crate::stats::AccessStats;

pub const KEY_PROGRESS: &str = "progress";
pub const KEY_EXERCISE_RESULTS: &str = "exerciseResults";
pub const KEY_DAILY_ACTIVITY: &str = "dailyActivity";
pub const KEY_DATA_MODE: &str = "dataMode";
pub const KEY_DEMO_ENABLED: &str = "demoEnabled";
/// Cached copy of the learner's display handle.
pub const KEY_HANDLE: &str = "username";

/// Most exercise results kept locally; the oldest go first.
pub const MAX_LOCAL_RESULTS: usize = 1000;

// ═══════════════════════════════════════════════════════════════════════
//  Stored shapes
// ═══════════════════════════════════════════════════════════════════════

/// Progress as it sits in local storage. Every field is optional on read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct StoredProgress {
    pub vocabulary_completed: bool,
    pub listening_completed: bool,
    pub speaking_completed: bool,
    pub reading_completed: bool,
    pub writing_completed: bool,
    /// Written for other readers of the same area; ignored when read back.
    pub completed: bool,
    pub total_score: u32,
    pub last_accessed: Option<DateTime<Utc>>,
}

impl StoredProgress {
    pub(crate) fn into_record(self, lesson_id: LessonId) -> ProgressRecord {
        ProgressRecord {
            lesson_id,
            skills: SkillFlags {
                vocabulary: self.vocabulary_completed,
                listening: self.listening_completed,
                speaking: self.speaking_completed,
                reading: self.reading_completed,
                writing: self.writing_completed,
            },
            total_score: self.total_score.min(u32::from(MAX_SCORE)) as u8,
            last_accessed: self.last_accessed,
        }
    }

    fn from_record(record: &ProgressRecord) -> Self {
        Self {
            vocabulary_completed: record.skills.vocabulary,
            listening_completed: record.skills.listening,
            speaking_completed: record.skills.speaking,
            reading_completed: record.skills.reading,
            writing_completed: record.skills.writing,
            completed: record.completed(),
            total_score: u32::from(record.total_score),
            last_accessed: record.last_accessed,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StoredActivity {
    minutes_spent: u32,
    streak: u32,
}

// ═══════════════════════════════════════════════════════════════════════
//  EphemeralStore
// ═══════════════════════════════════════════════════════════════════════

/// Progress, results and activity for whoever is using this device.
#[derive(Clone)]
pub struct EphemeralStore {
    storage: Arc<dyn LocalStorage>,
    stats: Arc<AccessStats>,
}

impl EphemeralStore {
    pub fn new(storage: Arc<dyn LocalStorage>, stats: Arc<AccessStats>) -> Self {
        Self { storage, stats }
    }

    // ── progress ─────────────────────────────────────────────────────

    /// Every locally stored progress record, keyed by lesson.
    #[instrument(skip(self))]
    pub async fn all_progress(&self) -> StoreResult<BTreeMap<LessonId, ProgressRecord>> {
        Ok(self
            .read_progress_entries()
            .await?
            .into_iter()
            .map(|(id, stored)| (id, stored.into_record(id)))
            .collect())
    }

    /// Raw stored entries, for the importer's field defaulting.
    pub(crate) async fn read_progress_entries(
        &self,
    ) -> StoreResult<BTreeMap<LessonId, StoredProgress>> {
        let Some(entries) = self.read_json::<BTreeMap<String, Value>>(KEY_PROGRESS).await? else {
            return Ok(BTreeMap::new());
        };

        let mut out = BTreeMap::new();
        for (key, value) in entries {
            let Ok(lesson_id) = key.parse::<LessonId>() else {
                self.discard(KEY_PROGRESS, &format!("non-numeric lesson key {key:?}"));
                continue;
            };
            match serde_json::from_value::<StoredProgress>(value) {
                Ok(stored) => {
                    out.insert(lesson_id, stored);
                }
                Err(err) => self.discard(KEY_PROGRESS, &err.to_string()),
            }
        }
        Ok(out)
    }

    /// The progress record for one lesson, if any.
    #[instrument(skip(self))]
    pub async fn progress(&self, lesson_id: LessonId) -> StoreResult<Option<ProgressRecord>> {
        Ok(self.all_progress().await?.remove(&lesson_id))
    }

    /// Merge `patch` into the lesson's record, creating it if needed.
    ///
    /// Only this lesson's entry is rewritten. Sibling entries go back
    /// byte-for-byte, unreadable ones included.
    #[instrument(skip(self, patch))]
    pub async fn save_progress(
        &self,
        lesson_id: LessonId,
        patch: &ProgressPatch,
    ) -> StoreResult<ProgressRecord> {
        let mut raw = self
            .read_json::<BTreeMap<String, Value>>(KEY_PROGRESS)
            .await?
            .unwrap_or_default();
        let key = lesson_id.to_string();

        let mut record = raw
            .get(&key)
            .and_then(|v| serde_json::from_value::<StoredProgress>(v.clone()).ok())
            .map_or_else(
                || ProgressRecord::new(lesson_id),
                |stored| stored.into_record(lesson_id),
            );
        record.apply(patch);

        raw.insert(key, serde_json::to_value(StoredProgress::from_record(&record))?);
        self.write_json(KEY_PROGRESS, &raw).await?;

        debug!(lesson_id, "local progress saved");
        Ok(record)
    }

    // ── exercise results ─────────────────────────────────────────────

    /// All local results, newest first, optionally for one lesson.
    #[instrument(skip(self))]
    pub async fn exercise_results(
        &self,
        lesson_id: Option<LessonId>,
    ) -> StoreResult<Vec<ExerciseResult>> {
        let mut results: Vec<ExerciseResult> = self
            .read_result_log()
            .await?
            .into_iter()
            .filter(|r| lesson_id.is_none_or(|id| r.lesson_id == id))
            .collect();
        sort_newest_first(&mut results);
        Ok(results)
    }

    /// Append one result, evicting the oldest entries beyond
    /// [`MAX_LOCAL_RESULTS`]. Returns the number evicted.
    #[instrument(skip(self, result), fields(lesson_id = result.lesson_id))]
    pub async fn append_exercise_result(&self, result: ExerciseResult) -> StoreResult<usize> {
        let mut log = self.read_result_log().await?;
        log.push(result);

        let evicted = log.len().saturating_sub(MAX_LOCAL_RESULTS);
        if evicted > 0 {
            // Stable: equal timestamps keep arrival order, so the earliest
            // arrival among them goes first.
            log.sort_by_key(|r| r.completed_at);
            log.drain(..evicted);
            self.stats.record_evicted(evicted as u64);
            debug!(evicted, "local result log trimmed");
        }

        self.write_json(KEY_EXERCISE_RESULTS, &log).await?;
        Ok(evicted)
    }

    async fn read_result_log(&self) -> StoreResult<Vec<ExerciseResult>> {
        let Some(entries) = self.read_json::<Vec<Value>>(KEY_EXERCISE_RESULTS).await? else {
            return Ok(Vec::new());
        };

        let mut log = Vec::with_capacity(entries.len());
        for value in entries {
            match serde_json::from_value::<ExerciseResult>(value) {
                Ok(result) => log.push(result),
                Err(err) => self.discard(KEY_EXERCISE_RESULTS, &err.to_string()),
            }
        }
        Ok(log)
    }

    // ── daily activity ───────────────────────────────────────────────

    /// The activity counter for `date`, if one exists.
    #[instrument(skip(self))]
    pub async fn daily_activity(&self, date: NaiveDate) -> StoreResult<Option<DailyActivity>> {
        let days = self.read_activity().await?;
        Ok(days.get(&date).map(|a| DailyActivity {
            date,
            minutes_spent: a.minutes_spent,
            streak: a.streak,
        }))
    }

    /// Add one tick to `date`'s counter. The streak is carried over from
    /// the existing record, or starts at 1.
    #[instrument(skip(self))]
    pub async fn record_activity(&self, date: NaiveDate) -> StoreResult<DailyActivity> {
        let mut days = self.read_activity().await?;
        let entry = days.entry(date).or_default();
        entry.minutes_spent = entry.minutes_spent.saturating_add(ACTIVITY_TICK_MINUTES);
        if entry.streak == 0 {
            entry.streak = 1;
        }
        let updated = DailyActivity {
            date,
            minutes_spent: entry.minutes_spent,
            streak: entry.streak,
        };

        let stored: BTreeMap<String, StoredActivity> = days
            .into_iter()
            .map(|(d, a)| (d.format("%Y-%m-%d").to_string(), a))
            .collect();
        self.write_json(KEY_DAILY_ACTIVITY, &stored).await?;
        Ok(updated)
    }

    async fn read_activity(&self) -> StoreResult<BTreeMap<NaiveDate, StoredActivity>> {
        let Some(entries) = self.read_json::<BTreeMap<String, Value>>(KEY_DAILY_ACTIVITY).await?
        else {
            return Ok(BTreeMap::new());
        };

        let mut days = BTreeMap::new();
        for (key, value) in entries {
            let Ok(date) = NaiveDate::parse_from_str(&key, "%Y-%m-%d") else {
                self.discard(KEY_DAILY_ACTIVITY, &format!("bad date key {key:?}"));
                continue;
            };
            match serde_json::from_value::<StoredActivity>(value) {
                Ok(activity) => {
                    days.insert(date, activity);
                }
                Err(err) => self.discard(KEY_DAILY_ACTIVITY, &err.to_string()),
            }
        }
        Ok(days)
    }

    // ── preferences and cached identity ──────────────────────────────

    /// The persisted mode preference; unknown or missing values are
    /// [`DataMode::Automatic`].
    pub async fn data_mode(&self) -> StoreResult<DataMode> {
        let Some(raw) = self.storage.get(KEY_DATA_MODE).await? else {
            return Ok(DataMode::default());
        };
        match DataMode::parse(raw.trim_matches('"')) {
            Some(mode) => Ok(mode),
            None => {
                self.discard(KEY_DATA_MODE, &format!("unknown mode {raw:?}"));
                Ok(DataMode::default())
            }
        }
    }

    pub async fn set_data_mode(&self, mode: DataMode) -> StoreResult<()> {
        self.storage.set(KEY_DATA_MODE, mode.as_str()).await
    }

    pub async fn demo_enabled(&self) -> StoreResult<bool> {
        Ok(self.read_json::<bool>(KEY_DEMO_ENABLED).await?.unwrap_or(false))
    }

    pub async fn set_demo_enabled(&self, enabled: bool) -> StoreResult<()> {
        self.write_json(KEY_DEMO_ENABLED, &enabled).await
    }

    /// The cached display handle. Stored as plain text.
    pub async fn handle(&self) -> StoreResult<Option<String>> {
        self.storage.get(KEY_HANDLE).await
    }

    pub async fn set_handle(&self, handle: &str) -> StoreResult<()> {
        self.storage.set(KEY_HANDLE, handle).await
    }

    /// Drop the three learner collections. Preferences and the cached
    /// handle are kept.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> StoreResult<()> {
        for key in [KEY_PROGRESS, KEY_EXERCISE_RESULTS, KEY_DAILY_ACTIVITY] {
            self.storage.remove(key).await?;
        }
        debug!("local learner data cleared");
        Ok(())
    }

    // ── helpers ──────────────────────────────────────────────────────

    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        let Some(raw) = self.storage.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<T>(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                self.discard(key, &err.to_string());
                Ok(None)
            }
        }
    }

    async fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StoreResult<()> {
        let raw = serde_json::to_string(value)?;
        self.storage.set(key, &raw).await
    }

    fn discard(&self, key: &str, reason: &str) {
        self.stats.record_discarded();
        warn!(key, reason, "malformed local data treated as absent");
    }
}

// ── tests ────────────────────────────────────────────────────────────
