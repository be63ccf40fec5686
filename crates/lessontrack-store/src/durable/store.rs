//! Typed adapter over a [`DurableBackend`].
//!
//! Everything here is scoped by user id and bounded by a time budget.
//! Errors are returned as-is; deciding what a failure means is the
//! caller's job.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{DurableBackend, Filter, Row, Select, SharedDurable, Table};
use crate::error::{StoreError, StoreResult};
use crate::model::{
    ACTIVITY_TICK_MINUTES, DailyActivity, ExerciseResult, LessonId, MAX_SCORE, ProgressPatch,
    ProgressRecord, Skill, SkillFlags, sort_newest_first,
};

/// Streak value written and returned on the durable path. Streak rules for
/// signed-in learners are not defined yet, so nothing is computed.
pub const DURABLE_STREAK_PLACEHOLDER: u32 = 0;

/// Namespace for ids of imported exercise results.
const RESULT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6c65_7373_6f6e_4000_8000_7265_7375_6c74);

/// Key of the display handle in the per-user key/value mirror.
const MIRROR_HANDLE_KEY: &str = "username";

/// Typed access to the durable collections.
#[derive(Clone)]
pub struct DurableStore {
    handle: SharedDurable,
    timeout: Duration,
}

impl DurableStore {
    pub fn new(handle: SharedDurable, timeout: Duration) -> Self {
        Self { handle, timeout }
    }

    pub fn handle(&self) -> &SharedDurable {
        &self.handle
    }

    /// Run `f` against the backend within the time budget. Connecting
    /// counts against the same budget.
    async fn call<T, F, Fut>(&self, operation: &'static str, f: F) -> StoreResult<T>
    where
        F: FnOnce(Arc<dyn DurableBackend>) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let work = async {
            let backend = self.handle.get().await?;
            f(backend).await
        };
        match tokio::time::timeout(self.timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                operation,
                millis: self.timeout.as_millis() as u64,
            }),
        }
    }

    // ── progress ─────────────────────────────────────────────────────

    /// Whether `user_id` has at least one progress row. Fetches one key
    /// column of one row, nothing more.
    #[instrument(skip(self))]
    pub async fn has_progress(&self, user_id: &str) -> StoreResult<bool> {
        let q = Select::from(Table::Progress)
            .columns(&["lesson_id"])
            .eq("user_id", user_id)
            .limit(1);
        let rows = self
            .call("has_progress", move |b| async move { b.select(&q).await })
            .await?;
        Ok(!rows.is_empty())
    }

    #[instrument(skip(self))]
    pub async fn count_progress(&self, user_id: &str) -> StoreResult<u64> {
        let filters = vec![Filter {
            column: "user_id",
            value: Value::from(user_id),
        }];
        self.call("count_progress", move |b| async move {
            b.count(Table::Progress, &filters).await
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn progress(
        &self,
        user_id: &str,
        lesson_id: LessonId,
    ) -> StoreResult<Option<ProgressRecord>> {
        let q = Select::from(Table::Progress)
            .eq("user_id", user_id)
            .eq("lesson_id", lesson_id);
        let row = self
            .call("progress", move |b| async move { b.maybe_single(&q).await })
            .await?;
        row.map(|r| decode_progress(&r)).transpose()
    }

    #[instrument(skip(self))]
    pub async fn all_progress(
        &self,
        user_id: &str,
    ) -> StoreResult<BTreeMap<LessonId, ProgressRecord>> {
        let q = Select::from(Table::Progress).eq("user_id", user_id);
        let rows = self
            .call("all_progress", move |b| async move { b.select(&q).await })
            .await?;

        let mut out = BTreeMap::new();
        for row in rows {
            match decode_progress(&row) {
                Ok(record) => {
                    out.insert(record.lesson_id, record);
                }
                Err(err) => warn!(%err, "skipping undecodable progress row"),
            }
        }
        Ok(out)
    }

    /// Upsert only the fields present in `patch`, then read the merged row
    /// back.
    #[instrument(skip(self, patch))]
    pub async fn save_progress(
        &self,
        user_id: &str,
        lesson_id: LessonId,
        patch: &ProgressPatch,
    ) -> StoreResult<ProgressRecord> {
        let row = patch_row(user_id, lesson_id, patch);
        self.call("save_progress", move |b| async move {
            b.upsert(Table::Progress, vec![row]).await
        })
        .await?;
        debug!(user_id, lesson_id, "durable progress saved");

        let merged = self.progress(user_id, lesson_id).await?;
        Ok(merged.unwrap_or_else(|| {
            let mut fresh = ProgressRecord::new(lesson_id);
            fresh.apply(patch);
            fresh
        }))
    }

    /// Write complete records in one batch keyed by (user, lesson).
    #[instrument(skip(self, records), fields(records = records.len()))]
    pub async fn upsert_progress(
        &self,
        user_id: &str,
        records: &[ProgressRecord],
    ) -> StoreResult<usize> {
        let rows: Vec<Row> = records.iter().map(|r| progress_row(user_id, r)).collect();
        let n = rows.len();
        self.call("upsert_progress", move |b| async move {
            b.upsert(Table::Progress, rows).await
        })
        .await?;
        Ok(n)
    }

    // ── exercise results ─────────────────────────────────────────────

    #[instrument(skip(self))]
    pub async fn exercise_results(
        &self,
        user_id: &str,
        lesson_id: Option<LessonId>,
    ) -> StoreResult<Vec<ExerciseResult>> {
        let mut q = Select::from(Table::ExerciseResults).eq("user_id", user_id);
        if let Some(id) = lesson_id {
            q = q.eq("lesson_id", id);
        }
        let q = q.order_desc("completed_at");
        let rows = self
            .call("exercise_results", move |b| async move { b.select(&q).await })
            .await?;

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            match decode_result(&row) {
                Ok(result) => results.push(result),
                Err(err) => warn!(%err, "skipping undecodable exercise result row"),
            }
        }
        sort_newest_first(&mut results);
        Ok(results)
    }

    /// Add one result as a new row.
    #[instrument(skip(self, result), fields(lesson_id = result.lesson_id))]
    pub async fn append_exercise_result(
        &self,
        user_id: &str,
        result: &ExerciseResult,
    ) -> StoreResult<()> {
        let row = result_row(&Uuid::now_v7().to_string(), user_id, result);
        self.call("append_exercise_result", move |b| async move {
            b.insert(Table::ExerciseResults, vec![row]).await
        })
        .await
    }

    /// Upsert results under ids derived from their content, so replaying
    /// the same batch adds nothing. Identical attempts in one batch stay
    /// separate rows.
    #[instrument(skip(self, results), fields(results = results.len()))]
    pub async fn upsert_exercise_results(
        &self,
        user_id: &str,
        results: &[ExerciseResult],
    ) -> StoreResult<usize> {
        let mut seen: HashMap<Uuid, u32> = HashMap::new();
        let rows: Vec<Row> = results
            .iter()
            .map(|r| {
                let base = imported_result_id(user_id, r, 0);
                let occurrence = seen.entry(base).or_insert(0);
                let id = imported_result_id(user_id, r, *occurrence);
                *occurrence += 1;
                result_row(&id.to_string(), user_id, r)
            })
            .collect();
        let n = rows.len();
        self.call("upsert_exercise_results", move |b| async move {
            b.upsert(Table::ExerciseResults, rows).await
        })
        .await?;
        Ok(n)
    }

    // ── daily activity ───────────────────────────────────────────────

    #[instrument(skip(self))]
    pub async fn daily_activity(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> StoreResult<Option<DailyActivity>> {
        let q = Select::from(Table::DailyActivity)
            .eq("user_id", user_id)
            .eq("activity_date", date_key(date));
        let row = self
            .call("daily_activity", move |b| async move { b.maybe_single(&q).await })
            .await?;
        Ok(row.map(|r| DailyActivity {
            date,
            minutes_spent: row_u32(&r, "minutes_spent"),
            streak: row_u32(&r, "streak"),
        }))
    }

    /// Add one tick to the day's counter. The streak is written as
    /// [`DURABLE_STREAK_PLACEHOLDER`].
    #[instrument(skip(self))]
    pub async fn record_activity(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> StoreResult<DailyActivity> {
        let previous = self.daily_activity(user_id, date).await?;
        let minutes_spent = previous
            .map_or(0, |a| a.minutes_spent)
            .saturating_add(ACTIVITY_TICK_MINUTES);

        let row = to_row(json!({
            "user_id": user_id,
            "activity_date": date_key(date),
            "minutes_spent": minutes_spent,
            "streak": DURABLE_STREAK_PLACEHOLDER,
        }));
        self.call("record_activity", move |b| async move {
            b.upsert(Table::DailyActivity, vec![row]).await
        })
        .await?;

        Ok(DailyActivity {
            date,
            minutes_spent,
            streak: DURABLE_STREAK_PLACEHOLDER,
        })
    }

    // ── identity handle ──────────────────────────────────────────────

    /// The handle on the user's profile row. `None` when there is no row
    /// or the column is null.
    #[instrument(skip(self))]
    pub async fn profile_handle(&self, user_id: &str) -> StoreResult<Option<String>> {
        let q = Select::from(Table::Profiles)
            .columns(&["username"])
            .eq("id", user_id);
        let row = self
            .call("profile_handle", move |b| async move { b.maybe_single(&q).await })
            .await?;
        Ok(row.and_then(|r| row_str(&r, "username").map(str::to_string)))
    }

    #[instrument(skip(self))]
    pub async fn set_profile_handle(&self, user_id: &str, handle: &str) -> StoreResult<()> {
        let row = to_row(json!({
            "id": user_id,
            "username": handle,
            "updated_at": timestamp(Utc::now()),
        }));
        self.call("set_profile_handle", move |b| async move {
            b.upsert(Table::Profiles, vec![row]).await
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn mirror_handle(&self, user_id: &str) -> StoreResult<Option<String>> {
        let q = Select::from(Table::KvMirror)
            .columns(&["value"])
            .eq("user_id", user_id)
            .eq("key", MIRROR_HANDLE_KEY);
        let row = self
            .call("mirror_handle", move |b| async move { b.maybe_single(&q).await })
            .await?;
        Ok(row.and_then(|r| row_str(&r, "value").map(str::to_string)))
    }

    #[instrument(skip(self))]
    pub async fn set_mirror_handle(&self, user_id: &str, handle: &str) -> StoreResult<()> {
        let row = to_row(json!({
            "user_id": user_id,
            "key": MIRROR_HANDLE_KEY,
            "value": handle,
            "updated_at": timestamp(Utc::now()),
        }));
        self.call("set_mirror_handle", move |b| async move {
            b.upsert(Table::KvMirror, vec![row]).await
        })
        .await
    }
}

// ── row encoding ─────────────────────────────────────────────────────

/// Fixed-width UTC timestamps, so text ordering matches time ordering.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn to_row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

fn patch_row(user_id: &str, lesson_id: LessonId, patch: &ProgressPatch) -> Row {
    let mut row = to_row(json!({ "user_id": user_id, "lesson_id": lesson_id }));
    for skill in Skill::ALL {
        if let Some(done) = patch.skill(skill) {
            row.insert(skill.column().to_string(), Value::Bool(done));
        }
    }
    if let Some(score) = patch.total_score {
        row.insert("percentage".into(), Value::from(score.min(MAX_SCORE)));
    }
    if let Some(at) = patch.last_accessed {
        row.insert("last_accessed".into(), Value::from(timestamp(at)));
    }
    row
}

fn progress_row(user_id: &str, record: &ProgressRecord) -> Row {
    let mut row = to_row(json!({
        "user_id": user_id,
        "lesson_id": record.lesson_id,
        "percentage": record.total_score.min(MAX_SCORE),
        "last_accessed": record.last_accessed.map(timestamp),
    }));
    for skill in Skill::ALL {
        row.insert(
            skill.column().to_string(),
            Value::Bool(record.skills.get(skill)),
        );
    }
    row
}

/// Stable id for an imported result: the same attempt, user and
/// occurrence always map to the same row.
fn imported_result_id(user_id: &str, result: &ExerciseResult, occurrence: u32) -> Uuid {
    let name = format!(
        "{user_id}\n{}\n{}\n{}\n{occurrence}",
        result.lesson_id,
        result.exercise_type,
        timestamp(result.completed_at),
    );
    Uuid::new_v5(&RESULT_ID_NAMESPACE, name.as_bytes())
}

fn result_row(id: &str, user_id: &str, result: &ExerciseResult) -> Row {
    to_row(json!({
        "id": id,
        "user_id": user_id,
        "lesson_id": result.lesson_id,
        "exercise_type": result.exercise_type,
        "score": result.score,
        "total_questions": result.total_questions,
        "correct_answers": result.correct_answers,
        "time_spent_seconds": result.time_spent_seconds,
        "completed_at": timestamp(result.completed_at),
    }))
}

// ── row decoding ─────────────────────────────────────────────────────
//
// Backends disagree on representation (SQLite has no booleans, REST may
// quote numbers), so decoding is lenient about shape.

fn row_bool(row: &Row, col: &str) -> bool {
    match row.get(col) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().is_some_and(|v| v != 0),
        Some(Value::String(s)) => matches!(s.as_str(), "true" | "t" | "1"),
        _ => false,
    }
}

fn row_i64(row: &Row, col: &str) -> Option<i64> {
    match row.get(col)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn row_u32(row: &Row, col: &str) -> u32 {
    row_i64(row, col).map_or(0, |v| v.clamp(0, i64::from(u32::MAX)) as u32)
}

fn row_str<'a>(row: &'a Row, col: &str) -> Option<&'a str> {
    row.get(col)?.as_str()
}

fn row_time(row: &Row, col: &str) -> Option<DateTime<Utc>> {
    let raw = row_str(row, col)?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn missing(col: &str) -> StoreError {
    StoreError::InvalidArgument(format!("row is missing {col}"))
}

fn decode_progress(row: &Row) -> StoreResult<ProgressRecord> {
    let lesson_id = row_i64(row, "lesson_id").ok_or_else(|| missing("lesson_id"))?;
    let mut skills = SkillFlags::default();
    for skill in Skill::ALL {
        skills.set(skill, row_bool(row, skill.column()));
    }
    Ok(ProgressRecord {
        lesson_id,
        skills,
        total_score: row_i64(row, "percentage")
            .map_or(0, |p| p.clamp(0, i64::from(MAX_SCORE)) as u8),
        last_accessed: row_time(row, "last_accessed"),
    })
}

fn decode_result(row: &Row) -> StoreResult<ExerciseResult> {
    Ok(ExerciseResult {
        lesson_id: row_i64(row, "lesson_id").ok_or_else(|| missing("lesson_id"))?,
        exercise_type: row_str(row, "exercise_type")
            .ok_or_else(|| missing("exercise_type"))?
            .to_string(),
        score: row_u32(row, "score"),
        total_questions: row_u32(row, "total_questions"),
        correct_answers: row_u32(row, "correct_answers"),
        time_spent_seconds: row_u32(row, "time_spent_seconds"),
        completed_at: row_time(row, "completed_at").ok_or_else(|| missing("completed_at"))?,
    })
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::TimeZone;

    use super::*;
    use crate::db::Database;
    use crate::durable::SqliteBackend;

    async fn store() -> DurableStore {
        let backend = SqliteBackend::new(Database::in_memory_migrated().await.unwrap());
        DurableStore::new(
            SharedDurable::ready(Arc::new(backend)),
            Duration::from_secs(5),
        )
    }

    fn result_at(lesson_id: LessonId, secs: i64) -> ExerciseResult {
        ExerciseResult {
            lesson_id,
            exercise_type: "reading".into(),
            score: 70,
            total_questions: 10,
            correct_answers: 7,
            time_spent_seconds: 90,
            completed_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    /// Never answers.
    struct StalledBackend;

    #[async_trait]
    impl DurableBackend for StalledBackend {
        fn name(&self) -> &'static str {
            "stalled"
        }
        async fn select(&self, _: &Select) -> StoreResult<Vec<Row>> {
            std::future::pending().await
        }
        async fn count(&self, _: Table, _: &[Filter]) -> StoreResult<u64> {
            std::future::pending().await
        }
        async fn insert(&self, _: Table, _: Vec<Row>) -> StoreResult<()> {
            std::future::pending().await
        }
        async fn upsert(&self, _: Table, _: Vec<Row>) -> StoreResult<()> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn save_progress_merges_with_existing_row() {
        let store = store().await;
        store
            .save_progress(
                "u1",
                5,
                &ProgressPatch::new()
                    .with_skill(Skill::Listening, true)
                    .with_score(30),
            )
            .await
            .unwrap();
        let merged = store
            .save_progress("u1", 5, &ProgressPatch::new().with_skill(Skill::Writing, true))
            .await
            .unwrap();

        assert!(merged.skills.listening);
        assert!(merged.skills.writing);
        assert!(!merged.skills.reading);
        assert_eq!(merged.total_score, 30);
        assert_eq!(store.count_progress("u1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn progress_is_scoped_by_user() {
        let store = store().await;
        store
            .save_progress("u1", 1, &ProgressPatch::new().with_score(10))
            .await
            .unwrap();

        assert!(store.has_progress("u1").await.unwrap());
        assert!(!store.has_progress("u2").await.unwrap());
        assert!(store.all_progress("u2").await.unwrap().is_empty());
        assert!(store.progress("u2", 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn results_come_back_newest_first() {
        let store = store().await;
        store.append_exercise_result("u1", &result_at(1, 5)).await.unwrap();
        store.append_exercise_result("u1", &result_at(2, 50)).await.unwrap();
        store.append_exercise_result("u1", &result_at(1, 20)).await.unwrap();

        let all = store.exercise_results("u1", None).await.unwrap();
        let offsets: Vec<i64> = all
            .iter()
            .map(|r| r.completed_at.timestamp() - 1_700_000_000)
            .collect();
        assert_eq!(offsets, vec![50, 20, 5]);

        let lesson_one = store.exercise_results("u1", Some(1)).await.unwrap();
        assert_eq!(lesson_one.len(), 2);
        assert_eq!(lesson_one[0].completed_at.timestamp() - 1_700_000_000, 20);
    }

    #[tokio::test]
    async fn identical_attempts_are_both_kept() {
        let store = store().await;
        let attempt = result_at(3, 10);
        store.append_exercise_result("u1", &attempt).await.unwrap();
        store.append_exercise_result("u1", &attempt).await.unwrap();

        let results = store.exercise_results("u1", Some(3)).await.unwrap();
        assert_eq!(results, vec![attempt.clone(), attempt]);
    }

    #[tokio::test]
    async fn result_upsert_is_idempotent() {
        let store = store().await;
        let batch = vec![result_at(1, 1), result_at(1, 2), result_at(1, 2)];
        store.upsert_exercise_results("u1", &batch).await.unwrap();
        store.upsert_exercise_results("u1", &batch).await.unwrap();
        assert_eq!(store.exercise_results("u1", None).await.unwrap().len(), 3);

        // Same content for another learner is a different row.
        store.upsert_exercise_results("u2", &batch).await.unwrap();
        assert_eq!(store.exercise_results("u2", None).await.unwrap().len(), 3);
    }

    #[test]
    fn imported_ids_are_stable_per_occurrence() {
        let r = result_at(1, 1);
        assert_eq!(imported_result_id("u1", &r, 0), imported_result_id("u1", &r, 0));
        assert_ne!(imported_result_id("u1", &r, 0), imported_result_id("u1", &r, 1));
        assert_ne!(imported_result_id("u1", &r, 0), imported_result_id("u2", &r, 0));
    }

    #[tokio::test]
    async fn activity_ticks_with_placeholder_streak() {
        let store = store().await;
        let day = NaiveDate::from_ymd_opt(2026, 5, 1).unwrap();

        store.record_activity("u1", day).await.unwrap();
        let second = store.record_activity("u1", day).await.unwrap();
        assert_eq!(second.minutes_spent, 2);
        assert_eq!(second.streak, DURABLE_STREAK_PLACEHOLDER);

        let read = store.daily_activity("u1", day).await.unwrap().unwrap();
        assert_eq!(read.minutes_spent, 2);
    }

    #[tokio::test]
    async fn handles_roundtrip() {
        let store = store().await;
        assert!(store.profile_handle("u1").await.unwrap().is_none());
        assert!(store.mirror_handle("u1").await.unwrap().is_none());

        store.set_profile_handle("u1", "ana").await.unwrap();
        store.set_mirror_handle("u1", "ana").await.unwrap();
        store.set_profile_handle("u1", "ana2").await.unwrap();

        assert_eq!(store.profile_handle("u1").await.unwrap().as_deref(), Some("ana2"));
        assert_eq!(store.mirror_handle("u1").await.unwrap().as_deref(), Some("ana"));
    }

    #[tokio::test]
    async fn stalled_backend_times_out() {
        let store = DurableStore::new(
            SharedDurable::ready(Arc::new(StalledBackend)),
            Duration::from_millis(30),
        );
        let result = store.has_progress("u1").await;
        assert!(matches!(
            result,
            Err(StoreError::Timeout {
                operation: "has_progress",
                ..
            })
        ));
    }

    #[test]
    fn decoding_tolerates_backend_shapes() {
        let row = to_row(json!({
            "lesson_id": "12",
            "percentage": 40.0,
            "reading_completed": "true",
            "writing_completed": 1,
            "listening_completed": false,
        }));
        let record = decode_progress(&row).unwrap();
        assert_eq!(record.lesson_id, 12);
        assert_eq!(record.total_score, 40);
        assert!(record.skills.reading && record.skills.writing);
        assert!(!record.skills.listening);
    }
}
