//! Record types shared by both stores.
//!
//! These are the store-agnostic shapes the facade hands to callers. Each
//! adapter owns its own translation to and from what it persists.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Opaque user identifier supplied by the authentication provider.
pub type UserId = String;

/// Lesson identifier from the content catalog.
pub type LessonId = i64;

/// Highest value an aggregate score may hold.
pub const MAX_SCORE: u8 = 100;

// ═══════════════════════════════════════════════════════════════════════
//  Progress
// ═══════════════════════════════════════════════════════════════════════

/// Skill categories tracked per lesson.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Skill {
    Vocabulary,
    Listening,
    Speaking,
    Reading,
    Writing,
}

impl Skill {
    /// Every skill, in display order.
    pub const ALL: [Skill; 5] = [
        Skill::Vocabulary,
        Skill::Listening,
        Skill::Speaking,
        Skill::Reading,
        Skill::Writing,
    ];

    /// Column name of the completion flag in the durable progress collection.
    pub fn column(self) -> &'static str {
        match self {
            Self::Vocabulary => "vocabulary_completed",
            Self::Listening => "listening_completed",
            Self::Speaking => "speaking_completed",
            Self::Reading => "reading_completed",
            Self::Writing => "writing_completed",
        }
    }
}

impl std::fmt::Display for Skill {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Vocabulary => "vocabulary",
            Self::Listening => "listening",
            Self::Speaking => "speaking",
            Self::Reading => "reading",
            Self::Writing => "writing",
        };
        f.write_str(name)
    }
}

/// Per-skill completion flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillFlags {
    pub vocabulary: bool,
    pub listening: bool,
    pub speaking: bool,
    pub reading: bool,
    pub writing: bool,
}

impl SkillFlags {
    pub fn get(&self, skill: Skill) -> bool {
        match skill {
            Skill::Vocabulary => self.vocabulary,
            Skill::Listening => self.listening,
            Skill::Speaking => self.speaking,
            Skill::Reading => self.reading,
            Skill::Writing => self.writing,
        }
    }

    pub fn set(&mut self, skill: Skill, done: bool) {
        let slot = match skill {
            Skill::Vocabulary => &mut self.vocabulary,
            Skill::Listening => &mut self.listening,
            Skill::Speaking => &mut self.speaking,
            Skill::Reading => &mut self.reading,
            Skill::Writing => &mut self.writing,
        };
        *slot = done;
    }

    /// True only when every skill is complete.
    pub fn all(&self) -> bool {
        Skill::ALL.iter().all(|s| self.get(*s))
    }
}

/// Progress of one learner through one lesson.
///
/// There is deliberately no stored `completed` field: see
/// [`ProgressRecord::completed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub lesson_id: LessonId,
    pub skills: SkillFlags,
    /// Aggregate percentage score, 0–100.
    pub total_score: u8,
    pub last_accessed: Option<DateTime<Utc>>,
}

impl ProgressRecord {
    /// A fresh record with nothing completed.
    pub fn new(lesson_id: LessonId) -> Self {
        Self {
            lesson_id,
            skills: SkillFlags::default(),
            total_score: 0,
            last_accessed: None,
        }
    }

    /// Whether the lesson is complete. Always the AND of the skill flags.
    pub fn completed(&self) -> bool {
        self.skills.all()
    }

    /// Merge `patch` into this record. Fields absent from the patch keep
    /// their current values.
    pub fn apply(&mut self, patch: &ProgressPatch) {
        for skill in Skill::ALL {
            if let Some(done) = patch.skill(skill) {
                self.skills.set(skill, done);
            }
        }
        if let Some(score) = patch.total_score {
            self.total_score = score.min(MAX_SCORE);
        }
        if let Some(ts) = patch.last_accessed {
            self.last_accessed = Some(ts);
        }
    }
}

/// A partial progress update. `None` means "leave unchanged".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressPatch {
    pub vocabulary: Option<bool>,
    pub listening: Option<bool>,
    pub speaking: Option<bool>,
    pub reading: Option<bool>,
    pub writing: Option<bool>,
    pub total_score: Option<u8>,
    pub last_accessed: Option<DateTime<Utc>>,
}

impl ProgressPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one skill's completion flag.
    pub fn with_skill(mut self, skill: Skill, done: bool) -> Self {
        let slot = match skill {
            Skill::Vocabulary => &mut self.vocabulary,
            Skill::Listening => &mut self.listening,
            Skill::Speaking => &mut self.speaking,
            Skill::Reading => &mut self.reading,
            Skill::Writing => &mut self.writing,
        };
        *slot = Some(done);
        self
    }

    pub fn with_score(mut self, score: u8) -> Self {
        self.total_score = Some(score);
        self
    }

    pub fn with_last_accessed(mut self, at: DateTime<Utc>) -> Self {
        self.last_accessed = Some(at);
        self
    }

    /// The patch value for `skill`, if any.
    pub fn skill(&self, skill: Skill) -> Option<bool> {
        match skill {
            Skill::Vocabulary => self.vocabulary,
            Skill::Listening => self.listening,
            Skill::Speaking => self.speaking,
            Skill::Reading => self.reading,
            Skill::Writing => self.writing,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Exercise results
// ═══════════════════════════════════════════════════════════════════════

/// One immutable exercise attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseResult {
    pub lesson_id: LessonId,
    pub exercise_type: String,
    pub score: u32,
    pub total_questions: u32,
    pub correct_answers: u32,
    pub time_spent_seconds: u32,
    pub completed_at: DateTime<Utc>,
}

impl ExerciseResult {
    /// Reject results that cannot have happened.
    pub fn validate(&self) -> StoreResult<()> {
        if self.correct_answers > self.total_questions {
            return Err(StoreError::InvalidArgument(format!(
                "correct answers ({}) exceed total questions ({})",
                self.correct_answers, self.total_questions
            )));
        }
        if self.exercise_type.trim().is_empty() {
            return Err(StoreError::InvalidArgument(
                "exercise type must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Order results newest first. Stable, so equal timestamps keep arrival order.
pub(crate) fn sort_newest_first(results: &mut [ExerciseResult]) {
    results.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
}

// ═══════════════════════════════════════════════════════════════════════
//  Daily activity
// ═══════════════════════════════════════════════════════════════════════

/// Activity counter for one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyActivity {
    pub date: NaiveDate,
    pub minutes_spent: u32,
    pub streak: u32,
}

impl DailyActivity {
    /// An empty counter for `date`.
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            minutes_spent: 0,
            streak: 0,
        }
    }
}

/// Minutes added by a single activity tick.
pub const ACTIVITY_TICK_MINUTES: u32 = 1;

// ═══════════════════════════════════════════════════════════════════════
//  Routing
// ═══════════════════════════════════════════════════════════════════════

/// Persisted preference deciding how the source is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataMode {
    /// Probe the durable store and follow the data.
    #[default]
    #[serde(rename = "auto")]
    Automatic,
    /// Always use the device-local store.
    #[serde(rename = "local")]
    ForcedEphemeral,
    /// Always use the durable store.
    #[serde(rename = "real")]
    ForcedDurable,
}

impl DataMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Automatic => "auto",
            Self::ForcedEphemeral => "local",
            Self::ForcedDurable => "real",
        }
    }

    /// Parse a stored value; anything unrecognised yields `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "auto" => Some(Self::Automatic),
            "local" => Some(Self::ForcedEphemeral),
            "real" => Some(Self::ForcedDurable),
            _ => None,
        }
    }
}

impl std::fmt::Display for DataMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The store backing a given operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Ephemeral,
    Durable,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ephemeral => f.write_str("ephemeral"),
            Self::Durable => f.write_str("durable"),
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_requires_every_skill() {
        let mut record = ProgressRecord::new(1);
        for skill in Skill::ALL.iter().take(4) {
            record.skills.set(*skill, true);
        }
        assert!(!record.completed());

        record.skills.set(Skill::Writing, true);
        assert!(record.completed());
    }

    #[test]
    fn apply_leaves_absent_fields_alone() {
        let mut record = ProgressRecord::new(3);
        record.skills.set(Skill::Reading, true);
        record.total_score = 55;

        record.apply(&ProgressPatch::new().with_skill(Skill::Speaking, true));

        assert!(record.skills.reading);
        assert!(record.skills.speaking);
        assert_eq!(record.total_score, 55);
        assert!(record.last_accessed.is_none());
    }

    #[test]
    fn apply_clamps_score() {
        let mut record = ProgressRecord::new(3);
        record.apply(&ProgressPatch::new().with_score(250));
        assert_eq!(record.total_score, MAX_SCORE);
    }

    #[test]
    fn empty_patch_detected() {
        assert!(ProgressPatch::new().is_empty());
        assert!(!ProgressPatch::new().with_score(1).is_empty());
    }

    #[test]
    fn validate_rejects_impossible_result() {
        let result = ExerciseResult {
            lesson_id: 1,
            exercise_type: "quiz".into(),
            score: 100,
            total_questions: 4,
            correct_answers: 5,
            time_spent_seconds: 30,
            completed_at: Utc::now(),
        };
        assert!(matches!(
            result.validate(),
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn data_mode_wire_names() {
        assert_eq!(DataMode::parse("real"), Some(DataMode::ForcedDurable));
        assert_eq!(DataMode::parse("local"), Some(DataMode::ForcedEphemeral));
        assert_eq!(DataMode::parse("auto"), Some(DataMode::Automatic));
        assert_eq!(DataMode::parse("mock"), None);
        assert_eq!(
            serde_json::to_string(&DataMode::ForcedDurable).unwrap(),
            "\"real\""
        );
    }
}
