use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Learner feedback on a completed review.
///
/// Closed set; anything else is rejected at the boundary before any state
/// is mutated. `Retry`/`Hard` count as negative signal for item difficulty,
/// `Easy` as the item being under-leveled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackKind {
    Retry,
    Hard,
    Good,
    Easy,
}

impl FeedbackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Hard => "hard",
            Self::Good => "good",
            Self::Easy => "easy",
        }
    }

    /// Parse a wire value. Accepts the aggregation-side aliases
    /// (`too_hard`, `just_right`, `too_easy`); rejects everything else.
    pub fn parse(s: &str) -> Result<Self, EngineError> {
        match s.to_lowercase().as_str() {
            "retry" => Ok(Self::Retry),
            "hard" | "too_hard" => Ok(Self::Hard),
            "good" | "just_right" => Ok(Self::Good),
            "easy" | "too_easy" => Ok(Self::Easy),
            other => Err(EngineError::InvalidInput(format!(
                "unknown feedback kind: {other}"
            ))),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Good | Self::Easy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[derive(Default)]
pub enum ReviewStatus {
    #[default]
    Scheduled,
    Completed,
    Overdue,
    Skipped,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::Completed => "COMPLETED",
            Self::Overdue => "OVERDUE",
            Self::Skipped => "SKIPPED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "SCHEDULED" => Some(Self::Scheduled),
            "COMPLETED" => Some(Self::Completed),
            "OVERDUE" => Some(Self::Overdue),
            "SKIPPED" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// Scheduled and Overdue rows are both completable; everything else is
    /// a closed cycle.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Scheduled | Self::Overdue)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum Urgency {
    #[default]
    Low,
    Medium,
    High,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Forgetting-curve level, 1..=8. Level 1 is the shortest re-test interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Level(u8);

impl Level {
    pub const MIN: Level = Level(1);
    pub const MAX: Level = Level(8);
    pub const COUNT: usize = 8;

    pub fn new(value: u8) -> Result<Self, EngineError> {
        if (1..=8).contains(&value) {
            Ok(Self(value))
        } else {
            Err(EngineError::InvalidInput(format!(
                "level out of range: {value}"
            )))
        }
    }

    pub fn get(&self) -> u8 {
        self.0
    }

    /// Zero-based index into the interval table.
    pub fn index(&self) -> usize {
        (self.0 - 1) as usize
    }

    pub fn advance(&self) -> Level {
        Level((self.0 + 1).min(Self::MAX.0))
    }

    pub fn regress(&self) -> Level {
        Level((self.0 - 1).max(Self::MIN.0))
    }
}

impl Default for Level {
    fn default() -> Self {
        Self::MIN
    }
}

/// One review cycle for a (user, item) pair. Immutable once closed; the
/// successor cycle is a new row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewSchedule {
    pub id: String,
    pub user_id: String,
    pub item_id: String,
    pub current_level: Level,
    pub status: ReviewStatus,
    pub scheduled_at: DateTime<Utc>,
    pub next_scheduled_at: Option<DateTime<Utc>>,
    pub is_success: Option<bool>,
    pub response_time_ms: Option<i64>,
    pub confidence_level: Option<i32>,
    pub difficulty_score_at_review: Option<f64>,
    /// Id of the row this cycle replaced, if any.
    pub supersedes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReviewSchedule {
    pub fn new(user_id: &str, item_id: &str, level: Level, due: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            item_id: item_id.to_string(),
            current_level: level,
            status: ReviewStatus::Scheduled,
            scheduled_at: due,
            next_scheduled_at: None,
            is_success: None,
            response_time_ms: None,
            confidence_level: None,
            difficulty_score_at_review: None,
            supersedes: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Inclusive due comparison; callers tolerate clock skew by never
    /// testing for equality.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.scheduled_at
    }
}

/// Durable per-item difficulty record, the target of recalibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemBaseline {
    pub item_id: String,
    pub subject: Option<String>,
    pub base_difficulty: f64,
    pub success_rate: f64,
    pub total_reviews: i64,
    pub updated_at: DateTime<Utc>,
}

impl ItemBaseline {
    pub fn new(item_id: &str) -> Self {
        Self {
            item_id: item_id.to_string(),
            subject: None,
            base_difficulty: 5.0,
            success_rate: 0.7,
            total_reviews: 0,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DifficultyPrediction {
    pub user_id: String,
    pub item_id: String,
    pub predicted_difficulty: f64,
    pub personalized_score: f64,
    pub computed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Caller-supplied context for a feedback event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackMetadata {
    pub response_time_ms: i64,
    pub is_correct: bool,
    pub subject: Option<String>,
}

/// Input to `complete_review`. Success is derived from the feedback kind,
/// or from `score >= 70%` of `max_score` when a graded score is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionInput {
    pub feedback: FeedbackKind,
    pub response_time_ms: i64,
    pub score: Option<f64>,
    pub max_score: Option<f64>,
    pub confidence_level: Option<i32>,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub high_count: usize,
    pub medium_count: usize,
    pub low_count: usize,
}
