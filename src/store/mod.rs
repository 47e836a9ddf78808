pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::curve::ForgettingCurveProfile;
use crate::error::EngineResult;
use crate::types::{ItemBaseline, ReviewSchedule, ReviewStatus};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Fields written when a review cycle is closed. Closed rows are immutable
/// afterwards.
#[derive(Debug, Clone)]
pub struct ScheduleClose {
    pub status: ReviewStatus,
    pub is_success: Option<bool>,
    pub response_time_ms: Option<i64>,
    pub confidence_level: Option<i32>,
    pub difficulty_score_at_review: Option<f64>,
    pub next_scheduled_at: Option<DateTime<Utc>>,
}

impl ScheduleClose {
    pub fn skipped() -> Self {
        Self {
            status: ReviewStatus::Skipped,
            is_success: None,
            response_time_ms: None,
            confidence_level: None,
            difficulty_score_at_review: None,
            next_scheduled_at: None,
        }
    }
}

/// Durable system of record. The cache is always subordinate to it: any
/// cached read path must be able to fall back to these operations.
#[async_trait]
pub trait ReviewStore: Send + Sync {
    async fn get_schedule(&self, id: &str) -> EngineResult<Option<ReviewSchedule>>;

    async fn active_schedule(
        &self,
        user_id: &str,
        item_id: &str,
    ) -> EngineResult<Option<ReviewSchedule>>;

    /// Most recently updated row for the pair, regardless of status.
    async fn latest_schedule(
        &self,
        user_id: &str,
        item_id: &str,
    ) -> EngineResult<Option<ReviewSchedule>>;

    /// Conditional create enforcing at-most-one active row per (user, item).
    ///
    /// `tolerating` names the one active row allowed to coexist during a
    /// transition: the successor is inserted while its predecessor is still
    /// open, then the predecessor is closed. Any other active row is a
    /// `Conflict` and nothing is written.
    async fn insert_schedule(
        &self,
        schedule: &ReviewSchedule,
        tolerating: Option<&str>,
    ) -> EngineResult<()>;

    /// Close an active row. `Conflict` if it is already closed, `NotFound`
    /// if it does not exist.
    async fn close_schedule(&self, id: &str, close: ScheduleClose) -> EngineResult<ReviewSchedule>;

    /// Sweep Scheduled rows due before `cutoff` to Overdue, leaving the
    /// level untouched. Returns how many rows moved.
    async fn mark_overdue(&self, cutoff: DateTime<Utc>) -> EngineResult<u64>;

    async fn get_profile(&self, user_id: &str) -> EngineResult<Option<ForgettingCurveProfile>>;

    async fn upsert_profile(&self, profile: &ForgettingCurveProfile) -> EngineResult<()>;

    async fn get_item_baseline(&self, item_id: &str) -> EngineResult<Option<ItemBaseline>>;

    async fn upsert_item_baseline(&self, baseline: &ItemBaseline) -> EngineResult<()>;

    /// Users with the most recent completed cycles on the item, newest
    /// first. Drives prediction refresh after a recalibration.
    async fn recently_active_users(&self, item_id: &str, limit: usize)
        -> EngineResult<Vec<String>>;
}
