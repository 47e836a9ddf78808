use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{ReviewStore, ScheduleClose};
use crate::curve::ForgettingCurveProfile;
use crate::error::{EngineError, EngineResult};
use crate::types::{ItemBaseline, ReviewSchedule, ReviewStatus};

/// In-process store. Backs tests and acts as the degraded-mode fallback
/// wiring; semantics match `PgStore`, including the conditional create.
#[derive(Default)]
pub struct MemoryStore {
    schedules: Mutex<HashMap<String, ReviewSchedule>>,
    profiles: Mutex<HashMap<String, ForgettingCurveProfile>>,
    baselines: Mutex<HashMap<String, ItemBaseline>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule_count(&self) -> usize {
        self.schedules.lock().len()
    }

    /// Active (Scheduled/Overdue) rows for a pair; test hook for the
    /// at-most-one invariant.
    pub fn active_count(&self, user_id: &str, item_id: &str) -> usize {
        self.schedules
            .lock()
            .values()
            .filter(|s| s.user_id == user_id && s.item_id == item_id && s.status.is_active())
            .count()
    }
}

#[async_trait]
impl ReviewStore for MemoryStore {
    async fn get_schedule(&self, id: &str) -> EngineResult<Option<ReviewSchedule>> {
        Ok(self.schedules.lock().get(id).cloned())
    }

    async fn active_schedule(
        &self,
        user_id: &str,
        item_id: &str,
    ) -> EngineResult<Option<ReviewSchedule>> {
        Ok(self
            .schedules
            .lock()
            .values()
            .filter(|s| s.user_id == user_id && s.item_id == item_id && s.status.is_active())
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn latest_schedule(
        &self,
        user_id: &str,
        item_id: &str,
    ) -> EngineResult<Option<ReviewSchedule>> {
        Ok(self
            .schedules
            .lock()
            .values()
            .filter(|s| s.user_id == user_id && s.item_id == item_id)
            .max_by_key(|s| s.updated_at)
            .cloned())
    }

    async fn insert_schedule(
        &self,
        schedule: &ReviewSchedule,
        tolerating: Option<&str>,
    ) -> EngineResult<()> {
        let mut schedules = self.schedules.lock();

        let conflicting = schedules.values().any(|s| {
            s.user_id == schedule.user_id
                && s.item_id == schedule.item_id
                && s.status.is_active()
                && Some(s.id.as_str()) != tolerating
        });
        if conflicting {
            return Err(EngineError::Conflict(format!(
                "active schedule already exists for ({}, {})",
                schedule.user_id, schedule.item_id
            )));
        }

        schedules.insert(schedule.id.clone(), schedule.clone());
        Ok(())
    }

    async fn close_schedule(&self, id: &str, close: ScheduleClose) -> EngineResult<ReviewSchedule> {
        let mut schedules = self.schedules.lock();
        let row = schedules
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("schedule {id}")))?;

        if !row.status.is_active() {
            return Err(EngineError::Conflict(format!(
                "schedule {id} is already {}",
                row.status.as_str()
            )));
        }

        row.status = close.status;
        row.is_success = close.is_success;
        row.response_time_ms = close.response_time_ms;
        row.confidence_level = close.confidence_level;
        row.difficulty_score_at_review = close.difficulty_score_at_review;
        row.next_scheduled_at = close.next_scheduled_at;
        row.updated_at = Utc::now();

        Ok(row.clone())
    }

    async fn mark_overdue(&self, cutoff: DateTime<Utc>) -> EngineResult<u64> {
        let mut moved = 0u64;
        let now = Utc::now();
        for row in self.schedules.lock().values_mut() {
            if row.status == ReviewStatus::Scheduled && row.scheduled_at < cutoff {
                row.status = ReviewStatus::Overdue;
                row.updated_at = now;
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn get_profile(&self, user_id: &str) -> EngineResult<Option<ForgettingCurveProfile>> {
        Ok(self.profiles.lock().get(user_id).cloned())
    }

    async fn upsert_profile(&self, profile: &ForgettingCurveProfile) -> EngineResult<()> {
        self.profiles
            .lock()
            .insert(profile.user_id.clone(), profile.clone());
        Ok(())
    }

    async fn get_item_baseline(&self, item_id: &str) -> EngineResult<Option<ItemBaseline>> {
        Ok(self.baselines.lock().get(item_id).cloned())
    }

    async fn upsert_item_baseline(&self, baseline: &ItemBaseline) -> EngineResult<()> {
        self.baselines
            .lock()
            .insert(baseline.item_id.clone(), baseline.clone());
        Ok(())
    }

    async fn recently_active_users(
        &self,
        item_id: &str,
        limit: usize,
    ) -> EngineResult<Vec<String>> {
        let schedules = self.schedules.lock();
        let mut latest: HashMap<&str, DateTime<Utc>> = HashMap::new();
        for row in schedules.values() {
            if row.item_id == item_id && row.status == ReviewStatus::Completed {
                let entry = latest.entry(row.user_id.as_str()).or_insert(row.updated_at);
                if row.updated_at > *entry {
                    *entry = row.updated_at;
                }
            }
        }

        let mut users: Vec<(&str, DateTime<Utc>)> = latest.into_iter().collect();
        users.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(users
            .into_iter()
            .take(limit)
            .map(|(user, _)| user.to_string())
            .collect())
    }
}
