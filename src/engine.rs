use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::aggregation::{FeedbackAggregation, FeedbackAggregator};
use crate::cache::tiered::{CacheLayer, TieredCache};
use crate::cache::{keys, CacheBackend};
use crate::config::EngineConfig;
use crate::curve::{plan_transition, ForgettingCurveProfile, ProfileDelta};
use crate::error::{EngineError, EngineResult};
use crate::predictor::DifficultyPredictor;
use crate::queue::AdjustmentQueue;
use crate::session::SessionRegistry;
use crate::store::{ReviewStore, ScheduleClose};
use crate::types::{
    CompletionInput, DifficultyPrediction, FeedbackKind, FeedbackMetadata, ItemBaseline, Level,
    QueueStatus, ReviewSchedule, ReviewStatus, Urgency,
};

/// Queue markers are observability breadcrumbs, not queue state; a stale
/// marker expires on its own.
const QUEUE_MARKER_TTL: Duration = Duration::from_secs(60 * 60);

/// Rolling success-rate smoothing for item baselines.
const BASELINE_RATE_ALPHA: f64 = 0.05;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionOutcome {
    pub completed: ReviewSchedule,
    pub next_schedule: ReviewSchedule,
    pub profile_delta: ProfileDelta,
}

/// Composition root for the scheduling core. Everything is injected: the
/// durable store, the cache backend, and configuration. No module-level
/// singletons, so tests run the whole engine against in-process fakes.
pub struct SchedulerEngine {
    config: EngineConfig,
    store: Arc<dyn ReviewStore>,
    backend: Arc<dyn CacheBackend>,
    cache: TieredCache,
    aggregator: FeedbackAggregator,
    queue: AdjustmentQueue,
    predictor: DifficultyPredictor,
    registry: SessionRegistry,
}

impl SchedulerEngine {
    pub fn new(
        store: Arc<dyn ReviewStore>,
        backend: Arc<dyn CacheBackend>,
        config: EngineConfig,
    ) -> Self {
        let cache = TieredCache::new(Arc::clone(&backend));
        let aggregator = FeedbackAggregator::new(Arc::clone(&backend), config.clone());
        let queue = AdjustmentQueue::new(config.lease_timeout, config.max_queue_attempts);
        let predictor =
            DifficultyPredictor::new(Arc::clone(&store), cache.clone(), config.clone());
        let registry = SessionRegistry::new(Arc::clone(&backend), config.session_ttl);

        Self {
            config,
            store,
            backend,
            cache,
            aggregator,
            queue,
            predictor,
            registry,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn predictor(&self) -> &DifficultyPredictor {
        &self.predictor
    }

    // ========== Scheduling ==========

    /// Create (or return) the active review cycle for a pair. Idempotent:
    /// at most one active row exists per (user, item), enforced by the
    /// store's conditional create.
    pub async fn schedule_review(
        &self,
        user_id: &str,
        item_id: &str,
    ) -> EngineResult<ReviewSchedule> {
        validate_id(user_id, "user_id")?;
        validate_id(item_id, "item_id")?;

        if let Some(active) = self.store.active_schedule(user_id, item_id).await? {
            return Ok(active);
        }

        // A skipped cycle resumes at its unchanged level; a fresh pair
        // starts at level 1.
        let level = self
            .store
            .latest_schedule(user_id, item_id)
            .await?
            .map(|row| row.current_level)
            .unwrap_or(Level::MIN);

        let due = Utc::now() + to_chrono(self.config.interval_for(level));
        let schedule = ReviewSchedule::new(user_id, item_id, level, due);

        match self.store.insert_schedule(&schedule, None).await {
            Ok(()) => {
                info!(user_id, item_id, level = level.get(), "review scheduled");
                Ok(schedule)
            }
            // Lost a race with a concurrent create; the winner's row is the
            // active one.
            Err(EngineError::Conflict(_)) => self
                .store
                .active_schedule(user_id, item_id)
                .await?
                .ok_or_else(|| {
                    EngineError::Store("conditional create conflicted without an active row".into())
                }),
            Err(err) => Err(err),
        }
    }

    /// Close a review cycle and open the next one. The successor row is
    /// created before the previous row is closed, so a crash in between
    /// leaves the prior cycle active instead of orphaning the learner.
    pub async fn complete_review(
        &self,
        schedule_id: &str,
        input: CompletionInput,
    ) -> EngineResult<CompletionOutcome> {
        if input.response_time_ms < 0 {
            return Err(EngineError::InvalidInput(
                "response_time_ms must be non-negative".to_string(),
            ));
        }

        let schedule = self
            .store
            .get_schedule(schedule_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("schedule {schedule_id}")))?;

        if !schedule.status.is_active() {
            return Err(EngineError::Conflict(format!(
                "schedule {schedule_id} is already {}",
                schedule.status.as_str()
            )));
        }

        let baseline = self
            .store
            .get_item_baseline(&schedule.item_id)
            .await?
            .unwrap_or_else(|| ItemBaseline::new(&schedule.item_id));

        let now = Utc::now();
        let plan = plan_transition(&self.config, schedule.current_level, &input, now);

        let mut successor =
            ReviewSchedule::new(&schedule.user_id, &schedule.item_id, plan.new_level, plan.due_at);
        successor.supersedes = Some(schedule.id.clone());
        self.insert_successor(&successor, &schedule).await?;

        let close = ScheduleClose {
            status: ReviewStatus::Completed,
            is_success: Some(plan.is_success),
            response_time_ms: Some(input.response_time_ms),
            confidence_level: input.confidence_level,
            difficulty_score_at_review: Some(baseline.base_difficulty),
            next_scheduled_at: Some(plan.due_at),
        };
        let completed = self.store.close_schedule(&schedule.id, close).await?;

        let profile_delta = self
            .apply_profile_update(&schedule.user_id, plan.is_success, baseline.subject.as_deref())
            .await?;
        self.apply_baseline_update(baseline, plan.is_success).await?;

        // Review outcomes are feedback too; failures here must not undo a
        // completed transition.
        self.feed_aggregation(
            &schedule.item_id,
            &schedule.user_id,
            input.feedback,
            &FeedbackMetadata {
                response_time_ms: input.response_time_ms,
                is_correct: plan.is_success,
                subject: None,
            },
        )
        .await;

        info!(
            user_id = %schedule.user_id,
            item_id = %schedule.item_id,
            from_level = schedule.current_level.get(),
            to_level = plan.new_level.get(),
            success = plan.is_success,
            "review completed"
        );

        Ok(CompletionOutcome {
            completed,
            next_schedule: successor,
            profile_delta,
        })
    }

    /// Cancel the active cycle without recording an outcome. Aggregation
    /// counters are untouched: a skip is not a failure.
    pub async fn skip_review(&self, schedule_id: &str) -> EngineResult<ReviewSchedule> {
        let schedule = self
            .store
            .get_schedule(schedule_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("schedule {schedule_id}")))?;

        if !schedule.status.is_active() {
            return Err(EngineError::Conflict(format!(
                "schedule {schedule_id} is already {}",
                schedule.status.as_str()
            )));
        }

        let skipped = self
            .store
            .close_schedule(&schedule.id, ScheduleClose::skipped())
            .await?;
        debug!(schedule_id, "review skipped");
        Ok(skipped)
    }

    /// Sweep overdue rows. Level is untouched; overdue items gain priority
    /// in downstream selection, which is a UI concern.
    pub async fn sweep_overdue(&self) -> EngineResult<u64> {
        let cutoff = Utc::now() - to_chrono(self.config.overdue_grace);
        let moved = self.store.mark_overdue(cutoff).await?;
        if moved > 0 {
            info!(moved, "schedules marked overdue");
        }
        Ok(moved)
    }

    // ========== Feedback ==========

    /// Best-effort, fire-and-forget: aggregation is an approximate signal
    /// and must never fail a caller. Invalid kinds are rejected before any
    /// mutation by the typed `FeedbackKind` boundary.
    pub async fn record_feedback(
        &self,
        item_id: &str,
        user_id: &str,
        feedback: FeedbackKind,
        metadata: FeedbackMetadata,
    ) {
        if item_id.trim().is_empty() || metadata.response_time_ms < 0 {
            warn!(item_id, "feedback event rejected");
            return;
        }
        self.feed_aggregation(item_id, user_id, feedback, &metadata)
            .await;
    }

    pub async fn feedback_aggregation(&self, item_id: &str) -> Option<FeedbackAggregation> {
        self.aggregator.current(item_id).await
    }

    // ========== Prediction ==========

    pub async fn predict_difficulty(
        &self,
        user_id: &str,
        item_id: &str,
    ) -> EngineResult<DifficultyPrediction> {
        validate_id(user_id, "user_id")?;
        validate_id(item_id, "item_id")?;
        self.predictor.predict(user_id, item_id).await
    }

    // ========== Adjustment queue ==========

    pub fn queue_status(&self) -> QueueStatus {
        self.queue.status()
    }

    /// Drain one queued item: recalibrate its baseline from the current
    /// aggregation window, then refresh predictions for recently-active
    /// users. Returns false when the queue is empty.
    pub async fn process_next_adjustment(&self) -> EngineResult<bool> {
        let Some(lease) = self.queue.dequeue_next() else {
            return Ok(false);
        };
        let item_id = lease.item_id.clone();

        match self.recalibrate_item(&item_id).await {
            Ok(()) => {
                self.queue.ack(&item_id);
                self.clear_queue_markers(&item_id).await;
                Ok(true)
            }
            Err(err) => {
                let requeued = self.queue.release(&item_id);
                if !requeued {
                    self.clear_queue_markers(&item_id).await;
                }
                warn!(item_id = %item_id, requeued, error = %err, "adjustment processing failed");
                Err(err)
            }
        }
    }

    /// Consume until empty; errors are bounded by the queue's retry budget,
    /// never fatal.
    pub async fn drain_adjustments(&self) -> usize {
        let mut processed = 0usize;
        loop {
            match self.process_next_adjustment().await {
                Ok(true) => processed += 1,
                Ok(false) => break,
                Err(_) => continue,
            }
        }
        processed
    }

    // ========== Internals ==========

    async fn insert_successor(
        &self,
        successor: &ReviewSchedule,
        predecessor: &ReviewSchedule,
    ) -> EngineResult<()> {
        match self
            .store
            .insert_schedule(successor, Some(predecessor.id.as_str()))
            .await
        {
            Ok(()) => Ok(()),
            Err(EngineError::Conflict(_)) => {
                // A crash between successor creation and predecessor close
                // leaves an orphaned successor. It was never acted on, so
                // supersede it and retry once.
                let active = self
                    .store
                    .active_schedule(&successor.user_id, &successor.item_id)
                    .await?;
                match active {
                    Some(orphan)
                        if orphan.supersedes.as_deref() == Some(predecessor.id.as_str()) =>
                    {
                        warn!(orphan_id = %orphan.id, "superseding orphaned successor");
                        self.store
                            .close_schedule(&orphan.id, ScheduleClose::skipped())
                            .await?;
                        self.store
                            .insert_schedule(successor, Some(predecessor.id.as_str()))
                            .await
                    }
                    _ => Err(EngineError::Conflict(format!(
                        "active schedule already exists for ({}, {})",
                        successor.user_id, successor.item_id
                    ))),
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn apply_profile_update(
        &self,
        user_id: &str,
        is_success: bool,
        subject: Option<&str>,
    ) -> EngineResult<ProfileDelta> {
        let mut profile = self
            .store
            .get_profile(user_id)
            .await?
            .unwrap_or_else(|| ForgettingCurveProfile::new(user_id));

        let delta = profile.apply_review(is_success, subject);
        self.store.upsert_profile(&profile).await?;

        // Profile change invalidates this user's cached predictions, then
        // the fresh profile goes back on the warm path.
        self.predictor.invalidate_user(user_id).await;
        self.cache
            .set_with_tags(
                &keys::profile_key(user_id),
                &profile,
                CacheLayer::L2,
                &[keys::user_tag(user_id)],
            )
            .await;

        Ok(delta)
    }

    async fn apply_baseline_update(
        &self,
        mut baseline: ItemBaseline,
        is_success: bool,
    ) -> EngineResult<()> {
        let outcome = if is_success { 1.0 } else { 0.0 };
        baseline.success_rate += BASELINE_RATE_ALPHA * (outcome - baseline.success_rate);
        baseline.total_reviews += 1;
        baseline.updated_at = Utc::now();
        self.store.upsert_item_baseline(&baseline).await
    }

    async fn feed_aggregation(
        &self,
        item_id: &str,
        user_id: &str,
        feedback: FeedbackKind,
        metadata: &FeedbackMetadata,
    ) {
        let aggregation = self.aggregator.record(item_id, feedback, metadata).await;

        if aggregation.needs_adjustment && aggregation.urgency != Urgency::Low {
            let enqueued = self.queue.enqueue(item_id, aggregation.urgency);
            if enqueued {
                self.backend
                    .set_raw(
                        &keys::queue_marker_key(aggregation.urgency, item_id),
                        "1",
                        Some(QUEUE_MARKER_TTL),
                    )
                    .await;
                debug!(
                    item_id,
                    user_id,
                    urgency = aggregation.urgency.as_str(),
                    "item flagged for difficulty adjustment"
                );
            }
        }
    }

    async fn recalibrate_item(&self, item_id: &str) -> EngineResult<()> {
        let Some(aggregation) = self.aggregator.current(item_id).await else {
            // The window expired while the item waited; nothing to act on.
            debug!(item_id, "no aggregation window at recalibration time");
            return Ok(());
        };

        let mut baseline = self
            .store
            .get_item_baseline(item_id)
            .await?
            .unwrap_or_else(|| ItemBaseline::new(item_id));

        let step = self.config.recalibration_step;
        let before = baseline.base_difficulty;
        if aggregation.negative_rate() > self.config.negative_rate_threshold {
            baseline.base_difficulty = (baseline.base_difficulty + step).min(10.0);
        } else if aggregation.easy_rate() > self.config.easy_rate_threshold {
            baseline.base_difficulty = (baseline.base_difficulty - step).max(1.0);
        }
        baseline.success_rate +=
            BASELINE_RATE_ALPHA * (aggregation.success_rate - baseline.success_rate);
        baseline.updated_at = Utc::now();
        self.store.upsert_item_baseline(&baseline).await?;

        self.predictor.invalidate_item(item_id).await;

        let users = self
            .store
            .recently_active_users(item_id, self.config.batch_refresh_limit)
            .await?;
        let pairs: Vec<(String, String)> = users
            .into_iter()
            .map(|user_id| (user_id, item_id.to_string()))
            .collect();
        let refreshed = self.predictor.batch_update(&pairs).await;

        info!(
            item_id,
            difficulty_before = before,
            difficulty_after = baseline.base_difficulty,
            predictions_refreshed = refreshed,
            "item difficulty recalibrated"
        );
        Ok(())
    }

    async fn clear_queue_markers(&self, item_id: &str) {
        for urgency in [Urgency::Low, Urgency::Medium, Urgency::High] {
            self.backend
                .delete(&keys::queue_marker_key(urgency, item_id))
                .await;
        }
    }
}

fn validate_id(value: &str, field: &str) -> EngineResult<()> {
    if value.trim().is_empty() {
        return Err(EngineError::InvalidInput(format!("{field} is required")));
    }
    Ok(())
}

fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::zero())
}
