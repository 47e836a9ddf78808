mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{harness, harness_with_config};
use recall_core::cache::CacheBackend;
use recall_core::config::{EngineConfig, FailurePolicy};
use recall_core::error::EngineError;
use recall_core::store::ReviewStore;
use recall_core::types::{
    CompletionInput, FeedbackKind, FeedbackMetadata, Level, ReviewSchedule, ReviewStatus,
};

fn completion(feedback: FeedbackKind, response_time_ms: i64) -> CompletionInput {
    CompletionInput {
        feedback,
        response_time_ms,
        score: None,
        max_score: None,
        confidence_level: None,
    }
}

fn metadata(is_correct: bool, response_time_ms: i64) -> FeedbackMetadata {
    FeedbackMetadata {
        response_time_ms,
        is_correct,
        subject: None,
    }
}

#[tokio::test]
async fn schedule_review_is_idempotent_per_pair() {
    let h = harness();

    let first = h.engine.schedule_review("u1", "i1").await.unwrap();
    let second = h.engine.schedule_review("u1", "i1").await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.current_level, Level::MIN);
    assert_eq!(h.store.active_count("u1", "i1"), 1);
}

#[tokio::test]
async fn good_answer_at_level_three_moves_to_level_four() {
    let h = harness();
    let now = Utc::now();

    let schedule = ReviewSchedule::new("u1", "itemX", Level::new(3).unwrap(), now);
    h.store.insert_schedule(&schedule, None).await.unwrap();

    let outcome = h
        .engine
        .complete_review(&schedule.id, completion(FeedbackKind::Good, 12_000))
        .await
        .unwrap();

    assert_eq!(outcome.next_schedule.current_level.get(), 4);
    assert_eq!(outcome.completed.status, ReviewStatus::Completed);
    assert_eq!(outcome.completed.is_success, Some(true));

    let interval = h.engine.config().interval_for(Level::new(4).unwrap());
    let expected = Utc::now() + ChronoDuration::from_std(interval).unwrap();
    let drift = (outcome.next_schedule.scheduled_at - expected)
        .num_seconds()
        .abs();
    assert!(drift <= 5, "next due drifted {drift}s from now + interval(4)");
}

#[tokio::test]
async fn failure_decrements_and_floors_at_level_one() {
    let h = harness();

    let schedule = ReviewSchedule::new("u1", "i1", Level::MIN, Utc::now());
    h.store.insert_schedule(&schedule, None).await.unwrap();

    let outcome = h
        .engine
        .complete_review(&schedule.id, completion(FeedbackKind::Retry, 4_000))
        .await
        .unwrap();

    assert_eq!(outcome.next_schedule.current_level, Level::MIN);
    assert!(!outcome.profile_delta.is_success);
    assert!(outcome.profile_delta.retention_factor_after < outcome.profile_delta.retention_factor_before);
}

#[tokio::test]
async fn completing_twice_is_a_conflict() {
    let h = harness();

    let schedule = h.engine.schedule_review("u1", "i1").await.unwrap();
    h.engine
        .complete_review(&schedule.id, completion(FeedbackKind::Good, 2_000))
        .await
        .unwrap();

    let err = h
        .engine
        .complete_review(&schedule.id, completion(FeedbackKind::Good, 2_000))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));

    // The failed retry must not have disturbed the successor cycle.
    assert_eq!(h.store.active_count("u1", "i1"), 1);
}

#[tokio::test]
async fn at_most_one_active_schedule_across_many_cycles() {
    let h = harness();

    let mut schedule = h.engine.schedule_review("u1", "i1").await.unwrap();
    let feedbacks = [
        FeedbackKind::Good,
        FeedbackKind::Retry,
        FeedbackKind::Easy,
        FeedbackKind::Hard,
        FeedbackKind::Good,
        FeedbackKind::Good,
        FeedbackKind::Retry,
        FeedbackKind::Easy,
    ];

    for feedback in feedbacks {
        let outcome = h
            .engine
            .complete_review(&schedule.id, completion(feedback, 3_000))
            .await
            .unwrap();
        assert_eq!(h.store.active_count("u1", "i1"), 1);
        schedule = outcome.next_schedule;
    }
}

#[tokio::test]
async fn orphaned_successor_is_superseded_on_retry() {
    let h = harness();

    let schedule = h.engine.schedule_review("u1", "i1").await.unwrap();

    // Simulate a crash that created the successor but never closed the
    // predecessor: both rows are active.
    let mut orphan = ReviewSchedule::new("u1", "i1", Level::new(2).unwrap(), Utc::now());
    orphan.supersedes = Some(schedule.id.clone());
    h.store
        .insert_schedule(&orphan, Some(schedule.id.as_str()))
        .await
        .unwrap();
    assert_eq!(h.store.active_count("u1", "i1"), 2);

    let outcome = h
        .engine
        .complete_review(&schedule.id, completion(FeedbackKind::Good, 1_500))
        .await
        .unwrap();

    assert_eq!(h.store.active_count("u1", "i1"), 1);
    let stale = h.store.get_schedule(&orphan.id).await.unwrap().unwrap();
    assert_eq!(stale.status, ReviewStatus::Skipped);
    assert_eq!(outcome.next_schedule.current_level.get(), 2);
}

#[tokio::test]
async fn skip_keeps_level_and_aggregation_untouched() {
    let h = harness();

    let schedule = ReviewSchedule::new("u1", "i1", Level::new(5).unwrap(), Utc::now());
    h.store.insert_schedule(&schedule, None).await.unwrap();

    let skipped = h.engine.skip_review(&schedule.id).await.unwrap();
    assert_eq!(skipped.status, ReviewStatus::Skipped);
    assert!(h.engine.feedback_aggregation("i1").await.is_none());

    // Rescheduling resumes at the unchanged level.
    let next = h.engine.schedule_review("u1", "i1").await.unwrap();
    assert_eq!(next.current_level.get(), 5);
}

#[tokio::test]
async fn sweep_marks_overdue_without_touching_level() {
    let h = harness();

    let stale_due = Utc::now() - ChronoDuration::hours(3);
    let schedule = ReviewSchedule::new("u1", "i1", Level::new(4).unwrap(), stale_due);
    h.store.insert_schedule(&schedule, None).await.unwrap();

    let moved = h.engine.sweep_overdue().await.unwrap();
    assert_eq!(moved, 1);

    let swept = h.store.get_schedule(&schedule.id).await.unwrap().unwrap();
    assert_eq!(swept.status, ReviewStatus::Overdue);
    assert_eq!(swept.current_level.get(), 4);

    // Overdue cycles remain completable.
    let outcome = h
        .engine
        .complete_review(&schedule.id, completion(FeedbackKind::Good, 2_000))
        .await
        .unwrap();
    assert_eq!(outcome.next_schedule.current_level.get(), 5);
}

#[tokio::test]
async fn negative_feedback_storm_reaches_high_urgency_queue() {
    let h = harness();

    for _ in 0..6 {
        h.engine
            .record_feedback("itemY", "u1", FeedbackKind::Retry, metadata(false, 9_000))
            .await;
    }
    for _ in 0..2 {
        h.engine
            .record_feedback("itemY", "u2", FeedbackKind::Hard, metadata(false, 8_000))
            .await;
    }
    for _ in 0..2 {
        h.engine
            .record_feedback("itemY", "u3", FeedbackKind::Good, metadata(true, 3_000))
            .await;
    }

    let aggregation = h.engine.feedback_aggregation("itemY").await.unwrap();
    assert_eq!(aggregation.total_feedbacks, 10);
    assert!((aggregation.negative_rate() - 0.8).abs() < 1e-9);

    let status = h.engine.queue_status();
    assert_eq!(status.high_count, 1);
    assert_eq!(status.medium_count, 0);

    // The marker namespace reflects the pending entry.
    assert!(h.backend.get_raw("queue:high:itemY").await.is_some());
}

#[tokio::test]
async fn adjustment_processing_recalibrates_and_refreshes_predictions() {
    let h = harness();

    // Learner history so the batch refresh has users to touch.
    let schedule = h.engine.schedule_review("u1", "itemY").await.unwrap();
    h.engine
        .complete_review(&schedule.id, completion(FeedbackKind::Retry, 7_000))
        .await
        .unwrap();

    for _ in 0..9 {
        h.engine
            .record_feedback("itemY", "u1", FeedbackKind::Retry, metadata(false, 9_000))
            .await;
    }

    let before = h
        .engine
        .predict_difficulty("u1", "itemY")
        .await
        .unwrap()
        .predicted_difficulty;

    let processed = h.engine.process_next_adjustment().await.unwrap();
    assert!(processed);

    let baseline = h.store.get_item_baseline("itemY").await.unwrap().unwrap();
    assert!(baseline.base_difficulty > 5.0);

    let after = h
        .engine
        .predict_difficulty("u1", "itemY")
        .await
        .unwrap()
        .predicted_difficulty;
    assert!(after > before);

    // Queue drained, markers cleared.
    assert_eq!(h.engine.queue_status().high_count, 0);
    assert!(h.backend.get_raw("queue:high:itemY").await.is_none());
    assert!(!h.engine.process_next_adjustment().await.unwrap());
}

#[tokio::test]
async fn cold_cache_prediction_recomputes_and_recaches() {
    let h = harness();

    let prediction = h.engine.predict_difficulty("u1", "i1").await.unwrap();
    assert!(prediction.predicted_difficulty >= 1.0 && prediction.predicted_difficulty <= 10.0);

    // The recomputed value landed in L1 of the tiered cache.
    assert!(h.backend.get_raw("l1:prediction:u1:i1").await.is_some());

    let repeated = h.engine.predict_difficulty("u1", "i1").await.unwrap();
    assert_eq!(
        prediction.predicted_difficulty,
        repeated.predicted_difficulty
    );
    assert_eq!(prediction.computed_at, repeated.computed_at);
}

#[tokio::test]
async fn profile_change_invalidates_cached_predictions() {
    let h = harness();

    let first = h.engine.predict_difficulty("u1", "i1").await.unwrap();

    let schedule = h.engine.schedule_review("u1", "i1").await.unwrap();
    h.engine
        .complete_review(&schedule.id, completion(FeedbackKind::Retry, 6_000))
        .await
        .unwrap();

    let second = h.engine.predict_difficulty("u1", "i1").await.unwrap();
    // Recomputed from the mutated profile, not served from cache.
    assert!(second.computed_at > first.computed_at);
}

#[tokio::test]
async fn item_invalidation_forces_recompute() {
    let h = harness();

    let first = h.engine.predict_difficulty("u1", "i1").await.unwrap();
    h.engine.predictor().invalidate_item("i1").await;

    let second = h.engine.predict_difficulty("u1", "i1").await.unwrap();
    assert!(second.computed_at > first.computed_at);
}

#[tokio::test]
async fn token_blacklist_round_trip_via_registry() {
    let h = harness();
    let registry = h.engine.registry();

    registry
        .blacklist_token("tokenT", Utc::now() + ChronoDuration::seconds(60))
        .await
        .unwrap();
    assert!(registry.is_token_blacklisted("tokenT").await);
    assert!(!registry.is_token_blacklisted("someone-else").await);
}

#[tokio::test]
async fn invalid_inputs_are_rejected_before_mutation() {
    let h = harness();

    let err = h.engine.schedule_review("", "i1").await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));

    let schedule = h.engine.schedule_review("u1", "i1").await.unwrap();
    let err = h
        .engine
        .complete_review(&schedule.id, completion(FeedbackKind::Good, -5))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));

    let untouched = h.store.get_schedule(&schedule.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, ReviewStatus::Scheduled);

    let err = h
        .engine
        .complete_review("missing-id", completion(FeedbackKind::Good, 1_000))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn reset_policy_drops_failures_to_level_one() {
    let config = EngineConfig {
        failure_policy: FailurePolicy::Reset,
        ..EngineConfig::default()
    };
    let h = harness_with_config(config);

    let schedule = ReviewSchedule::new("u1", "i1", Level::new(5).unwrap(), Utc::now());
    h.store.insert_schedule(&schedule, None).await.unwrap();

    let outcome = h
        .engine
        .complete_review(&schedule.id, completion(FeedbackKind::Hard, 4_000))
        .await
        .unwrap();
    assert_eq!(outcome.next_schedule.current_level, Level::MIN);
}

#[tokio::test]
async fn graded_score_success_advances_level() {
    let h = harness();

    let schedule = h.engine.schedule_review("u1", "i1").await.unwrap();
    let input = CompletionInput {
        feedback: FeedbackKind::Hard,
        response_time_ms: 5_000,
        score: Some(75.0),
        max_score: Some(100.0),
        confidence_level: Some(3),
    };

    let outcome = h.engine.complete_review(&schedule.id, input).await.unwrap();
    assert_eq!(outcome.completed.is_success, Some(true));
    assert_eq!(outcome.next_schedule.current_level.get(), 2);
}
