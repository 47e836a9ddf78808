use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::{self, keys, CacheBackend};
use crate::config::EngineConfig;
use crate::types::{FeedbackKind, FeedbackMetadata, Urgency};

/// Rolling per-item statistics over one TTL-bound window.
///
/// This is an approximate signal, not a ledger: concurrent writers race on
/// the cached value and the last one wins. Staleness is bounded by the
/// window TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackAggregation {
    pub item_id: String,
    pub window_start: DateTime<Utc>,
    pub total_feedbacks: u64,
    pub retry_count: u64,
    pub too_hard_count: u64,
    pub just_right_count: u64,
    pub too_easy_count: u64,
    pub avg_response_time_ms: f64,
    pub success_rate: f64,
    pub needs_adjustment: bool,
    pub urgency: Urgency,
}

impl FeedbackAggregation {
    pub fn new(item_id: &str, window_start: DateTime<Utc>) -> Self {
        Self {
            item_id: item_id.to_string(),
            window_start,
            total_feedbacks: 0,
            retry_count: 0,
            too_hard_count: 0,
            just_right_count: 0,
            too_easy_count: 0,
            avg_response_time_ms: 0.0,
            success_rate: 0.0,
            needs_adjustment: false,
            urgency: Urgency::Low,
        }
    }

    pub fn counter_sum(&self) -> u64 {
        self.retry_count + self.too_hard_count + self.just_right_count + self.too_easy_count
    }

    pub fn negative_rate(&self) -> f64 {
        if self.total_feedbacks == 0 {
            return 0.0;
        }
        (self.retry_count + self.too_hard_count) as f64 / self.total_feedbacks as f64
    }

    pub fn easy_rate(&self) -> f64 {
        if self.total_feedbacks == 0 {
            return 0.0;
        }
        self.too_easy_count as f64 / self.total_feedbacks as f64
    }

    /// Fold one feedback event in and re-derive the adjustment signal.
    pub fn record(&mut self, feedback: FeedbackKind, metadata: &FeedbackMetadata, config: &EngineConfig) {
        self.total_feedbacks += 1;
        match feedback {
            FeedbackKind::Retry => self.retry_count += 1,
            FeedbackKind::Hard => self.too_hard_count += 1,
            FeedbackKind::Good => self.just_right_count += 1,
            FeedbackKind::Easy => self.too_easy_count += 1,
        }

        let n = self.total_feedbacks as f64;
        let response_time = metadata.response_time_ms.max(0) as f64;
        self.avg_response_time_ms += (response_time - self.avg_response_time_ms) / n;

        let correct = if metadata.is_correct { 1.0 } else { 0.0 };
        self.success_rate += (correct - self.success_rate) / n;

        let negative_rate = self.negative_rate();
        let easy_rate = self.easy_rate();
        self.needs_adjustment = negative_rate > config.negative_rate_threshold
            || easy_rate > config.easy_rate_threshold;
        // Inclusive threshold: a 6-retry/2-hard/2-good window sits exactly
        // at 0.8 and must already escalate.
        self.urgency = if negative_rate >= config.high_urgency_threshold {
            Urgency::High
        } else if self.needs_adjustment {
            Urgency::Medium
        } else {
            Urgency::Low
        };
    }
}

/// Maintains the `aggregation:<itemId>` windows in the fast tier.
pub struct FeedbackAggregator {
    backend: Arc<dyn CacheBackend>,
    config: EngineConfig,
}

impl FeedbackAggregator {
    pub fn new(backend: Arc<dyn CacheBackend>, config: EngineConfig) -> Self {
        Self { backend, config }
    }

    /// Fetch-or-init the window, fold in one event, write back. Returns the
    /// updated aggregation so the caller can act on the adjustment signal.
    pub async fn record(
        &self,
        item_id: &str,
        feedback: FeedbackKind,
        metadata: &FeedbackMetadata,
    ) -> FeedbackAggregation {
        let now = Utc::now();
        let window = self.config.aggregation_window;
        let key = keys::aggregation_key(item_id);

        let mut aggregation: FeedbackAggregation = match cache::get_json(&*self.backend, &key).await
        {
            Some(existing) if !window_elapsed(&existing, now, window) => existing,
            _ => FeedbackAggregation::new(item_id, now),
        };

        aggregation.record(feedback, metadata, &self.config);

        // TTL covers the remainder of the window, so idle items expire on
        // schedule and hot items do not keep a stale window alive forever.
        let elapsed = (now - aggregation.window_start)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let remaining = window.saturating_sub(elapsed).max(Duration::from_secs(1));
        cache::set_json(&*self.backend, &key, &aggregation, Some(remaining)).await;

        debug!(
            item_id,
            feedback = feedback.as_str(),
            total = aggregation.total_feedbacks,
            negative_rate = aggregation.negative_rate(),
            urgency = aggregation.urgency.as_str(),
            "feedback recorded"
        );

        aggregation
    }

    /// Current window for an item, if one exists. Absence is a valid state:
    /// windows are rebuilt lazily by the next `record`.
    pub async fn current(&self, item_id: &str) -> Option<FeedbackAggregation> {
        let now = Utc::now();
        let aggregation: FeedbackAggregation =
            cache::get_json(&*self.backend, &keys::aggregation_key(item_id)).await?;
        if window_elapsed(&aggregation, now, self.config.aggregation_window) {
            return None;
        }
        Some(aggregation)
    }
}

fn window_elapsed(aggregation: &FeedbackAggregation, now: DateTime<Utc>, window: Duration) -> bool {
    let elapsed = now - aggregation.window_start;
    elapsed.to_std().map(|e| e >= window).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryBackend;

    fn metadata(is_correct: bool, response_time_ms: i64) -> FeedbackMetadata {
        FeedbackMetadata {
            response_time_ms,
            is_correct,
            subject: None,
        }
    }

    fn aggregator() -> FeedbackAggregator {
        FeedbackAggregator::new(Arc::new(MemoryBackend::new()), EngineConfig::default())
    }

    #[tokio::test]
    async fn counters_sum_to_total() {
        let aggregator = aggregator();
        for (feedback, correct) in [
            (FeedbackKind::Retry, false),
            (FeedbackKind::Hard, false),
            (FeedbackKind::Good, true),
            (FeedbackKind::Easy, true),
            (FeedbackKind::Good, true),
        ] {
            aggregator
                .record("item-a", feedback, &metadata(correct, 1000))
                .await;
        }

        let aggregation = aggregator.current("item-a").await.unwrap();
        assert_eq!(aggregation.total_feedbacks, 5);
        assert_eq!(aggregation.counter_sum(), aggregation.total_feedbacks);
    }

    #[tokio::test]
    async fn negative_streak_goes_high_urgency() {
        let aggregator = aggregator();
        // 6 retries + 2 hard + 2 good => negative rate 0.8, not > 0.8.
        for _ in 0..6 {
            aggregator
                .record("item-y", FeedbackKind::Retry, &metadata(false, 9000))
                .await;
        }
        for _ in 0..2 {
            aggregator
                .record("item-y", FeedbackKind::Hard, &metadata(false, 8000))
                .await;
        }
        let mut last = FeedbackAggregation::new("item-y", Utc::now());
        for _ in 0..2 {
            last = aggregator
                .record("item-y", FeedbackKind::Good, &metadata(true, 3000))
                .await;
        }

        assert!((last.negative_rate() - 0.8).abs() < 1e-9);
        assert!(last.needs_adjustment);
        assert_eq!(last.urgency, Urgency::High);
    }

    #[tokio::test]
    async fn easy_items_need_adjustment_at_medium() {
        let aggregator = aggregator();
        let mut last = FeedbackAggregation::new("item-e", Utc::now());
        for _ in 0..8 {
            last = aggregator
                .record("item-e", FeedbackKind::Easy, &metadata(true, 800))
                .await;
        }
        for _ in 0..2 {
            last = aggregator
                .record("item-e", FeedbackKind::Good, &metadata(true, 1500))
                .await;
        }

        assert!(last.easy_rate() > 0.7);
        assert!(last.needs_adjustment);
        assert_eq!(last.urgency, Urgency::Medium);
    }

    #[tokio::test]
    async fn incremental_average_matches_mean() {
        let aggregator = aggregator();
        let times = [1000i64, 2000, 3000, 4000];
        let mut last = FeedbackAggregation::new("item-m", Utc::now());
        for t in times {
            last = aggregator
                .record("item-m", FeedbackKind::Good, &metadata(true, t))
                .await;
        }
        assert!((last.avg_response_time_ms - 2500.0).abs() < 1e-6);
        assert!((last.success_rate - 1.0).abs() < 1e-9);
    }
}
