use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use tracing::{debug, warn};

use crate::aggregation::FeedbackAggregation;
use crate::cache::tiered::{CacheLayer, TieredCache};
use crate::cache::{self, keys};
use crate::config::EngineConfig;
use crate::curve::ForgettingCurveProfile;
use crate::error::EngineResult;
use crate::store::ReviewStore;
use crate::types::{DifficultyPrediction, ItemBaseline};

const DIFFICULTY_MIN: f64 = 1.0;
const DIFFICULTY_MAX: f64 = 10.0;
const GLOBAL_GAIN: f64 = 4.0;
const GLOBAL_BOUND: f64 = 2.0;
const PERSONAL_BOUND: f64 = 1.5;

/// Personalized difficulty estimates, cached with a short TTL and always
/// recomputable from the durable store.
pub struct DifficultyPredictor {
    store: Arc<dyn ReviewStore>,
    cache: TieredCache,
    config: EngineConfig,
}

impl DifficultyPredictor {
    pub fn new(store: Arc<dyn ReviewStore>, cache: TieredCache, config: EngineConfig) -> Self {
        Self {
            store,
            cache,
            config,
        }
    }

    /// Cached read path; recomputes on miss or staleness. The computation
    /// is deterministic for identical (profile, aggregation, baseline)
    /// snapshots.
    pub async fn predict(&self, user_id: &str, item_id: &str) -> EngineResult<DifficultyPrediction> {
        let key = keys::prediction_key(user_id, item_id);
        if let Some(cached) = self.cache.get::<DifficultyPrediction>(&key).await {
            if Utc::now() < cached.expires_at {
                return Ok(cached);
            }
        }
        self.refresh(user_id, item_id).await
    }

    /// Recompute from the durable sources and re-cache, bypassing any
    /// cached value. Used on adjustment processing and profile change.
    pub async fn refresh(&self, user_id: &str, item_id: &str) -> EngineResult<DifficultyPrediction> {
        let profile = self
            .store
            .get_profile(user_id)
            .await?
            .unwrap_or_else(|| ForgettingCurveProfile::new(user_id));
        let baseline = self
            .store
            .get_item_baseline(item_id)
            .await?
            .unwrap_or_else(|| ItemBaseline::new(item_id));

        // Fresh window stats beat the durable rolling rate when present.
        let aggregation: Option<FeedbackAggregation> =
            cache::get_json(&**self.cache.backend(), &keys::aggregation_key(item_id)).await;

        let prediction = compute_prediction(&self.config, &profile, &baseline, aggregation.as_ref());

        let key = keys::prediction_key(user_id, item_id);
        let tags = [keys::item_tag(item_id), keys::user_tag(user_id)];
        self.cache
            .set_with_tags(&key, &prediction, CacheLayer::L1, &tags)
            .await;

        debug!(
            user_id,
            item_id,
            predicted = prediction.predicted_difficulty,
            "difficulty prediction refreshed"
        );
        Ok(prediction)
    }

    /// Recompute N (user, item) pairs concurrently; used to refresh
    /// recently-active users after an item recalibration. Individual
    /// failures are logged and skipped, never fatal.
    pub async fn batch_update(&self, pairs: &[(String, String)]) -> usize {
        let futures = pairs
            .iter()
            .map(|(user_id, item_id)| self.refresh(user_id, item_id));

        let mut refreshed = 0usize;
        for ((user_id, item_id), result) in pairs.iter().zip(join_all(futures).await) {
            match result {
                Ok(_) => refreshed += 1,
                Err(err) => {
                    warn!(user_id = %user_id, item_id = %item_id, error = %err, "prediction refresh failed");
                }
            }
        }
        refreshed
    }

    pub async fn invalidate_item(&self, item_id: &str) -> usize {
        self.cache
            .invalidate_by_tags(&[keys::item_tag(item_id)])
            .await
    }

    pub async fn invalidate_user(&self, user_id: &str) -> usize {
        self.cache
            .invalidate_by_tags(&[keys::user_tag(user_id)])
            .await
    }
}

/// predicted = clamp(baseline + global + personal, 1, 10).
///
/// `global` pulls items whose recent success rate leaves the target band:
/// items answered poorly read as harder than their baseline claims, items
/// aced read as easier. `personal` shifts by the user's retention strength
/// and their learned per-subject adjustment.
pub fn compute_prediction(
    config: &EngineConfig,
    profile: &ForgettingCurveProfile,
    baseline: &ItemBaseline,
    aggregation: Option<&FeedbackAggregation>,
) -> DifficultyPrediction {
    let success_rate = aggregation
        .filter(|a| a.total_feedbacks > 0)
        .map(|a| a.success_rate)
        .unwrap_or(baseline.success_rate);

    let global = global_adjustment(success_rate, config.target_success_band);
    let personal = personal_adjustment(profile, baseline.subject.as_deref());

    let predicted = (baseline.base_difficulty + global + personal)
        .clamp(DIFFICULTY_MIN, DIFFICULTY_MAX);

    let comfortable = (5.5 - 2.0 * personal).clamp(DIFFICULTY_MIN, DIFFICULTY_MAX);
    let personalized_score = (100.0 - (predicted - comfortable).abs() * 10.0).clamp(0.0, 100.0);

    let now = Utc::now();
    let ttl = ChronoDuration::from_std(config.prediction_ttl)
        .unwrap_or_else(|_| ChronoDuration::seconds(300));

    DifficultyPrediction {
        user_id: profile.user_id.clone(),
        item_id: baseline.item_id.clone(),
        predicted_difficulty: predicted,
        personalized_score,
        computed_at: now,
        expires_at: now + ttl,
    }
}

fn global_adjustment(success_rate: f64, band: (f64, f64)) -> f64 {
    if success_rate < band.0 {
        ((band.0 - success_rate) * GLOBAL_GAIN).min(GLOBAL_BOUND)
    } else if success_rate > band.1 {
        (-(success_rate - band.1) * GLOBAL_GAIN).max(-GLOBAL_BOUND)
    } else {
        0.0
    }
}

fn personal_adjustment(profile: &ForgettingCurveProfile, subject: Option<&str>) -> f64 {
    let subject_shift = 0.5 * profile.subject_adjustment(subject);
    let retention_shift = 5.0 * (0.9 - profile.retention_factor);
    (subject_shift + retention_shift).clamp(-PERSONAL_BOUND, PERSONAL_BOUND)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> ForgettingCurveProfile {
        ForgettingCurveProfile::new("u1")
    }

    fn baseline(difficulty: f64, success_rate: f64) -> ItemBaseline {
        ItemBaseline {
            base_difficulty: difficulty,
            success_rate,
            ..ItemBaseline::new("i1")
        }
    }

    #[test]
    fn in_band_item_keeps_baseline() {
        let config = EngineConfig::default();
        let prediction = compute_prediction(&config, &profile(), &baseline(5.0, 0.7), None);
        assert!((prediction.predicted_difficulty - 5.0).abs() < 1e-9);
    }

    #[test]
    fn failing_item_reads_harder() {
        let config = EngineConfig::default();
        let prediction = compute_prediction(&config, &profile(), &baseline(5.0, 0.3), None);
        assert!(prediction.predicted_difficulty > 5.0);
    }

    #[test]
    fn aced_item_reads_easier() {
        let config = EngineConfig::default();
        let prediction = compute_prediction(&config, &profile(), &baseline(5.0, 0.95), None);
        assert!(prediction.predicted_difficulty < 5.0);
    }

    #[test]
    fn weak_retention_shifts_harder() {
        let config = EngineConfig::default();
        let mut weak = profile();
        weak.retention_factor = 0.6;
        let for_weak = compute_prediction(&config, &weak, &baseline(5.0, 0.7), None);
        let for_default = compute_prediction(&config, &profile(), &baseline(5.0, 0.7), None);
        assert!(for_weak.predicted_difficulty > for_default.predicted_difficulty);
    }

    #[test]
    fn prediction_stays_in_range() {
        let config = EngineConfig::default();
        let mut weak = profile();
        weak.retention_factor = 0.5;
        let prediction = compute_prediction(&config, &weak, &baseline(10.0, 0.0), None);
        assert!(prediction.predicted_difficulty <= 10.0);

        let prediction = compute_prediction(&config, &profile(), &baseline(1.0, 1.0), None);
        assert!(prediction.predicted_difficulty >= 1.0);
    }

    #[test]
    fn deterministic_for_identical_snapshots() {
        let config = EngineConfig::default();
        let p = profile();
        let b = baseline(6.0, 0.5);
        let first = compute_prediction(&config, &p, &b, None);
        let second = compute_prediction(&config, &p, &b, None);
        assert_eq!(first.predicted_difficulty, second.predicted_difficulty);
        assert_eq!(first.personalized_score, second.personalized_score);
    }
}
