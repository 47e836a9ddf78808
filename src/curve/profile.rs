use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const DEFAULT_RETENTION: f64 = 0.9;
const RETENTION_ALPHA: f64 = 0.05;
const RETENTION_MIN: f64 = 0.5;
const RETENTION_MAX: f64 = 0.99;

const ADJUSTMENT_ON_FAILURE: f64 = 0.15;
const ADJUSTMENT_ON_SUCCESS: f64 = -0.05;
const ADJUSTMENT_BOUND: f64 = 2.0;

/// Per-user memory model, mutated incrementally after each completion.
///
/// `difficulty_adjustments` is keyed by subject; positive values mean the
/// user finds that subject harder than the item baselines suggest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForgettingCurveProfile {
    pub user_id: String,
    pub retention_factor: f64,
    pub difficulty_adjustments: HashMap<String, f64>,
    pub total_reviews: i64,
    pub total_successes: i64,
    pub total_failures: i64,
    pub consecutive_failures: i32,
    pub updated_at: DateTime<Utc>,
}

impl ForgettingCurveProfile {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            retention_factor: DEFAULT_RETENTION,
            difficulty_adjustments: HashMap::new(),
            total_reviews: 0,
            total_successes: 0,
            total_failures: 0,
            consecutive_failures: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn subject_adjustment(&self, subject: Option<&str>) -> f64 {
        subject
            .and_then(|s| self.difficulty_adjustments.get(s))
            .copied()
            .unwrap_or(0.0)
    }

    /// Fold one review outcome into the profile and report what changed.
    pub fn apply_review(&mut self, is_success: bool, subject: Option<&str>) -> ProfileDelta {
        let retention_before = self.retention_factor;

        // EWMA toward 1.0 on success, toward 0.0 on failure.
        let target = if is_success { 1.0 } else { 0.0 };
        self.retention_factor = (self.retention_factor
            + RETENTION_ALPHA * (target - self.retention_factor))
            .clamp(RETENTION_MIN, RETENTION_MAX);

        self.total_reviews += 1;
        if is_success {
            self.total_successes += 1;
            self.consecutive_failures = 0;
        } else {
            self.total_failures += 1;
            self.consecutive_failures += 1;
        }

        let subject_adjustment_after = subject.map(|s| {
            let step = if is_success {
                ADJUSTMENT_ON_SUCCESS
            } else {
                ADJUSTMENT_ON_FAILURE
            };
            let entry = self.difficulty_adjustments.entry(s.to_string()).or_insert(0.0);
            *entry = (*entry + step).clamp(-ADJUSTMENT_BOUND, ADJUSTMENT_BOUND);
            *entry
        });

        self.updated_at = Utc::now();

        ProfileDelta {
            is_success,
            retention_factor_before: retention_before,
            retention_factor_after: self.retention_factor,
            subject: subject.map(|s| s.to_string()),
            subject_adjustment_after,
            consecutive_failures: self.consecutive_failures,
        }
    }
}

/// What one completion changed in the profile; returned alongside the next
/// schedule so callers can surface it without re-reading the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileDelta {
    pub is_success: bool,
    pub retention_factor_before: f64,
    pub retention_factor_after: f64,
    pub subject: Option<String>,
    pub subject_adjustment_after: Option<f64>,
    pub consecutive_failures: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_start_at_retention_09() {
        let profile = ForgettingCurveProfile::new("u1");
        assert!((profile.retention_factor - 0.9).abs() < f64::EPSILON);
        assert_eq!(profile.total_reviews, 0);
    }

    #[test]
    fn success_raises_retention_failure_lowers() {
        let mut profile = ForgettingCurveProfile::new("u1");
        let delta = profile.apply_review(true, None);
        assert!(delta.retention_factor_after > delta.retention_factor_before);

        let delta = profile.apply_review(false, None);
        assert!(delta.retention_factor_after < delta.retention_factor_before);
    }

    #[test]
    fn retention_stays_clamped() {
        let mut profile = ForgettingCurveProfile::new("u1");
        for _ in 0..200 {
            profile.apply_review(false, None);
        }
        assert!(profile.retention_factor >= RETENTION_MIN);

        for _ in 0..500 {
            profile.apply_review(true, None);
        }
        assert!(profile.retention_factor <= RETENTION_MAX);
    }

    #[test]
    fn subject_adjustment_tracks_failures() {
        let mut profile = ForgettingCurveProfile::new("u1");
        profile.apply_review(false, Some("algebra"));
        profile.apply_review(false, Some("algebra"));
        let adj = profile.subject_adjustment(Some("algebra"));
        assert!((adj - 0.3).abs() < 1e-9);
        assert_eq!(profile.subject_adjustment(Some("geometry")), 0.0);
    }

    #[test]
    fn consecutive_failures_reset_on_success() {
        let mut profile = ForgettingCurveProfile::new("u1");
        profile.apply_review(false, None);
        profile.apply_review(false, None);
        assert_eq!(profile.consecutive_failures, 2);
        profile.apply_review(true, None);
        assert_eq!(profile.consecutive_failures, 0);
    }
}
