use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::config::{EngineConfig, FailurePolicy};
use crate::types::{CompletionInput, Level};

/// The computed outcome of one review completion, before anything is
/// written. Pure: same inputs, same plan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransitionPlan {
    pub is_success: bool,
    pub new_level: Level,
    pub due_at: DateTime<Utc>,
}

/// A completion succeeds on Good/Easy feedback, or when a graded score
/// reaches the configured share of the maximum.
pub fn classify_outcome(input: &CompletionInput, score_success_ratio: f64) -> bool {
    if input.feedback.is_success() {
        return true;
    }
    match (input.score, input.max_score) {
        (Some(score), Some(max)) if max > 0.0 => score >= max * score_success_ratio,
        _ => false,
    }
}

pub fn plan_transition(
    config: &EngineConfig,
    current_level: Level,
    input: &CompletionInput,
    now: DateTime<Utc>,
) -> TransitionPlan {
    let is_success = classify_outcome(input, config.score_success_ratio);

    let new_level = if is_success {
        current_level.advance()
    } else {
        match config.failure_policy {
            FailurePolicy::Decrement => current_level.regress(),
            FailurePolicy::Reset => Level::MIN,
        }
    };

    let interval = config.interval_for(new_level);
    let due_at = now + ChronoDuration::from_std(interval).unwrap_or(ChronoDuration::zero());

    TransitionPlan {
        is_success,
        new_level,
        due_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FeedbackKind;

    fn input(feedback: FeedbackKind) -> CompletionInput {
        CompletionInput {
            feedback,
            response_time_ms: 1200,
            score: None,
            max_score: None,
            confidence_level: None,
        }
    }

    #[test]
    fn good_advances_one_level() {
        let config = EngineConfig::default();
        let now = Utc::now();
        let plan = plan_transition(&config, Level::new(3).unwrap(), &input(FeedbackKind::Good), now);
        assert!(plan.is_success);
        assert_eq!(plan.new_level.get(), 4);
        let expected = now + ChronoDuration::from_std(config.interval_for(plan.new_level)).unwrap();
        assert_eq!(plan.due_at, expected);
    }

    #[test]
    fn success_caps_at_max_level() {
        let config = EngineConfig::default();
        let plan = plan_transition(&config, Level::MAX, &input(FeedbackKind::Easy), Utc::now());
        assert_eq!(plan.new_level, Level::MAX);
    }

    #[test]
    fn failure_decrements_with_floor() {
        let config = EngineConfig::default();
        let plan = plan_transition(&config, Level::new(5).unwrap(), &input(FeedbackKind::Retry), Utc::now());
        assert!(!plan.is_success);
        assert_eq!(plan.new_level.get(), 4);

        let plan = plan_transition(&config, Level::MIN, &input(FeedbackKind::Retry), Utc::now());
        assert_eq!(plan.new_level, Level::MIN);
    }

    #[test]
    fn reset_policy_drops_to_first_level() {
        let config = EngineConfig {
            failure_policy: FailurePolicy::Reset,
            ..EngineConfig::default()
        };
        let plan = plan_transition(&config, Level::new(7).unwrap(), &input(FeedbackKind::Hard), Utc::now());
        assert_eq!(plan.new_level, Level::MIN);
    }

    #[test]
    fn graded_score_can_rescue_hard_feedback() {
        let mut graded = input(FeedbackKind::Hard);
        graded.score = Some(80.0);
        graded.max_score = Some(100.0);
        assert!(classify_outcome(&graded, 0.7));

        graded.score = Some(60.0);
        assert!(!classify_outcome(&graded, 0.7));
    }
}
