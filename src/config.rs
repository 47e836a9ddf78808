use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::Level;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// What happens to the level on a failed review.
///
/// The observed platform behavior was ambiguous between the two, so the
/// policy is explicit and configurable rather than hard-coded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum FailurePolicy {
    /// Drop one level, floor at 1.
    #[default]
    Decrement,
    /// Drop all the way back to level 1.
    Reset,
}

impl FailurePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "decrement" => Some(Self::Decrement),
            "reset" => Some(Self::Reset),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Re-test interval per level, strictly increasing.
    pub intervals: [Duration; Level::COUNT],
    pub failure_policy: FailurePolicy,
    /// Graded completions count as success at `score >= ratio * max_score`.
    pub score_success_ratio: f64,
    /// Scheduled rows older than due + grace are swept to Overdue.
    pub overdue_grace: Duration,
    /// Aggregation window TTL.
    pub aggregation_window: Duration,
    pub negative_rate_threshold: f64,
    pub easy_rate_threshold: f64,
    pub high_urgency_threshold: f64,
    /// Item success-rate band that needs no recalibration.
    pub target_success_band: (f64, f64),
    /// Baseline difficulty step applied per recalibration pass.
    pub recalibration_step: f64,
    pub prediction_ttl: Duration,
    pub lease_timeout: Duration,
    pub max_queue_attempts: u32,
    pub session_ttl: Duration,
    /// Recently-active users refreshed after an item recalibration.
    pub batch_refresh_limit: usize,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(policy) = std::env::var("RECALL_FAILURE_POLICY")
            .ok()
            .and_then(|v| FailurePolicy::parse(&v))
        {
            config.failure_policy = policy;
        }

        if let Some(intervals) = std::env::var("RECALL_LEVEL_INTERVALS_MINUTES")
            .ok()
            .and_then(|v| parse_interval_table(&v))
        {
            config.intervals = intervals;
        }

        if let Some(secs) = env_u64("RECALL_OVERDUE_GRACE_SECS") {
            config.overdue_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("RECALL_AGGREGATION_WINDOW_SECS") {
            config.aggregation_window = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env_u64("RECALL_PREDICTION_TTL_SECS") {
            config.prediction_ttl = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env_u64("RECALL_LEASE_TIMEOUT_SECS") {
            config.lease_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(n) = env_u64("RECALL_MAX_QUEUE_ATTEMPTS") {
            config.max_queue_attempts = n.max(1) as u32;
        }
        if let Some(secs) = env_u64("RECALL_SESSION_TTL_SECS") {
            config.session_ttl = Duration::from_secs(secs.max(1));
        }
        if let Some(n) = env_u64("RECALL_BATCH_REFRESH_LIMIT") {
            config.batch_refresh_limit = n as usize;
        }

        config
    }

    pub fn interval_for(&self, level: Level) -> Duration {
        self.intervals[level.index()]
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            intervals: [
                Duration::from_secs(20 * MINUTE),
                Duration::from_secs(HOUR),
                Duration::from_secs(8 * HOUR),
                Duration::from_secs(DAY),
                Duration::from_secs(3 * DAY),
                Duration::from_secs(7 * DAY),
                Duration::from_secs(14 * DAY),
                Duration::from_secs(30 * DAY),
            ],
            failure_policy: FailurePolicy::Decrement,
            score_success_ratio: 0.7,
            overdue_grace: Duration::from_secs(10 * MINUTE),
            aggregation_window: Duration::from_secs(5 * MINUTE),
            negative_rate_threshold: 0.6,
            easy_rate_threshold: 0.7,
            high_urgency_threshold: 0.8,
            target_success_band: (0.6, 0.8),
            recalibration_step: 0.5,
            prediction_ttl: Duration::from_secs(5 * MINUTE),
            lease_timeout: Duration::from_secs(30),
            max_queue_attempts: 3,
            session_ttl: Duration::from_secs(30 * MINUTE),
            batch_refresh_limit: 50,
        }
    }
}

fn parse_interval_table(raw: &str) -> Option<[Duration; Level::COUNT]> {
    let minutes: Vec<u64> = raw
        .split(',')
        .map(|part| part.trim().parse::<u64>())
        .collect::<Result<_, _>>()
        .ok()?;

    if minutes.len() != Level::COUNT {
        tracing::warn!(
            count = minutes.len(),
            "interval table override must list exactly 8 entries, using defaults"
        );
        return None;
    }
    if minutes.windows(2).any(|w| w[0] >= w[1]) || minutes[0] == 0 {
        tracing::warn!("interval table override must be strictly increasing, using defaults");
        return None;
    }

    let mut table = [Duration::ZERO; Level::COUNT];
    for (slot, m) in table.iter_mut().zip(minutes) {
        *slot = Duration::from_secs(m * MINUTE);
    }
    Some(table)
}

fn env_u64(key: &str) -> Option<u64> {
    let value = std::env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<u64>().ok()
}
