use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::types::{QueueStatus, Urgency};

const TIER_COUNT: usize = 3;

/// A dequeued item under an active lease. The holder must `ack` or
/// `release`; a crashed holder is recovered by lease expiry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeasedItem {
    pub item_id: String,
    pub urgency: Urgency,
    pub added_at: DateTime<Utc>,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
struct ItemState {
    urgency: Urgency,
    added_at: DateTime<Utc>,
    attempts: u32,
    lease_expires_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct QueueInner {
    // Index 0 = High. Leased items sit in `items` only, never in a tier.
    tiers: [VecDeque<String>; TIER_COUNT],
    items: HashMap<String, ItemState>,
}

impl QueueInner {
    fn tier_index(urgency: Urgency) -> usize {
        match urgency {
            Urgency::High => 0,
            Urgency::Medium => 1,
            Urgency::Low => 2,
        }
    }

    fn remove_from_tier(&mut self, urgency: Urgency, item_id: &str) {
        let tier = &mut self.tiers[Self::tier_index(urgency)];
        if let Some(pos) = tier.iter().position(|id| id == item_id) {
            tier.remove(pos);
        }
    }
}

/// Items flagged for difficulty recalibration, three explicit FIFO tiers
/// plus a per-item lease index. Fast tier only: contents do not survive a
/// restart; the aggregation signal regenerates them.
pub struct AdjustmentQueue {
    inner: Mutex<QueueInner>,
    lease_timeout: Duration,
    max_attempts: u32,
}

impl AdjustmentQueue {
    pub fn new(lease_timeout: Duration, max_attempts: u32) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            lease_timeout,
            max_attempts,
        }
    }

    /// Idempotent per item. Re-adding a pending item can only raise its
    /// urgency; a lower urgency is a no-op, and leased items are never
    /// moved mid-flight.
    pub fn enqueue(&self, item_id: &str, urgency: Urgency) -> bool {
        let mut inner = self.inner.lock();
        match inner.items.get(item_id).cloned() {
            Some(state) if state.lease_expires_at.is_some() => false,
            Some(state) if urgency > state.urgency => {
                inner.remove_from_tier(state.urgency, item_id);
                inner.tiers[QueueInner::tier_index(urgency)].push_back(item_id.to_string());
                if let Some(entry) = inner.items.get_mut(item_id) {
                    entry.urgency = urgency;
                }
                debug!(item_id, urgency = urgency.as_str(), "queue urgency raised");
                true
            }
            Some(_) => false,
            None => {
                inner.items.insert(
                    item_id.to_string(),
                    ItemState {
                        urgency,
                        added_at: Utc::now(),
                        attempts: 0,
                        lease_expires_at: None,
                    },
                );
                inner.tiers[QueueInner::tier_index(urgency)].push_back(item_id.to_string());
                debug!(item_id, urgency = urgency.as_str(), "item queued for adjustment");
                true
            }
        }
    }

    /// Scan High -> Medium -> Low and lease the first pending item. At most
    /// one lease per item exists at any time.
    pub fn dequeue_next(&self) -> Option<LeasedItem> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        self.recover_expired_leases(&mut inner, now);

        for tier_index in 0..TIER_COUNT {
            while let Some(item_id) = inner.tiers[tier_index].pop_front() {
                // Ids can go stale when an item was dropped or moved tiers.
                let Some(state) = inner.items.get_mut(&item_id) else {
                    continue;
                };
                if QueueInner::tier_index(state.urgency) != tier_index
                    || state.lease_expires_at.is_some()
                {
                    continue;
                }

                state.lease_expires_at = Some(now + to_chrono(self.lease_timeout));
                return Some(LeasedItem {
                    item_id: item_id.clone(),
                    urgency: state.urgency,
                    added_at: state.added_at,
                    attempts: state.attempts,
                });
            }
        }
        None
    }

    /// Processing succeeded; the item leaves the queue.
    pub fn ack(&self, item_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.items.remove(item_id) {
            inner.remove_from_tier(state.urgency, item_id);
        }
    }

    /// Processing failed; the item returns to pending with attempts
    /// incremented, or is dropped once the retry budget is spent. Returns
    /// whether the item is still queued.
    pub fn release(&self, item_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(state) = inner.items.get_mut(item_id) else {
            return false;
        };
        state.lease_expires_at = None;
        state.attempts += 1;

        if state.attempts >= self.max_attempts {
            let urgency = state.urgency;
            inner.items.remove(item_id);
            inner.remove_from_tier(urgency, item_id);
            warn!(item_id, attempts = self.max_attempts, "adjustment dropped after retries");
            return false;
        }

        let urgency = state.urgency;
        inner.tiers[QueueInner::tier_index(urgency)].push_back(item_id.to_string());
        true
    }

    pub fn status(&self) -> QueueStatus {
        let inner = self.inner.lock();
        QueueStatus {
            high_count: inner.tiers[0].len(),
            medium_count: inner.tiers[1].len(),
            low_count: inner.tiers[2].len(),
        }
    }

    pub fn contains(&self, item_id: &str) -> bool {
        self.inner.lock().items.contains_key(item_id)
    }

    pub fn pending_urgency(&self, item_id: &str) -> Option<Urgency> {
        self.inner.lock().items.get(item_id).map(|s| s.urgency)
    }

    fn recover_expired_leases(&self, inner: &mut QueueInner, now: DateTime<Utc>) {
        let expired: Vec<String> = inner
            .items
            .iter()
            .filter(|(_, state)| state.lease_expires_at.map(|at| now >= at).unwrap_or(false))
            .map(|(id, _)| id.clone())
            .collect();

        for item_id in expired {
            let Some(state) = inner.items.get_mut(&item_id) else {
                continue;
            };
            state.lease_expires_at = None;
            state.attempts += 1;
            if state.attempts >= self.max_attempts {
                let urgency = state.urgency;
                inner.items.remove(&item_id);
                inner.remove_from_tier(urgency, &item_id);
                warn!(item_id = %item_id, "adjustment dropped after expired leases");
            } else {
                let urgency = state.urgency;
                inner.tiers[QueueInner::tier_index(urgency)].push_back(item_id.clone());
                debug!(item_id = %item_id, "expired lease recovered");
            }
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::seconds(30))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> AdjustmentQueue {
        AdjustmentQueue::new(Duration::from_secs(30), 3)
    }

    #[test]
    fn enqueue_is_idempotent() {
        let queue = queue();
        assert!(queue.enqueue("x", Urgency::Medium));
        assert!(!queue.enqueue("x", Urgency::Medium));
        assert_eq!(queue.status().medium_count, 1);
    }

    #[test]
    fn reenqueue_raises_never_lowers() {
        let queue = queue();
        queue.enqueue("x", Urgency::Medium);
        assert!(queue.enqueue("x", Urgency::High));
        assert_eq!(queue.pending_urgency("x"), Some(Urgency::High));
        assert_eq!(queue.status().medium_count, 0);
        assert_eq!(queue.status().high_count, 1);

        assert!(!queue.enqueue("x", Urgency::Low));
        assert_eq!(queue.pending_urgency("x"), Some(Urgency::High));
    }

    #[test]
    fn dequeue_scans_high_to_low() {
        let queue = queue();
        queue.enqueue("low", Urgency::Low);
        queue.enqueue("high", Urgency::High);
        queue.enqueue("medium", Urgency::Medium);

        assert_eq!(queue.dequeue_next().unwrap().item_id, "high");
        assert_eq!(queue.dequeue_next().unwrap().item_id, "medium");
        assert_eq!(queue.dequeue_next().unwrap().item_id, "low");
        assert!(queue.dequeue_next().is_none());
    }

    #[test]
    fn leased_item_is_not_dequeued_twice() {
        let queue = queue();
        queue.enqueue("x", Urgency::High);
        let lease = queue.dequeue_next().unwrap();
        assert_eq!(lease.item_id, "x");
        assert!(queue.dequeue_next().is_none());

        queue.ack("x");
        assert!(!queue.contains("x"));
    }

    #[test]
    fn release_requeues_with_attempt() {
        let queue = queue();
        queue.enqueue("x", Urgency::Medium);
        queue.dequeue_next().unwrap();
        assert!(queue.release("x"));

        let lease = queue.dequeue_next().unwrap();
        assert_eq!(lease.attempts, 1);
    }

    #[test]
    fn retries_are_bounded() {
        let queue = queue();
        queue.enqueue("x", Urgency::High);
        queue.dequeue_next().unwrap();
        assert!(queue.release("x"));
        queue.dequeue_next().unwrap();
        assert!(queue.release("x"));
        queue.dequeue_next().unwrap();
        assert!(!queue.release("x"));
        assert!(!queue.contains("x"));
    }

    #[test]
    fn expired_lease_returns_to_pending() {
        let queue = AdjustmentQueue::new(Duration::from_millis(0), 3);
        queue.enqueue("x", Urgency::High);
        queue.dequeue_next().unwrap();

        // Zero lease timeout: the next scan recovers it immediately.
        let lease = queue.dequeue_next().unwrap();
        assert_eq!(lease.item_id, "x");
        assert_eq!(lease.attempts, 1);
    }

    #[test]
    fn status_counts_pending_only() {
        let queue = queue();
        queue.enqueue("a", Urgency::High);
        queue.enqueue("b", Urgency::High);
        queue.dequeue_next().unwrap();

        let status = queue.status();
        assert_eq!(status.high_count, 1);
        assert_eq!(status.medium_count, 0);
    }
}
