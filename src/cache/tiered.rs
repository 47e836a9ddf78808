use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::{apply_ttl_jitter, keys, CacheBackend};

pub const LAYER_COUNT: usize = 4;

/// Access-frequency tier. L1 is hottest/shortest-lived; TTLs increase
/// toward L4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLayer {
    L1,
    L2,
    L3,
    L4,
}

impl CacheLayer {
    pub const ALL: [CacheLayer; LAYER_COUNT] = [Self::L1, Self::L2, Self::L3, Self::L4];

    fn index(&self) -> usize {
        match self {
            Self::L1 => 0,
            Self::L2 => 1,
            Self::L3 => 2,
            Self::L4 => 3,
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            Self::L1 => "l1",
            Self::L2 => "l2",
            Self::L3 => "l3",
            Self::L4 => "l4",
        }
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix(), key)
    }
}

/// Four concentric cache layers over a single backend. A hit below L1 is
/// promoted into L1 so repeat reads stay on the fast path. Entries are pure
/// latency optimizations: every caller has a durable fallback for a miss.
#[derive(Clone)]
pub struct TieredCache {
    backend: Arc<dyn CacheBackend>,
    ttls: [Duration; LAYER_COUNT],
}

impl TieredCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self::with_ttls(
            backend,
            [
                Duration::from_secs(5 * 60),
                Duration::from_secs(30 * 60),
                Duration::from_secs(2 * 60 * 60),
                Duration::from_secs(24 * 60 * 60),
            ],
        )
    }

    pub fn with_ttls(backend: Arc<dyn CacheBackend>, ttls: [Duration; LAYER_COUNT]) -> Self {
        debug_assert!(ttls.windows(2).all(|w| w[0] < w[1]));
        Self { backend, ttls }
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn layer_ttl(&self, layer: CacheLayer) -> Duration {
        self.ttls[layer.index()]
    }

    /// Probe L1..L4 in order; promote a lower-layer hit into L1.
    pub async fn get<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned,
    {
        for layer in CacheLayer::ALL {
            let storage_key = layer.storage_key(key);
            if let Some(payload) = self.backend.get_raw(&storage_key).await {
                if layer != CacheLayer::L1 {
                    let ttl = apply_ttl_jitter(self.layer_ttl(CacheLayer::L1));
                    self.backend
                        .set_raw(&CacheLayer::L1.storage_key(key), &payload, Some(ttl))
                        .await;
                    debug!(key, from = layer.prefix(), "cache promotion");
                }
                return serde_json::from_str(&payload).ok();
            }
        }
        None
    }

    /// Write into exactly one layer.
    pub async fn set<T>(&self, key: &str, value: &T, layer: CacheLayer)
    where
        T: Serialize,
    {
        self.set_with_tags(key, value, layer, &[]).await;
    }

    /// Write into one layer and index the stored key under each tag, so a
    /// later `invalidate_by_tags` can bulk-expire related entries.
    pub async fn set_with_tags<T>(&self, key: &str, value: &T, layer: CacheLayer, tags: &[String])
    where
        T: Serialize,
    {
        let payload = match serde_json::to_string(value) {
            Ok(p) => p,
            Err(_) => return,
        };
        let storage_key = layer.storage_key(key);
        let ttl = apply_ttl_jitter(self.layer_ttl(layer));
        self.backend.set_raw(&storage_key, &payload, Some(ttl)).await;

        // Tag sets outlive any member entry.
        let tag_ttl = self.ttls[LAYER_COUNT - 1];
        for tag in tags {
            self.backend
                .sadd(&keys::tag_key(tag), &storage_key, Some(tag_ttl))
                .await;
        }
    }

    /// Remove a key from every layer.
    pub async fn delete(&self, key: &str) {
        for layer in CacheLayer::ALL {
            self.backend.delete(&layer.storage_key(key)).await;
        }
    }

    pub async fn invalidate_by_tags(&self, tags: &[String]) -> usize {
        let mut invalidated = 0usize;
        for tag in tags {
            let tag_key = keys::tag_key(tag);
            for member in self.backend.smembers(&tag_key).await {
                self.backend.delete(&member).await;
                invalidated += 1;
            }
            self.backend.delete(&tag_key).await;
        }
        if invalidated > 0 {
            debug!(count = invalidated, "cache entries invalidated by tag");
        }
        invalidated
    }
}
