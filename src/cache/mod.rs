pub mod keys;
pub mod tiered;

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;

const TTL_JITTER_RATIO: f64 = 0.1;

/// Key-value backend behind every cached read path.
///
/// Failures are absorbed here: reads miss and callers fall back to the
/// durable source. Absence never changes correctness.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get_raw(&self, key: &str) -> Option<String>;
    /// Returns whether the write reached the backend. Most callers ignore
    /// this; the session registry must not.
    async fn set_raw(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool;
    async fn delete(&self, key: &str);
    async fn exists(&self, key: &str) -> bool;
    async fn expire(&self, key: &str, ttl: Duration);
    async fn sadd(&self, key: &str, member: &str, ttl: Option<Duration>) -> bool;
    async fn smembers(&self, key: &str) -> Vec<String>;
    async fn srem(&self, key: &str, member: &str);
    async fn ping(&self) -> bool;
}

pub async fn get_json<T>(backend: &dyn CacheBackend, key: &str) -> Option<T>
where
    T: DeserializeOwned,
{
    let payload = backend.get_raw(key).await?;
    serde_json::from_str(&payload).ok()
}

pub async fn set_json<T>(backend: &dyn CacheBackend, key: &str, value: &T, ttl: Option<Duration>) -> bool
where
    T: Serialize,
{
    let payload = match serde_json::to_string(value) {
        Ok(p) => p,
        Err(_) => return false,
    };
    backend.set_raw(key, &payload, ttl).await
}

pub fn apply_ttl_jitter(ttl: Duration) -> Duration {
    let base_ms = ttl.as_millis() as f64;
    let mut rng = rand::rng();
    let factor = rng.random_range(1.0 - TTL_JITTER_RATIO..=1.0 + TTL_JITTER_RATIO);
    let jittered_ms = (base_ms * factor).round().max(1.0);
    Duration::from_millis(jittered_ms as u64)
}

// ========== Redis backend ==========

#[derive(Clone)]
pub struct RedisBackend {
    connection: MultiplexedConnection,
}

impl RedisBackend {
    pub fn new(connection: MultiplexedConnection) -> Self {
        Self { connection }
    }

    pub async fn connect(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let connection = client.get_multiplexed_tokio_connection().await?;
        Ok(Self::new(connection))
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get_raw(&self, key: &str) -> Option<String> {
        let mut conn = self.connection.clone();
        conn.get(key).await.ok()?
    }

    async fn set_raw(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool {
        let mut conn = self.connection.clone();
        match ttl {
            Some(ttl) if !ttl.is_zero() => {
                let ttl_secs = ttl.as_secs().max(1);
                let result: Result<(), _> = conn.set_ex(key, value, ttl_secs).await;
                result.is_ok()
            }
            _ => {
                let result: Result<(), _> = conn.set(key, value).await;
                result.is_ok()
            }
        }
    }

    async fn delete(&self, key: &str) {
        let mut conn = self.connection.clone();
        let _: Result<u64, _> = conn.del(key).await;
    }

    async fn exists(&self, key: &str) -> bool {
        let mut conn = self.connection.clone();
        conn.exists(key).await.unwrap_or(false)
    }

    async fn expire(&self, key: &str, ttl: Duration) {
        let mut conn = self.connection.clone();
        let _: Result<bool, _> = conn.expire(key, ttl.as_secs().max(1) as i64).await;
    }

    async fn sadd(&self, key: &str, member: &str, ttl: Option<Duration>) -> bool {
        let mut conn = self.connection.clone();
        let added: Result<u64, _> = conn.sadd(key, member).await;
        if added.is_ok() {
            if let Some(ttl) = ttl {
                let _: Result<bool, _> = conn.expire(key, ttl.as_secs().max(1) as i64).await;
            }
        }
        added.is_ok()
    }

    async fn smembers(&self, key: &str) -> Vec<String> {
        let mut conn = self.connection.clone();
        conn.smembers(key).await.unwrap_or_default()
    }

    async fn srem(&self, key: &str, member: &str) {
        let mut conn = self.connection.clone();
        let _: Result<u64, _> = conn.srem(key, member).await;
    }

    async fn ping(&self) -> bool {
        let mut conn = self.connection.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok()
    }
}

// ========== In-process backend ==========

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
struct MemorySet {
    members: HashSet<String>,
    expires_at: Option<Instant>,
}

/// Process-local backend with lazy TTL eviction. Serves tests and the
/// degraded mode where Redis is unreachable.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    sets: Mutex<HashMap<String, MemorySet>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0usize;
        {
            let mut entries = self.entries.lock();
            let before = entries.len();
            entries.retain(|_, entry| !entry.is_expired(now));
            removed += before - entries.len();
        }
        {
            let mut sets = self.sets.lock();
            let before = sets.len();
            sets.retain(|_, set| set.expires_at.map(|at| now < at).unwrap_or(true));
            removed += before - sets.len();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get_raw(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    async fn set_raw(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool {
        let entry = MemoryEntry {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries.lock().insert(key.to_string(), entry);
        true
    }

    async fn delete(&self, key: &str) {
        self.entries.lock().remove(key);
        self.sets.lock().remove(key);
    }

    async fn exists(&self, key: &str) -> bool {
        self.get_raw(key).await.is_some()
    }

    async fn expire(&self, key: &str, ttl: Duration) {
        let deadline = Instant::now() + ttl;
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.expires_at = Some(deadline);
        }
        if let Some(set) = self.sets.lock().get_mut(key) {
            set.expires_at = Some(deadline);
        }
    }

    async fn sadd(&self, key: &str, member: &str, ttl: Option<Duration>) -> bool {
        let mut sets = self.sets.lock();
        let set = sets.entry(key.to_string()).or_insert_with(|| MemorySet {
            members: HashSet::new(),
            expires_at: None,
        });
        set.members.insert(member.to_string());
        if let Some(ttl) = ttl {
            set.expires_at = Some(Instant::now() + ttl);
        }
        true
    }

    async fn smembers(&self, key: &str) -> Vec<String> {
        let now = Instant::now();
        let mut sets = self.sets.lock();
        match sets.get(key) {
            Some(set) if set.expires_at.map(|at| now >= at).unwrap_or(false) => {
                sets.remove(key);
                Vec::new()
            }
            Some(set) => set.members.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    async fn srem(&self, key: &str, member: &str) {
        if let Some(set) = self.sets.lock().get_mut(key) {
            set.members.remove(member);
        }
    }

    async fn ping(&self) -> bool {
        true
    }
}
