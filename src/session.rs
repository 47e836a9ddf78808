use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::cache::{self, keys, CacheBackend};
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub is_active: bool,
    pub refresh_token_hash: Option<String>,
}

pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Active-session and revoked-token bookkeeping over the cache backend.
///
/// Reads fail open: an unreachable backend answers "not blacklisted" rather
/// than silently blocking every request. This is an explicit degraded mode.
/// Revocation writes are different: a no-op revocation is not acceptable,
/// so they surface `DegradedDependency` for the caller to retry.
pub struct SessionRegistry {
    backend: Arc<dyn CacheBackend>,
    session_ttl: Duration,
}

impl SessionRegistry {
    pub fn new(backend: Arc<dyn CacheBackend>, session_ttl: Duration) -> Self {
        Self {
            backend,
            session_ttl,
        }
    }

    pub async fn register_session(
        &self,
        user_id: &str,
        refresh_token: Option<&str>,
    ) -> EngineResult<Session> {
        let now = Utc::now();
        let session = Session {
            session_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            created_at: now,
            last_activity: now,
            is_active: true,
            refresh_token_hash: refresh_token.map(hash_token),
        };

        let written = cache::set_json(
            &*self.backend,
            &keys::session_key(&session.session_id),
            &session,
            Some(self.session_ttl),
        )
        .await;
        if !written {
            return Err(EngineError::DegradedDependency(
                "session registry unreachable".to_string(),
            ));
        }

        self.backend
            .sadd(
                &keys::user_sessions_key(user_id),
                &session.session_id,
                Some(self.session_ttl),
            )
            .await;

        debug!(user_id, session_id = %session.session_id, "session registered");
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> Option<Session> {
        cache::get_json(&*self.backend, &keys::session_key(session_id)).await
    }

    /// Sliding-window activity refresh.
    pub async fn touch_session(&self, session_id: &str) -> EngineResult<()> {
        let key = keys::session_key(session_id);
        let mut session: Session = cache::get_json(&*self.backend, &key)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))?;

        session.last_activity = Utc::now();
        cache::set_json(&*self.backend, &key, &session, Some(self.session_ttl)).await;
        // Keep the user's session index alive as long as any session is.
        self.backend
            .expire(&keys::user_sessions_key(&session.user_id), self.session_ttl)
            .await;
        Ok(())
    }

    pub async fn end_session(&self, session_id: &str) {
        if let Some(session) = self.get_session(session_id).await {
            self.backend
                .srem(&keys::user_sessions_key(&session.user_id), session_id)
                .await;
        }
        self.backend.delete(&keys::session_key(session_id)).await;
    }

    /// Idempotent. TTL equals the token's remaining validity; a token that
    /// is already past its expiry needs no entry at all.
    pub async fn blacklist_token(
        &self,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> EngineResult<()> {
        let remaining = (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if remaining.is_zero() {
            return Ok(());
        }
        self.blacklist_hash(&hash_token(token), remaining).await
    }

    pub async fn is_token_blacklisted(&self, token: &str) -> bool {
        self.backend
            .exists(&keys::blacklist_key(&hash_token(token)))
            .await
    }

    /// Cascade: end every session for the user and blacklist each
    /// associated refresh token for the full session TTL (an upper bound on
    /// its remaining validity).
    pub async fn invalidate_user(&self, user_id: &str) -> EngineResult<usize> {
        let sessions_key = keys::user_sessions_key(user_id);
        let session_ids = self.backend.smembers(&sessions_key).await;

        let mut ended = 0usize;
        let mut degraded = false;
        for session_id in &session_ids {
            if let Some(session) = self.get_session(session_id).await {
                if let Some(hash) = &session.refresh_token_hash {
                    if self.blacklist_hash(hash, self.session_ttl).await.is_err() {
                        degraded = true;
                    }
                }
            }
            self.backend.delete(&keys::session_key(session_id)).await;
            ended += 1;
        }
        self.backend.delete(&sessions_key).await;

        if degraded {
            return Err(EngineError::DegradedDependency(format!(
                "token blacklist unreachable while invalidating user {user_id}"
            )));
        }

        debug!(user_id, ended, "user sessions invalidated");
        Ok(ended)
    }

    async fn blacklist_hash(&self, token_hash: &str, ttl: Duration) -> EngineResult<()> {
        let written = self
            .backend
            .set_raw(&keys::blacklist_key(token_hash), "1", Some(ttl))
            .await;
        if !written {
            warn!("token blacklist write failed");
            return Err(EngineError::DegradedDependency(
                "token blacklist unreachable".to_string(),
            ));
        }
        Ok(())
    }
}
