//! Cache key namespace. Every key the engine writes is minted here.

use crate::types::Urgency;

pub fn aggregation_key(item_id: &str) -> String {
    format!("aggregation:{}", item_id)
}

pub fn queue_marker_key(urgency: Urgency, item_id: &str) -> String {
    format!("queue:{}:{}", urgency.as_str(), item_id)
}

pub fn prediction_key(user_id: &str, item_id: &str) -> String {
    format!("prediction:{}:{}", user_id, item_id)
}

pub fn profile_key(user_id: &str) -> String {
    format!("profile:{}", user_id)
}

pub fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

pub fn user_sessions_key(user_id: &str) -> String {
    format!("user:{}:sessions", user_id)
}

pub fn blacklist_key(token_hash: &str) -> String {
    format!("blacklist:{}", token_hash)
}

pub fn tag_key(tag: &str) -> String {
    format!("tag:{}", tag)
}

pub fn item_tag(item_id: &str) -> String {
    format!("item:{}", item_id)
}

pub fn user_tag(user_id: &str) -> String {
    format!("user:{}", user_id)
}
