//! Session-history collaborator.
//!
//! Assistant CLI records are persisted by an external component after the
//! manager has already forwarded them live. Appends are fire-and-forget:
//! a history failure must never block or fail live delivery.

use async_trait::async_trait;

/// Narrow interface to the session-history sink.
#[async_trait]
pub trait SessionHistory: Send + Sync {
    async fn append(&self, session_id: &str, record: &serde_json::Value);
}

/// Discards all records. Default when no history sink is wired in.
pub struct NullHistory;

#[async_trait]
impl SessionHistory for NullHistory {
    async fn append(&self, _session_id: &str, _record: &serde_json::Value) {}
}
