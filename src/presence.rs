//! In-memory, TTL-bounded presence registry.
//!
//! Modeled as a plain service object passed by reference (`spec.md` §9
//! "Global mutable presence") — no process-global singleton. Lost on
//! restart by design; callers never surface presence failures to users.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Entries older than this are still reported, but marked `stale`.
pub const PRESENCE_TTL_SECS: i64 = 120;

#[derive(Debug, Clone)]
struct PresenceRecord {
    state: String,
    updated_at: DateTime<Utc>,
    details: Option<Value>,
}

/// Wire representation of one participant's presence in a thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceSnapshotEntry {
    pub id: String,
    pub state: String,
    pub updated_at: DateTime<Utc>,
    pub stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// `(thread_id, participant_id) -> presence record`, guarded by a single
/// mutex. O(#participants-in-thread) per operation.
#[derive(Default)]
pub struct PresenceRegistry {
    entries: Mutex<HashMap<(String, String), PresenceRecord>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a participant's presence. When `details` is `None`, any
    /// previously-stored details are preserved — a transient transition
    /// like `thinking -> listening` must not erase identity.
    pub async fn set(
        &self,
        thread: &str,
        participant: &str,
        state: &str,
        details: Option<Value>,
    ) {
        let mut entries = self.entries.lock().await;
        let key = (thread.to_string(), participant.to_string());
        let now = Utc::now();
        entries
            .entry(key)
            .and_modify(|record| {
                record.state = state.to_string();
                record.updated_at = now;
                if details.is_some() {
                    record.details = details.clone();
                }
            })
            .or_insert_with(|| PresenceRecord {
                state: state.to_string(),
                updated_at: now,
                details: details.clone(),
            });
    }

    /// Snapshot every participant's presence in `thread`, non-stale entries
    /// first, then sorted by id.
    pub async fn snapshot(&self, thread: &str) -> Vec<PresenceSnapshotEntry> {
        let entries = self.entries.lock().await;
        let now = Utc::now();
        let mut result: Vec<PresenceSnapshotEntry> = entries
            .iter()
            .filter(|((t, _), _)| t == thread)
            .map(|((_, id), record)| {
                let stale = (now - record.updated_at).num_seconds() > PRESENCE_TTL_SECS;
                PresenceSnapshotEntry {
                    id: id.clone(),
                    state: record.state.clone(),
                    updated_at: record.updated_at,
                    stale,
                    details: record.details.clone(),
                }
            })
            .collect();
        result.sort_by(|a, b| a.stale.cmp(&b.stale).then_with(|| a.id.cmp(&b.id)));
        result
    }
}
