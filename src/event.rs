//! Thread event data model and the pure control-state reducer.
//!
//! [`Event`] is the wire/disk representation of everything that happens in a
//! thread. [`ThreadState`] is derived, never persisted: it is the fold of
//! every qualifying `control` event seen so far, and is recomputed by
//! replaying the log (see [`crate::store`]) or in-scan by the coordinator
//! (see [`crate::coordinator`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// The reserved participant id that alone may author `control` events.
pub const USER_ID: &str = "user";

/// The addressing literal meaning "everyone in the thread".
pub const ALL: &str = "all";

/// One of the four event kinds recognized by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "message")]
    Message,
    #[serde(rename = "control")]
    Control,
    #[serde(rename = "thread.created")]
    ThreadCreated,
    #[serde(rename = "thread.renamed")]
    ThreadRenamed,
}

/// Recognized optional metadata carried on an event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventMeta {
    /// The id of the event this one is replying to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Free-form tags (e.g. `["coordinator", "error"]`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// An immutable, append-only thread event.
///
/// Once written, an event is never mutated; corrections happen by appending
/// new events (e.g. a further `control` event), never by editing history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub ts: DateTime<Utc>,
    pub thread: String,
    #[serde(rename = "type")]
    pub r#type: EventType,
    pub from: String,
    #[serde(default = "default_to")]
    pub to: String,
    #[serde(default, deserialize_with = "deserialize_content")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<EventMeta>,
}

fn default_to() -> String {
    ALL.to_string()
}

/// Deserialize `content` from either a JSON string (kept verbatim) or a JSON
/// object (re-serialized to a compact JSON string).
///
/// `content` is typed `String` on the wire struct so every other call site
/// (storage, `parse_control_content`, message display) only ever deals with
/// one shape, but `spec.md` §6.2 requires the control payload to be accepted
/// as either a JSON object or a JSON-encoded string — this normalizes both
/// input shapes to the canonical stored form before they reach that struct.
pub fn deserialize_content<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// The control-event payload schema (`spec.md` §6.2). Accepted as either a
/// JSON object or a JSON-encoded string inside `Event::content` — see
/// [`parse_control_content`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControlContent {
    pub mute: Option<MuteControl>,
    pub unmute: Option<UnmuteControl>,
    pub pause: Option<PauseControl>,
    pub discussion: Option<DiscussionControl>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MuteControl {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnmuteControl {
    #[serde(default)]
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PauseControl {
    #[serde(default = "default_true")]
    pub on: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscussionControl {
    pub on: bool,
    pub allow_agent_mentions: Option<bool>,
}

fn default_true() -> bool {
    true
}

/// Parse `Event::content` into a [`ControlContent`].
///
/// Accepts either a JSON object directly, or a string containing
/// JSON-encoded content (`spec.md` §9 "Dynamic content"). Anything else —
/// malformed JSON, a bare scalar — is treated as an empty control (forward
/// compatibility: unknown shapes are inert, not errors).
pub fn parse_control_content(content: &str) -> ControlContent {
    if let Ok(parsed) = serde_json::from_str::<ControlContent>(content) {
        return parsed;
    }
    // Might be a JSON-encoded string containing the real object.
    if let Ok(serde_json::Value::String(inner)) = serde_json::from_str::<serde_json::Value>(content) {
        if let Ok(parsed) = serde_json::from_str::<ControlContent>(&inner) {
            return parsed;
        }
    }
    ControlContent::default()
}

/// Thread-level discussion policy: whether agents may address other agents
/// via mentions without a human having targeted them directly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscussionState {
    pub on: bool,
    pub allow_agent_mentions: bool,
}

/// The derived, never-persisted state of a thread: pause flag, muted
/// participants, and discussion policy.
///
/// Built by folding `control` events from `from == "user"` in append order
/// (see [`ThreadState::apply`]); never constructed any other way.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadState {
    pub paused: bool,
    pub muted: HashSet<String>,
    pub discussion: DiscussionState,
}

impl ThreadState {
    /// Fold a single qualifying control event's content into the state.
    ///
    /// Mute is incremental (ids accumulate); unmute removes; pause and
    /// discussion are last-write-wins. Unrecognized sub-keys are ignored.
    pub fn apply(mut self, content: &ControlContent) -> Self {
        if let Some(mute) = &content.mute {
            let is_hard = mute.mode.as_deref().unwrap_or("hard") == "hard";
            if is_hard {
                for id in &mute.targets {
                    let trimmed = id.trim();
                    if !trimmed.is_empty() {
                        self.muted.insert(trimmed.to_string());
                    }
                }
            }
        }
        if let Some(unmute) = &content.unmute {
            for id in &unmute.targets {
                self.muted.remove(id.trim());
            }
        }
        if let Some(pause) = &content.pause {
            self.paused = pause.on;
        }
        if let Some(discussion) = &content.discussion {
            self.discussion.on = discussion.on;
            self.discussion.allow_agent_mentions =
                discussion.allow_agent_mentions.unwrap_or(discussion.on);
        }
        self
    }

    /// True if `event` is a control event this reducer accepts
    /// (`type == control` and `from == "user"`).
    fn qualifies(event: &Event) -> bool {
        matches!(event.r#type, EventType::Control) && event.from == USER_ID
    }

    /// Fold every qualifying control event in `events`, in order.
    ///
    /// Pure: depends only on `events`. Appending a non-control event, or a
    /// control event from anyone but `"user"`, never changes the result.
    pub fn reduce(events: &[Event]) -> ThreadState {
        let mut state = ThreadState::default();
        for event in events {
            if !Self::qualifies(event) {
                continue;
            }
            let content = parse_control_content(&event.content);
            state = state.apply(&content);
        }
        state
    }

    /// The state in effect *just before* `event_id`: folds every qualifying
    /// control strictly earlier in `events` than the target, by position,
    /// not by id. If `event_id` is not found, folds the whole sequence.
    pub fn state_before(events: &[Event], event_id: &str) -> ThreadState {
        let mut state = ThreadState::default();
        for event in events {
            if event.id == event_id {
                break;
            }
            if !Self::qualifies(event) {
                continue;
            }
            let content = parse_control_content(&event.content);
            state = state.apply(&content);
        }
        state
    }
}
