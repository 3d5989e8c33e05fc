//! Coordinator: the poll loop (C6), mention resolver dispatch gate (C7),
//! and presence heartbeat (C9), tied together.
//!
//! Grounded in `original_source/coordinator.py`'s tick structure: one
//! cooperative worker, no per-thread concurrency, a full-history fetch per
//! thread per tick rather than a server-side `since` filter — preserved
//! deliberately (see `SPEC_FULL.md` §4.6) even though it costs more bytes
//! over the wire, because the coordinator's own in-scan reducer fold needs
//! every control event to compute the running `control_state` correctly.

mod client;

pub use client::BridgeClient;

use crate::adapter::{self, AdapterConfig};
use crate::config::CoordinatorConfig;
use crate::event::{parse_control_content, Event, EventMeta, EventType, ThreadState, ALL, USER_ID};
use crate::mentions::{extract_mentions, resolve_mentions, ParticipantDirectory, Participant};
use crate::store::NewEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Cap on `processed_ids[thread]` before a bulk clear (`spec.md` §4.6,
/// §9 open question: this allows re-dispatch if the persisted cursor is
/// rolled back across a crash. Flagged, not "fixed", per the spec's
/// explicit instruction not to silently change this tradeoff).
const PROCESSED_IDS_CAP: usize = 5000;

/// Combined-error-message truncation budget (`spec.md` §4.8).
const ERROR_MESSAGE_CHARS: usize = 4000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CursorEntry {
    last_ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    threads: HashMap<String, CursorEntry>,
}

/// The coordinator's durable per-thread cursor (`spec.md` §3 "Coordinator
/// durable state"), persisted atomically to `BRIDGE_COORDINATOR_STATE`.
pub struct CoordinatorState {
    path: PathBuf,
    threads: HashMap<String, DateTime<Utc>>,
}

impl CoordinatorState {
    /// Load durable cursor state according to `startup_mode` (`spec.md` §3
    /// "Coordinator durable state"): in `resume` mode the persisted file
    /// (if any) is loaded as-is; in `end` mode any persisted cursors are
    /// discarded so every thread looks cursor-less to `process_thread`,
    /// which seeds it to the current tail on the first tick and never
    /// back-processes history.
    pub fn load(path: impl Into<PathBuf>, startup_mode: crate::config::StartupMode) -> Self {
        let path = path.into();
        if matches!(startup_mode, crate::config::StartupMode::End) {
            return Self { path, threads: HashMap::new() };
        }
        let threads = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<PersistedState>(&raw).ok())
            .map(|persisted| {
                persisted
                    .threads
                    .into_iter()
                    .map(|(id, entry)| (id, entry.last_ts))
                    .collect()
            })
            .unwrap_or_default();
        Self { path, threads }
    }

    pub fn cursor(&self, thread_id: &str) -> Option<DateTime<Utc>> {
        self.threads.get(thread_id).copied()
    }

    /// Always advances, per `spec.md` §4.6.d: the cursor moves forward for
    /// every new event observed, whether or not it was dispatched.
    fn advance(&mut self, thread_id: &str, ts: DateTime<Utc>) {
        let entry = self.threads.entry(thread_id.to_string()).or_insert(ts);
        if ts > *entry {
            *entry = ts;
        }
    }

    fn save(&self) -> std::io::Result<()> {
        let persisted = PersistedState {
            threads: self
                .threads
                .iter()
                .map(|(id, ts)| (id.clone(), CursorEntry { last_ts: *ts }))
                .collect(),
        };
        let body = serde_json::to_string_pretty(&persisted)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Ephemeral, process-lifetime-only dedup and in-flight bookkeeping
/// (`spec.md` §3 "Coordinator ephemeral state").
#[derive(Default)]
struct CoordinatorRuntime {
    processed_ids: HashMap<String, HashSet<String>>,
    active_invocations: HashSet<(String, String)>,
    last_heartbeat: Option<Instant>,
}

impl CoordinatorRuntime {
    fn already_processed(&self, thread_id: &str, event_id: &str) -> bool {
        self.processed_ids
            .get(thread_id)
            .map(|ids| ids.contains(event_id))
            .unwrap_or(false)
    }

    fn mark_processed(&mut self, thread_id: &str, event_id: &str) {
        let ids = self.processed_ids.entry(thread_id.to_string()).or_default();
        if ids.len() >= PROCESSED_IDS_CAP {
            ids.clear();
        }
        ids.insert(event_id.to_string());
    }

    fn begin_invocation(&mut self, thread_id: &str, agent_id: &str) {
        self.active_invocations
            .insert((thread_id.to_string(), agent_id.to_string()));
    }

    fn end_invocation(&mut self, thread_id: &str, agent_id: &str) {
        self.active_invocations
            .remove(&(thread_id.to_string(), agent_id.to_string()));
    }

    fn is_invoking(&self, thread_id: &str, agent_id: &str) -> bool {
        self.active_invocations
            .contains(&(thread_id.to_string(), agent_id.to_string()))
    }
}

/// Run the coordinator forever. Returns only if the process is asked to
/// shut down some other way (it never does on its own).
pub async fn run(config: CoordinatorConfig, client: BridgeClient, state_path: &Path) {
    let mut state = CoordinatorState::load(state_path, config.startup_mode);
    let mut runtime = CoordinatorRuntime::default();

    loop {
        match client.list_threads().await {
            Ok(threads) => {
                maybe_heartbeat(&config, &client, &threads, &mut runtime).await;
                for thread in &threads {
                    if let Err(e) = process_thread(&config, &client, &mut state, &mut runtime, &thread.id).await {
                        log::warn!("coordinator: error processing thread {}: {e}", thread.id);
                    }
                }
                if let Err(e) = state.save() {
                    log::warn!("coordinator: failed to persist cursor state: {e}");
                }
                tokio::time::sleep(std::time::Duration::from_secs(config.poll_threads_s)).await;
            }
            Err(e) => {
                log::warn!("coordinator: failed to list threads: {e}");
                tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            }
        }
    }
}

async fn maybe_heartbeat(
    config: &CoordinatorConfig,
    client: &BridgeClient,
    threads: &[crate::store::Thread],
    runtime: &mut CoordinatorRuntime,
) {
    if config.presence_heartbeat_s == 0 {
        return;
    }
    let due = match runtime.last_heartbeat {
        None => true,
        Some(last) => last.elapsed() >= std::time::Duration::from_secs(config.presence_heartbeat_s),
    };
    if !due {
        return;
    }
    runtime.last_heartbeat = Some(Instant::now());

    for thread in threads {
        for (agent_id, agent) in &config.agents {
            if runtime.is_invoking(&thread.id, agent_id) {
                continue;
            }
            let details = serde_json::to_value(&agent.profile).ok();
            let _ = client
                .post_presence(&thread.id, agent_id, "listening", details)
                .await;
        }
        let coordinator_details = json!({
            "client": "agent-bridge",
            "model": "coordinator",
            "nickname": "coordinator",
        });
        let _ = client
            .post_presence(&thread.id, &config.coordinator_id, "listening", Some(coordinator_details))
            .await;
    }
}

async fn process_thread(
    config: &CoordinatorConfig,
    client: &BridgeClient,
    state: &mut CoordinatorState,
    runtime: &mut CoordinatorRuntime,
    thread_id: &str,
) -> Result<(), reqwest::Error> {
    let events = client.get_all_events(thread_id).await?;

    let cursor = match state.cursor(thread_id) {
        Some(cursor) => cursor,
        None => {
            // Never back-process history: seed to the current tail and wait
            // for the next tick to see anything truly new.
            if let Some(last) = events.last() {
                state.advance(thread_id, last.ts);
            }
            return Ok(());
        }
    };

    let mut control_state = ThreadState::default();
    for event in &events {
        if matches!(event.r#type, EventType::Control) && event.from == USER_ID {
            control_state = control_state.apply(&parse_control_content(&event.content));
        }

        if event.ts <= cursor {
            continue;
        }
        state.advance(thread_id, event.ts);

        if runtime.already_processed(thread_id, &event.id) {
            continue;
        }
        runtime.mark_processed(thread_id, &event.id);

        if matches!(event.r#type, EventType::Message) {
            dispatch(config, client, runtime, thread_id, &events, event, &control_state).await;
        }
    }

    Ok(())
}

fn build_directory(
    agents: &HashMap<String, crate::config::AgentConfig>,
    presence: &[crate::presence::PresenceSnapshotEntry],
) -> ParticipantDirectory {
    let mut participants = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for (id, cfg) in agents {
        participants.push(Participant {
            id: id.clone(),
            nickname: cfg.profile.nickname.clone(),
            roles: cfg.profile.roles.clone(),
            client: cfg.profile.client.clone(),
            model: cfg.profile.model.clone(),
        });
        seen.insert(id.clone());
    }

    for entry in presence {
        if seen.contains(&entry.id) {
            continue;
        }
        let details = entry.details.as_ref();
        let string_field = |key: &str| {
            details
                .and_then(|d| d.get(key))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        let roles = details
            .and_then(|d| d.get("roles"))
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|x| x.as_str().map(String::from)).collect())
            .unwrap_or_default();
        participants.push(Participant {
            id: entry.id.clone(),
            nickname: string_field("nickname"),
            roles,
            client: string_field("client"),
            model: string_field("model"),
        });
        seen.insert(entry.id.clone());
    }

    ParticipantDirectory::new(participants)
}

async fn dispatch(
    config: &CoordinatorConfig,
    client: &BridgeClient,
    runtime: &mut CoordinatorRuntime,
    thread_id: &str,
    full_history: &[Event],
    event: &Event,
    control_state: &ThreadState,
) {
    if event.from == config.coordinator_id || event.to == USER_ID || control_state.paused {
        return;
    }

    let mut targets: HashSet<String> = HashSet::new();

    if config.agents.contains_key(&event.to) {
        targets.insert(event.to.clone());
    } else if event.to == ALL {
        let may_mention =
            event.from == USER_ID || (control_state.discussion.on && control_state.discussion.allow_agent_mentions);
        if !config.enable_mentions || !may_mention {
            return;
        }
        let mentions = extract_mentions(&event.content, &config.mention_prefix);
        if mentions.is_empty() {
            return;
        }

        let presence_snapshot = client.get_presence(thread_id).await.unwrap_or_default();
        let directory = build_directory(&config.agents, &presence_snapshot);

        let resolved = resolve_mentions(&mentions, &directory, &event.from);

        if event.from == USER_ID && !resolved.reserved_hits.is_empty() {
            let notice = format!(
                "reserved mention not supported: {}",
                resolved.reserved_hits.iter().cloned().collect::<Vec<_>>().join(", ")
            );
            post_coordinator_notice(client, config, thread_id, &event.id, "user", &notice).await;
        }

        for (token, candidates) in &resolved.ambiguous {
            let notice = format!(
                "\"@{token}\" is ambiguous: {}",
                crate::mentions::format_ambiguity_candidates(candidates)
            );
            post_coordinator_notice(client, config, thread_id, &event.id, "user", &notice).await;
        }

        targets = resolved.target_ids;
    } else {
        return;
    }

    targets.retain(|id| !control_state.muted.contains(id));
    if targets.is_empty() {
        return;
    }

    for agent_id in targets {
        let Some(agent_config) = config.agents.get(&agent_id) else {
            continue;
        };
        runtime.begin_invocation(thread_id, &agent_id);
        let _ = client.post_presence(thread_id, &agent_id, "thinking", None).await;

        let context_window = tail_events(full_history, config.context_window_size);
        let payload = build_payload(config, thread_id, event, &context_window);

        let adapter_config = AdapterConfig {
            command: agent_config.command.clone(),
            cwd: agent_config.cwd.clone(),
            env: agent_config.env.clone(),
        };
        let outcome = adapter::invoke_with_timeout(&adapter_config, &payload, config.adapter_timeout_s).await;

        if outcome.exit_code == 0 {
            let trimmed = outcome.stdout.trim();
            let reply = if trimmed.is_empty() {
                "[no output]".to_string()
            } else {
                adapter::truncate(trimmed, config.max_reply_chars)
            };
            let new_event = NewEvent {
                r#type: EventType::Message,
                from: agent_id.clone(),
                to: ALL.to_string(),
                content: reply,
                meta: Some(EventMeta {
                    reply_to: Some(event.id.clone()),
                    tags: vec!["coordinator".to_string()],
                }),
            };
            if let Err(e) = client.post_event(thread_id, &new_event).await {
                log::warn!("coordinator: failed to post reply for {agent_id}: {e}");
            }
        } else {
            let combined = adapter::truncate(
                &format!(
                    "exit {}\nstderr: {}\nstdout: {}",
                    outcome.exit_code, outcome.stderr, outcome.stdout
                ),
                ERROR_MESSAGE_CHARS,
            );
            let new_event = NewEvent {
                r#type: EventType::Message,
                from: config.coordinator_id.clone(),
                to: ALL.to_string(),
                content: combined,
                meta: Some(EventMeta {
                    reply_to: Some(event.id.clone()),
                    tags: vec!["coordinator".to_string(), "error".to_string()],
                }),
            };
            if let Err(e) = client.post_event(thread_id, &new_event).await {
                log::warn!("coordinator: failed to post error event for {agent_id}: {e}");
            }
        }

        let _ = client.post_presence(thread_id, &agent_id, "listening", None).await;
        runtime.end_invocation(thread_id, &agent_id);
    }
}

async fn post_coordinator_notice(
    client: &BridgeClient,
    config: &CoordinatorConfig,
    thread_id: &str,
    trigger_id: &str,
    to: &str,
    content: &str,
) {
    let new_event = NewEvent {
        r#type: EventType::Message,
        from: config.coordinator_id.clone(),
        to: to.to_string(),
        content: content.to_string(),
        meta: Some(EventMeta {
            reply_to: Some(trigger_id.to_string()),
            tags: vec!["coordinator".to_string()],
        }),
    };
    if let Err(e) = client.post_event(thread_id, &new_event).await {
        log::warn!("coordinator: failed to post notice: {e}");
    }
}

fn tail_events(events: &[Event], window: usize) -> Vec<Event> {
    let start = events.len().saturating_sub(window);
    events[start..].to_vec()
}

fn build_payload(config: &CoordinatorConfig, thread_id: &str, trigger: &Event, context_window: &[Event]) -> String {
    let trigger_value = json!({
        "id": trigger.id,
        "ts": trigger.ts,
        "type": trigger.r#type,
        "from": trigger.from,
        "to": trigger.to,
        "content": trigger.content,
    });
    let payload: Value = json!({
        "bridge": { "url": config.bridge_url },
        "thread": { "id": thread_id },
        "trigger": trigger_value,
        "context_window": context_window,
    });
    payload.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, AgentProfile, StartupMode};
    use crate::event::EventType;
    use crate::presence::PresenceSnapshotEntry;

    fn event(id: &str, r#type: EventType, from: &str, to: &str, content: &str) -> Event {
        Event {
            id: id.to_string(),
            ts: Utc::now(),
            thread: "t1".to_string(),
            r#type,
            from: from.to_string(),
            to: to.to_string(),
            content: content.to_string(),
            meta: None,
        }
    }

    #[test]
    fn end_mode_discards_persisted_cursors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            r#"{"threads":{"t1":{"last_ts":"2020-01-01T00:00:00Z"}}}"#,
        )
        .unwrap();

        let state = CoordinatorState::load(&path, StartupMode::End);
        assert!(state.cursor("t1").is_none());
    }

    #[test]
    fn resume_mode_loads_persisted_cursors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            r#"{"threads":{"t1":{"last_ts":"2020-01-01T00:00:00Z"}}}"#,
        )
        .unwrap();

        let state = CoordinatorState::load(&path, StartupMode::Resume);
        assert!(state.cursor("t1").is_some());
    }

    #[test]
    fn cursor_advance_never_moves_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut state = CoordinatorState::load(&path, StartupMode::Resume);
        let t1 = Utc::now();
        let t0 = t1 - chrono::Duration::seconds(10);
        state.advance("t1", t1);
        state.advance("t1", t0);
        assert_eq!(state.cursor("t1"), Some(t1));
    }

    #[test]
    fn save_and_reload_round_trips_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut state = CoordinatorState::load(&path, StartupMode::Resume);
        let ts = Utc::now();
        state.advance("t1", ts);
        state.save().unwrap();

        let reloaded = CoordinatorState::load(&path, StartupMode::Resume);
        assert_eq!(reloaded.cursor("t1").unwrap().timestamp_millis(), ts.timestamp_millis());
    }

    #[test]
    fn mark_processed_bulk_clears_at_cap() {
        let mut runtime = CoordinatorRuntime::default();
        for i in 0..PROCESSED_IDS_CAP {
            runtime.mark_processed("t1", &format!("id-{i}"));
        }
        assert!(runtime.already_processed("t1", "id-0"));
        // One more push triggers the bulk clear before inserting the new id.
        runtime.mark_processed("t1", "overflow");
        assert!(!runtime.already_processed("t1", "id-0"));
        assert!(runtime.already_processed("t1", "overflow"));
    }

    #[test]
    fn active_invocations_track_begin_and_end() {
        let mut runtime = CoordinatorRuntime::default();
        assert!(!runtime.is_invoking("t1", "codex"));
        runtime.begin_invocation("t1", "codex");
        assert!(runtime.is_invoking("t1", "codex"));
        runtime.end_invocation("t1", "codex");
        assert!(!runtime.is_invoking("t1", "codex"));
    }

    fn agent_config(command: &str) -> AgentConfig {
        AgentConfig {
            command: vec![command.to_string()],
            cwd: None,
            env: HashMap::new(),
            profile: AgentProfile::default(),
        }
    }

    #[test]
    fn build_directory_unions_configured_agents_and_presence_without_duplicates() {
        let mut agents = HashMap::new();
        agents.insert("codex".to_string(), agent_config("./codex"));

        let presence = vec![PresenceSnapshotEntry {
            id: "codex".to_string(),
            state: "listening".to_string(),
            updated_at: Utc::now(),
            stale: false,
            details: None,
        }];

        let directory = build_directory(&agents, &presence);
        let mentions: std::collections::BTreeSet<String> =
            ["codex".to_string()].into_iter().collect();
        let resolved = resolve_mentions(&mentions, &directory, "user");
        assert_eq!(resolved.target_ids.len(), 1);
    }

    #[test]
    fn build_directory_adds_presence_only_participants_with_profile_details() {
        let agents = HashMap::new();
        let presence = vec![PresenceSnapshotEntry {
            id: "claude".to_string(),
            state: "listening".to_string(),
            updated_at: Utc::now(),
            stale: false,
            details: Some(json!({"nickname": "claude", "client": "anthropic"})),
        }];
        let directory = build_directory(&agents, &presence);
        let mentions: std::collections::BTreeSet<String> =
            ["anthropic".to_string()].into_iter().collect();
        let resolved = resolve_mentions(&mentions, &directory, "user");
        assert_eq!(resolved.target_ids, ["claude".to_string()].into_iter().collect());
    }

    #[test]
    fn tail_events_keeps_only_the_last_window() {
        let events: Vec<Event> = (0..10)
            .map(|i| event(&format!("m{i}"), EventType::Message, "user", ALL, "x"))
            .collect();
        let tail = tail_events(&events, 3);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].id, "m7");
        assert_eq!(tail[2].id, "m9");
    }

    #[test]
    fn tail_events_returns_everything_when_window_exceeds_len() {
        let events: Vec<Event> = (0..2)
            .map(|i| event(&format!("m{i}"), EventType::Message, "user", ALL, "x"))
            .collect();
        let tail = tail_events(&events, 25);
        assert_eq!(tail.len(), 2);
    }

    #[test]
    fn build_payload_embeds_trigger_and_context_window() {
        let mut agents = HashMap::new();
        agents.insert("codex".to_string(), agent_config("./codex"));
        let config = CoordinatorConfig {
            bridge_url: "http://localhost:5111".to_string(),
            coordinator_id: "bridge-coordinator".to_string(),
            agents,
            max_reply_chars: 8000,
            context_window_size: 25,
            adapter_timeout_s: 600,
            poll_threads_s: 5,
            startup_mode: StartupMode::End,
            enable_mentions: true,
            mention_prefix: "@".to_string(),
            presence_heartbeat_s: 10,
        };
        let trigger = event("m1", EventType::Message, "user", ALL, "hello @codex");
        let context = vec![trigger.clone()];
        let payload = build_payload(&config, "t1", &trigger, &context);
        let parsed: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed["thread"]["id"], "t1");
        assert_eq!(parsed["trigger"]["content"], "hello @codex");
        assert_eq!(parsed["context_window"].as_array().unwrap().len(), 1);
        assert_eq!(parsed["bridge"]["url"], "http://localhost:5111");
    }
}
