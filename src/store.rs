//! Append-only per-thread event log, plus the threads index.
//!
//! Grounded in the teacher's `thought_chain.rs`: one `.jsonl` file per
//! thread, appended line-by-line, reopened and fully scanned on every read.
//! Unlike `ThoughtChain`, entries are not SHA-256 hash-chained — `spec.md`
//! does not ask for tamper evidence, only ordering and durability.

use crate::error::StoreError;
use crate::event::{deserialize_content, Event, EventMeta, EventType, ThreadState, ALL, USER_ID};
use crate::id::generate_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex as AsyncMutex;

/// An entry in the threads index: display metadata, not the log itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ThreadsIndex {
    #[serde(default)]
    threads: Vec<Thread>,
}

/// Caller-supplied fields for a new event; `id`/`ts`/`thread` are always
/// stamped by the store and any caller-provided values are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    #[serde(default = "default_message_type")]
    pub r#type: EventType,
    pub from: String,
    #[serde(default = "default_to")]
    pub to: String,
    #[serde(default, deserialize_with = "deserialize_content")]
    pub content: String,
    #[serde(default)]
    pub meta: Option<EventMeta>,
}

fn default_message_type() -> EventType {
    EventType::Message
}

fn default_to() -> String {
    ALL.to_string()
}

/// Owns the on-disk `conversations/` directory: the threads index and every
/// thread's `.jsonl` log.
pub struct Store {
    root: PathBuf,
    index: AsyncMutex<ThreadsIndex>,
    write_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Store {
    /// Open (or initialize) the store rooted at `root`. Creates
    /// `root/threads/` and an empty index if neither exists yet.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join("threads"))?;
        let index = if root.join("index.json").exists() {
            let text = fs::read_to_string(root.join("index.json"))?;
            serde_json::from_str(&text)?
        } else {
            ThreadsIndex::default()
        };
        Ok(Self {
            root,
            index: AsyncMutex::new(index),
            write_locks: StdMutex::new(HashMap::new()),
        })
    }

    fn thread_file(&self, thread_id: &str) -> PathBuf {
        self.root.join("threads").join(format!("{thread_id}.jsonl"))
    }

    fn index_file(&self) -> PathBuf {
        self.root.join("index.json")
    }

    fn lock_for(&self, thread_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.write_locks.lock().unwrap();
        locks
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Atomically persist the threads index (write-temp-then-rename).
    async fn save_index_locked(&self, index: &ThreadsIndex) -> Result<(), StoreError> {
        let tmp = self.root.join("index.json.tmp");
        let body = serde_json::to_string_pretty(index)?;
        fs::write(&tmp, body)?;
        fs::rename(&tmp, self.index_file())?;
        Ok(())
    }

    /// List every thread in the index, in insertion order.
    pub async fn list_threads(&self) -> Vec<Thread> {
        self.index.lock().await.threads.clone()
    }

    pub async fn get_thread(&self, thread_id: &str) -> Option<Thread> {
        self.index
            .lock()
            .await
            .threads
            .iter()
            .find(|t| t.id == thread_id)
            .cloned()
    }

    /// Create a new thread: writes a `thread.created` event and adds it to
    /// the index atomically.
    pub async fn create_thread(
        &self,
        name: Option<String>,
        from: Option<String>,
    ) -> Result<Thread, StoreError> {
        let thread_id = generate_id();
        let display_name = name.unwrap_or_else(|| thread_id.clone());
        let created_by = from.unwrap_or_else(|| USER_ID.to_string());

        let event = self
            .append_raw(
                &thread_id,
                NewEvent {
                    r#type: EventType::ThreadCreated,
                    from: created_by,
                    to: ALL.to_string(),
                    content: String::new(),
                    meta: None,
                },
            )
            .await?;

        let thread = Thread {
            id: thread_id.clone(),
            name: display_name,
            created_at: event.ts,
            updated_at: event.ts,
        };

        let mut index = self.index.lock().await;
        index.threads.push(thread.clone());
        self.save_index_locked(&index).await?;
        Ok(thread)
    }

    /// Append an event to `thread_id`, applying the admission rules of
    /// `spec.md` §4.5 first. Returns the stamped event on success, or a
    /// `StoreError::Admission` mapped to a 409 by the HTTP layer.
    pub async fn append_event(
        &self,
        thread_id: &str,
        new_event: NewEvent,
    ) -> Result<Event, StoreError> {
        if self.get_thread(thread_id).await.is_none() {
            return Err(StoreError::ThreadNotFound(thread_id.to_string()));
        }
        if new_event.from.trim().is_empty() {
            return Err(StoreError::Validation("missing `from`".to_string()));
        }
        if matches!(new_event.r#type, EventType::Message) && new_event.content.is_empty() {
            return Err(StoreError::Validation(
                "missing `content` for message event".to_string(),
            ));
        }

        if matches!(new_event.r#type, EventType::Message) && new_event.from != USER_ID {
            let existing = self.read_events(thread_id, None)?;
            let state = ThreadState::reduce(&existing);
            if state.paused {
                return Err(StoreError::Admission {
                    code: "thread_paused",
                    message: "thread is paused".to_string(),
                    participant: new_event.from.clone(),
                });
            }
            if state.muted.contains(&new_event.from) {
                return Err(StoreError::Admission {
                    code: "participant_muted",
                    message: "participant is muted".to_string(),
                    participant: new_event.from.clone(),
                });
            }
        }

        self.append_raw(thread_id, new_event).await
    }

    /// Stamp and write an event with no admission checks. Used internally
    /// for `thread.created`/`thread.renamed` and by `append_event` once
    /// admission has passed.
    async fn append_raw(&self, thread_id: &str, new_event: NewEvent) -> Result<Event, StoreError> {
        let lock = self.lock_for(thread_id);
        let _guard = lock.lock().await;

        let event = Event {
            id: generate_id(),
            ts: Utc::now(),
            thread: thread_id.to_string(),
            r#type: new_event.r#type,
            from: new_event.from,
            to: new_event.to,
            content: new_event.content,
            meta: new_event.meta,
        };

        let line = serde_json::to_string(&event)?;
        let path = self.thread_file(thread_id);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{line}")?;

        if matches!(event.r#type, EventType::ThreadRenamed) {
            self.rename_in_index(thread_id, &event.content).await?;
        }

        Ok(event)
    }

    async fn rename_in_index(&self, thread_id: &str, new_name: &str) -> Result<(), StoreError> {
        if new_name.is_empty() {
            return Ok(());
        }
        let mut index = self.index.lock().await;
        if let Some(thread) = index.threads.iter_mut().find(|t| t.id == thread_id) {
            thread.name = new_name.to_string();
            thread.updated_at = Utc::now();
        }
        self.save_index_locked(&index).await
    }

    /// Read every event for `thread_id` with `ts > since` (or the full log
    /// if `since` is `None`). A lock-free reopen-and-scan: concurrent
    /// writers only ever append, so a partial read never observes a torn
    /// line from a write in progress.
    pub fn read_events(
        &self,
        thread_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Event>, StoreError> {
        let path = self.thread_file(thread_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&path)?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)?;
            let keep = match since {
                Some(cursor) => event.ts > cursor,
                None => true,
            };
            if keep {
                events.push(event);
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn create_thread_writes_created_event_and_index_entry() {
        let (_dir, store) = temp_store();
        let thread = store.create_thread(Some("general".to_string()), None).await.unwrap();
        assert_eq!(thread.name, "general");

        let events = store.read_events(&thread.id, None).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].r#type, EventType::ThreadCreated));

        let listed = store.list_threads().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, thread.id);
    }

    #[tokio::test]
    async fn append_and_read_since_cursor() {
        let (_dir, store) = temp_store();
        let thread = store.create_thread(None, None).await.unwrap();

        let first = store
            .append_event(
                &thread.id,
                NewEvent {
                    r#type: EventType::Message,
                    from: USER_ID.to_string(),
                    to: ALL.to_string(),
                    content: "hello".to_string(),
                    meta: None,
                },
            )
            .await
            .unwrap();

        let second = store
            .append_event(
                &thread.id,
                NewEvent {
                    r#type: EventType::Message,
                    from: USER_ID.to_string(),
                    to: ALL.to_string(),
                    content: "world".to_string(),
                    meta: None,
                },
            )
            .await
            .unwrap();

        let all = store.read_events(&thread.id, None).unwrap();
        assert_eq!(all.len(), 3); // created + 2 messages

        let since_first = store.read_events(&thread.id, Some(first.ts)).unwrap();
        assert_eq!(since_first.len(), 1);
        assert_eq!(since_first[0].id, second.id);
    }

    #[tokio::test]
    async fn paused_thread_rejects_non_user_message() {
        let (_dir, store) = temp_store();
        let thread = store.create_thread(None, None).await.unwrap();
        store
            .append_event(
                &thread.id,
                NewEvent {
                    r#type: EventType::Control,
                    from: USER_ID.to_string(),
                    to: ALL.to_string(),
                    content: r#"{"pause":{"on":true}}"#.to_string(),
                    meta: None,
                },
            )
            .await
            .unwrap();

        let result = store
            .append_event(
                &thread.id,
                NewEvent {
                    r#type: EventType::Message,
                    from: "codex".to_string(),
                    to: ALL.to_string(),
                    content: "x".to_string(),
                    meta: None,
                },
            )
            .await;

        match result {
            Err(StoreError::Admission { code, .. }) => assert_eq!(code, "thread_paused"),
            other => panic!("expected thread_paused admission error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn muted_participant_is_rejected() {
        let (_dir, store) = temp_store();
        let thread = store.create_thread(None, None).await.unwrap();
        store
            .append_event(
                &thread.id,
                NewEvent {
                    r#type: EventType::Control,
                    from: USER_ID.to_string(),
                    to: ALL.to_string(),
                    content: r#"{"mute":{"mode":"hard","targets":["codex"]}}"#.to_string(),
                    meta: None,
                },
            )
            .await
            .unwrap();

        let result = store
            .append_event(
                &thread.id,
                NewEvent {
                    r#type: EventType::Message,
                    from: "codex".to_string(),
                    to: ALL.to_string(),
                    content: "x".to_string(),
                    meta: None,
                },
            )
            .await;

        match result {
            Err(StoreError::Admission { code, .. }) => assert_eq!(code, "participant_muted"),
            other => panic!("expected participant_muted admission error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn append_to_unknown_thread_fails() {
        let (_dir, store) = temp_store();
        let result = store
            .append_event(
                "does-not-exist",
                NewEvent {
                    r#type: EventType::Message,
                    from: USER_ID.to_string(),
                    to: ALL.to_string(),
                    content: "x".to_string(),
                    meta: None,
                },
            )
            .await;
        assert!(matches!(result, Err(StoreError::ThreadNotFound(_))));
    }
}
