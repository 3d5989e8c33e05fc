//! Thin `reqwest` client over the bridge server's HTTP surface.
//!
//! The coordinator never touches the log files directly (`spec.md` §5
//! "Log files: owned by the server process; coordinator reads them only
//! through HTTP") — every thread read, event post, and presence update goes
//! through here.

use crate::event::Event;
use crate::presence::PresenceSnapshotEntry;
use crate::store::{NewEvent, Thread};
use serde_json::{json, Value};
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const PRESENCE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct BridgeClient {
    http: reqwest::Client,
    base_url: String,
}

impl BridgeClient {
    pub fn new(base_url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .expect("reqwest client builds with static config");
        Self { http, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    pub async fn list_threads(&self) -> Result<Vec<Thread>, reqwest::Error> {
        let body: Value = self
            .http
            .get(self.url("/threads"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let threads = serde_json::from_value(body["threads"].clone()).unwrap_or_default();
        Ok(threads)
    }

    /// Fetch every event in `thread_id` (the coordinator always reads the
    /// full history, per `spec.md` §4.6.a — it derives its own state
    /// in-scan rather than asking the server for a filtered read).
    pub async fn get_all_events(&self, thread_id: &str) -> Result<Vec<Event>, reqwest::Error> {
        let body: Value = self
            .http
            .get(self.url(&format!("/threads/{thread_id}/events")))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let events = serde_json::from_value(body["events"].clone()).unwrap_or_default();
        Ok(events)
    }

    pub async fn post_event(
        &self,
        thread_id: &str,
        event: &NewEvent,
    ) -> Result<(), reqwest::Error> {
        self.http
            .post(self.url(&format!("/threads/{thread_id}/events")))
            .json(event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Fetch the current presence snapshot for `thread_id`, used to build
    /// the mention resolver's participant directory (`spec.md` §4.7.c).
    pub async fn get_presence(&self, thread_id: &str) -> Result<Vec<PresenceSnapshotEntry>, reqwest::Error> {
        let body: Value = self
            .http
            .get(self.url(&format!("/threads/{thread_id}/presence")))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let participants = serde_json::from_value(body["participants"].clone()).unwrap_or_default();
        Ok(participants)
    }

    pub async fn post_presence(
        &self,
        thread_id: &str,
        from: &str,
        state: &str,
        details: Option<Value>,
    ) -> Result<(), reqwest::Error> {
        self.http
            .post(self.url(&format!("/threads/{thread_id}/presence")))
            .timeout(PRESENCE_TIMEOUT)
            .json(&json!({ "from": from, "state": state, "details": details }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
