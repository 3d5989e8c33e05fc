//! Coordinator configuration: loaded from a JSON file, unlike the teacher's
//! `CloudLLMConfig` (hardcoded provider constants) — this crate genuinely
//! needs per-deployment agent commands, so the config is data, not code.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

fn default_bridge_url() -> String {
    "http://localhost:5111".to_string()
}
fn default_coordinator_id() -> String {
    "bridge-coordinator".to_string()
}
fn default_max_reply_chars() -> usize {
    8000
}
fn default_context_window_size() -> usize {
    25
}
fn default_adapter_timeout_s() -> u64 {
    600
}
fn default_poll_threads_s() -> u64 {
    5
}
fn default_startup_mode() -> StartupMode {
    StartupMode::End
}
fn default_enable_mentions() -> bool {
    true
}
fn default_mention_prefix() -> String {
    "@".to_string()
}
fn default_presence_heartbeat_s() -> u64 {
    10
}

/// How the coordinator seeds its per-thread cursor on startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartupMode {
    /// Seed cursors to the current tail of every thread; never back-process history.
    End,
    /// Load cursors as persisted; pick up wherever the last run left off.
    Resume,
}

/// Optional per-agent display profile, published via presence (C9) and used
/// by the mention resolver's category matching (C7).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentProfile {
    pub client: Option<String>,
    pub model: Option<String>,
    pub nickname: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// One entry of `agents.<id>` (`spec.md` §6.4).
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub profile: AgentProfile,
}

/// The full coordinator configuration, deserialized directly from the
/// config file named by `BRIDGE_COORDINATOR_CONFIG` (or a default path).
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,
    #[serde(default = "default_coordinator_id")]
    pub coordinator_id: String,
    pub agents: HashMap<String, AgentConfig>,
    #[serde(default = "default_max_reply_chars")]
    pub max_reply_chars: usize,
    #[serde(default = "default_context_window_size")]
    pub context_window_size: usize,
    #[serde(default = "default_adapter_timeout_s")]
    pub adapter_timeout_s: u64,
    #[serde(default = "default_poll_threads_s")]
    pub poll_threads_s: u64,
    #[serde(default = "default_startup_mode")]
    pub startup_mode: StartupMode,
    #[serde(default = "default_enable_mentions")]
    pub enable_mentions: bool,
    #[serde(default = "default_mention_prefix")]
    pub mention_prefix: String,
    #[serde(default = "default_presence_heartbeat_s")]
    pub presence_heartbeat_s: u64,
}

impl CoordinatorConfig {
    /// Parse and validate a config file's contents.
    pub fn from_str(raw: &str) -> Result<Self, ConfigError> {
        let config: CoordinatorConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse the config file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_str(&raw)
    }

    /// Resolve the config path from `BRIDGE_COORDINATOR_CONFIG`, defaulting
    /// to `coordinator_config.json` in the current directory, then load it.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let path = std::env::var("BRIDGE_COORDINATOR_CONFIG")
            .unwrap_or_else(|_| "coordinator_config.json".to_string());
        Self::load(Path::new(&path))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.agents.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one entry is required under `agents`".to_string(),
            ));
        }
        for (id, agent) in &self.agents {
            if agent.command.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "agents.{id}.command must not be empty"
                )));
            }
        }
        if self.mention_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "mention_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resolve the coordinator's durable cursor file path from
/// `BRIDGE_COORDINATOR_STATE`, defaulting to
/// `conversations/coordinator_state.json`.
pub fn state_path_from_env() -> PathBuf {
    std::env::var("BRIDGE_COORDINATOR_STATE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("conversations/coordinator_state.json"))
}
