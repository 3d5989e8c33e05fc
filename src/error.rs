//! Typed errors for each subsystem.
//!
//! Shaped after the teacher crate's `BashError`: plain enums implementing
//! `Display` and `Error`, no `thiserror`. Each HTTP-facing error also maps
//! to the JSON envelope and status code `spec.md` §7 specifies.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde_json::json;

/// Failures from the thread log store (C2).
#[derive(Debug)]
pub enum StoreError {
    /// The thread id does not exist in the index.
    ThreadNotFound(String),
    /// The request body was missing a required field.
    Validation(String),
    /// Writing or reading the admission-derived thread state rejected this event.
    Admission { code: &'static str, message: String, participant: String },
    /// An underlying I/O failure (disk full, permissions, etc).
    Io(std::io::Error),
    /// A persisted JSON file failed to parse.
    Serde(serde_json::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::ThreadNotFound(id) => write!(f, "thread not found: {id}"),
            StoreError::Validation(msg) => write!(f, "validation error: {msg}"),
            StoreError::Admission { code, message, .. } => {
                write!(f, "admission rejected ({code}): {message}")
            }
            StoreError::Io(e) => write!(f, "io error: {e}"),
            StoreError::Serde(e) => write!(f, "serde error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(e)
    }
}

impl IntoResponse for StoreError {
    fn into_response(self) -> axum::response::Response {
        match self {
            StoreError::ThreadNotFound(id) => (
                StatusCode::NOT_FOUND,
                Json(json!({"error": format!("thread not found: {id}")})),
            )
                .into_response(),
            StoreError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, Json(json!({"error": msg}))).into_response()
            }
            StoreError::Admission {
                code,
                message,
                participant,
            } => (
                StatusCode::CONFLICT,
                Json(json!({
                    "error": {
                        "code": code,
                        "message": message,
                        "participant": participant,
                    }
                })),
            )
                .into_response(),
            StoreError::Io(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
                .into_response(),
            StoreError::Serde(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
                .into_response(),
        }
    }
}

/// Failures while loading or validating the coordinator's configuration (C12).
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    /// A required key was absent or had an invalid shape.
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "failed to read config file: {e}"),
            ConfigError::Parse(e) => write!(f, "failed to parse config file: {e}"),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Failures from invoking an agent adapter subprocess (C8).
#[derive(Debug)]
pub enum AdapterError {
    /// The subprocess did not exit within `adapter_timeout_s`.
    Timeout(String),
    /// The subprocess could not be spawned at all.
    SpawnFailed(String),
    /// An I/O failure while writing stdin or reading stdout/stderr.
    Io(std::io::Error),
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterError::Timeout(msg) => write!(f, "adapter timeout: {msg}"),
            AdapterError::SpawnFailed(msg) => write!(f, "adapter spawn failed: {msg}"),
            AdapterError::Io(e) => write!(f, "adapter io error: {e}"),
        }
    }
}

impl std::error::Error for AdapterError {}

impl From<std::io::Error> for AdapterError {
    fn from(e: std::io::Error) -> Self {
        AdapterError::Io(e)
    }
}
