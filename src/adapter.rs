//! Runs an external agent program with a JSON payload on stdin.
//!
//! Grounded directly in the teacher's `tools/bash.rs`: `tokio::process::Command`
//! wrapped in `tokio::time::timeout`, concurrent stdout/stderr capture via
//! `tokio::join!` over a byte-capped reader so a runaway adapter can't
//! exhaust memory.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command as TokioCommand;

/// Cap on bytes collected from a single stream (stdout or stderr).
const MAX_OUTPUT_SIZE: usize = 10 * 1024 * 1024;

/// Synthetic exit code used when the adapter did not finish within its timeout.
pub const EXIT_TIMEOUT: i32 = 124;
/// Synthetic exit code used when the adapter program could not be spawned at all.
pub const EXIT_SPAWN_ERROR: i32 = 125;

/// Per-agent invocation configuration (`spec.md` §6.4 `agents.<id>`).
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

/// The result of one adapter invocation, always `Ok` from [`invoke`] —
/// timeouts and spawn failures are represented as synthetic exit codes
/// rather than a `Result::Err`, matching `spec.md` §4.8's "Outcomes" list.
#[derive(Debug, Clone)]
pub struct AdapterOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

async fn read_limited<R: AsyncReadExt + Unpin>(mut reader: R) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(buf);
        }
        if buf.len() + n > MAX_OUTPUT_SIZE {
            buf.extend_from_slice(&chunk[..n.min(MAX_OUTPUT_SIZE - buf.len())]);
            return Ok(buf);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Spawn `config.command` with `stdin_payload` on stdin, a timeout of
/// `timeout_secs`, and `config.env` layered on top of the inherited
/// process environment.
///
/// Always returns `Ok`: a timeout yields exit code [`EXIT_TIMEOUT`], a
/// spawn failure yields [`EXIT_SPAWN_ERROR`], both with an explanatory
/// message in `stderr`.
pub async fn invoke(
    config: &AdapterConfig,
    stdin_payload: &str,
) -> AdapterOutcome {
    invoke_with_timeout(config, stdin_payload, default_timeout_secs()).await
}

fn default_timeout_secs() -> u64 {
    600
}

/// Same as [`invoke`] but with an explicit timeout, used by the
/// coordinator which reads `adapter_timeout_s` from configuration.
pub async fn invoke_with_timeout(
    config: &AdapterConfig,
    stdin_payload: &str,
    timeout_secs: u64,
) -> AdapterOutcome {
    let start = Instant::now();

    if config.command.is_empty() {
        return AdapterOutcome {
            exit_code: EXIT_SPAWN_ERROR,
            stdout: String::new(),
            stderr: "adapter command is empty".to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        };
    }

    let program = config.command[0].clone();
    let args = config.command[1..].to_vec();
    let cwd = config.cwd.clone();
    let env = config.env.clone();
    let payload = stdin_payload.to_string();
    let timeout = std::time::Duration::from_secs(timeout_secs);

    let run = async move {
        let mut command = TokioCommand::new(&program);
        command
            .args(&args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &cwd {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return Err(format!("{e}")),
        };

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(payload.as_bytes()).await;
            drop(stdin);
        }

        let stdout_pipe = child.stdout.take().expect("stdout was piped");
        let stderr_pipe = child.stderr.take().expect("stderr was piped");
        let (stdout_bytes, stderr_bytes) = tokio::join!(
            read_limited(stdout_pipe),
            read_limited(stderr_pipe),
        );

        let status = match child.wait().await {
            Ok(status) => status,
            Err(e) => return Err(format!("{e}")),
        };

        let stdout = String::from_utf8_lossy(&stdout_bytes.unwrap_or_default()).to_string();
        let stderr = String::from_utf8_lossy(&stderr_bytes.unwrap_or_default()).to_string();
        Ok((status.code().unwrap_or(-1), stdout, stderr))
    };

    match tokio::time::timeout(timeout, run).await {
        Ok(Ok((exit_code, stdout, stderr))) => AdapterOutcome {
            exit_code,
            stdout,
            stderr,
            duration_ms: start.elapsed().as_millis() as u64,
        },
        Ok(Err(spawn_error)) => AdapterOutcome {
            exit_code: EXIT_SPAWN_ERROR,
            stdout: String::new(),
            stderr: spawn_error,
            duration_ms: start.elapsed().as_millis() as u64,
        },
        Err(_) => AdapterOutcome {
            exit_code: EXIT_TIMEOUT,
            stdout: String::new(),
            stderr: format!("adapter timeout after {timeout_secs}s"),
            duration_ms: start.elapsed().as_millis() as u64,
        },
    }
}

/// Truncate `text` to at most `max_chars` characters.
///
/// Exact rule (`spec.md` §4.8, grounded in `original_source/coordinator.py`'s
/// `_truncate`): if `text` is longer than `max_chars`, keep the first
/// `max_chars - 20` characters and append `"\n\n[truncated]\n"`. Idempotent:
/// truncating an already-truncated string to the same budget is a no-op.
pub fn truncate(text: &str, max_chars: usize) -> String {
    let char_count = text.chars().count();
    if char_count <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(20);
    let head: String = text.chars().take(keep).collect();
    format!("{head}\n\n[truncated]\n")
}
