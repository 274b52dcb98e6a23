//! Child-process engine: one fresh process per run.
//!
//! [`run_isolated`] owns the spawn / stdin / capture / timeout handling;
//! [`SubprocessEngine`] builds the command from [`EngineConfig`] and turns
//! the captured output into a result.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use super::{parse_result, ComputeEngine, ComputeError};
use crate::config_tree::ResolvedConfig;

/// Maximum stdout or stderr size captured per stream (10 MiB).
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Maximum stderr length carried in an error (bytes, from the end).
const STDERR_TAIL_BYTES: usize = 2048;

/// Environment variable carrying the configuration name to the child.
pub const CONFIG_NAME_ENV: &str = "LABRUN_CONFIG_NAME";

/// Captured output from a finished child process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// Process exit code (`-1` if killed by signal).
    pub exit_code: i32,
    pub duration_ms: u64,
}

/// Spawn `cmd`, write `payload` to its stdin, capture stdout/stderr and
/// enforce `timeout`.
///
/// The budget covers both the child's exit and draining its output, so a
/// background process that inherited the pipes cannot hold the run open.
/// The child is killed and reaped on timeout, and killed on drop if the
/// calling future is cancelled, so no engine process outlives its run.
pub async fn run_isolated(
    cmd: &mut Command,
    payload: &[u8],
    timeout: Duration,
) -> Result<ProcessOutput, ComputeError> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let start = Instant::now();
    let deadline = tokio::time::Instant::now() + timeout;
    let mut child = cmd.spawn()?;
    tracing::debug!(pid = child.id(), "Engine process spawned");

    // A failed write surfaces through the exit status.
    let stdin_task = child.stdin.take().map(|mut stdin| {
        let payload = payload.to_vec();
        tokio::spawn(async move {
            let _ = stdin.write_all(&payload).await;
        })
    });

    let mut stdout_task = tokio::spawn(read_stream(child.stdout.take()));
    let mut stderr_task = tokio::spawn(read_stream(child.stderr.take()));

    let abort_io = |stdout: &JoinHandle<Vec<u8>>, stderr: &JoinHandle<Vec<u8>>| {
        if let Some(task) = &stdin_task {
            task.abort();
        }
        stdout.abort();
        stderr.abort();
    };

    let status = match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            abort_io(&stdout_task, &stderr_task);
            return Err(ComputeError::Io(e));
        }
        Err(_elapsed) => {
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "Failed to kill timed-out engine process");
            }
            abort_io(&stdout_task, &stderr_task);
            return Err(ComputeError::Timeout {
                elapsed_ms: start.elapsed().as_millis() as u64,
            });
        }
    };
    let duration_ms = start.elapsed().as_millis() as u64;

    let drained = tokio::time::timeout_at(deadline, async {
        let stdout = (&mut stdout_task).await.unwrap_or_default();
        let stderr = (&mut stderr_task).await.unwrap_or_default();
        (stdout, stderr)
    })
    .await;

    match drained {
        Ok((stdout_bytes, stderr_bytes)) => Ok(ProcessOutput {
            stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
            exit_code: status.code().unwrap_or(-1),
            duration_ms,
        }),
        Err(_elapsed) => {
            tracing::warn!(
                exit_code = status.code().unwrap_or(-1),
                "Engine exited but its output stayed open past the timeout",
            );
            abort_io(&stdout_task, &stderr_task);
            Err(ComputeError::Timeout {
                elapsed_ms: start.elapsed().as_millis() as u64,
            })
        }
    }
}

/// Read an entire output stream into a byte buffer, capped at [`MAX_OUTPUT_BYTES`].
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
    }
    buf
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim_end();
    if trimmed.len() <= STDERR_TAIL_BYTES {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - STDERR_TAIL_BYTES;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// How to launch the engine program.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory for the child (inherits the service's if `None`).
    pub working_directory: Option<String>,
    /// Wall-clock budget for one run.
    pub timeout: Duration,
}

impl EngineConfig {
    /// Load the engine launch settings from environment variables.
    ///
    /// | Env Var               | Default            |
    /// |-----------------------|--------------------|
    /// | `ENGINE_PROGRAM`      | `python3`          |
    /// | `ENGINE_ARGS`         | `engine/run.py`    |
    /// | `ENGINE_WORKING_DIR`  | (unset)            |
    /// | `ENGINE_TIMEOUT_SECS` | `3600`             |
    ///
    /// `ENGINE_ARGS` is split on whitespace.
    pub fn from_env() -> Self {
        let program = std::env::var("ENGINE_PROGRAM").unwrap_or_else(|_| "python3".into());

        let args = std::env::var("ENGINE_ARGS")
            .unwrap_or_else(|_| "engine/run.py".into())
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let working_directory = std::env::var("ENGINE_WORKING_DIR")
            .ok()
            .filter(|dir| !dir.trim().is_empty());

        let timeout_secs: u64 = std::env::var("ENGINE_TIMEOUT_SECS")
            .unwrap_or_else(|_| "3600".into())
            .parse()
            .expect("ENGINE_TIMEOUT_SECS must be a valid u64");

        Self {
            program,
            args,
            working_directory,
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

/// Runs the engine program once per call.
///
/// The child receives `{"name": …, "config": {…}}` on stdin and the name in
/// `LABRUN_CONFIG_NAME`, and must print its result to stdout (see
/// [`parse_result`]).
#[derive(Debug, Clone)]
pub struct SubprocessEngine {
    config: EngineConfig,
}

impl SubprocessEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ComputeEngine for SubprocessEngine {
    async fn compute(&self, name: &str, config: &ResolvedConfig) -> Result<f64, ComputeError> {
        let payload = serde_json::to_vec(&serde_json::json!({
            "name": name,
            "config": config,
        }))
        .map_err(|e| ComputeError::Fault(format!("Failed to encode engine input: {e}")))?;

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args).env(CONFIG_NAME_ENV, name);
        if let Some(dir) = &self.config.working_directory {
            cmd.current_dir(dir);
        }

        let output = run_isolated(&mut cmd, &payload, self.config.timeout).await?;
        tracing::info!(
            config_name = name,
            exit_code = output.exit_code,
            duration_ms = output.duration_ms,
            "Engine process finished",
        );

        if output.exit_code != 0 {
            return Err(ComputeError::ExitStatus {
                exit_code: output.exit_code,
                stderr: stderr_tail(&output.stderr),
            });
        }

        parse_result(&output.stdout)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
