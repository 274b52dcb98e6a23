//! The external numerical engine and how its result is read back.
//!
//! [`ComputeEngine`] is the seam between the job runner and whatever
//! produces an experiment's scalar outcome. The production implementation,
//! [`subprocess::SubprocessEngine`], starts a fresh child process for every
//! run so a crash or hang inside the engine never touches the service.

pub mod subprocess;

use async_trait::async_trait;
use serde_json::Value;

use crate::config_tree::ResolvedConfig;

/// Evaluates one resolved configuration to a scalar result.
#[async_trait]
pub trait ComputeEngine: Send + Sync {
    /// Run the experiment described by `config`. `name` is the configuration
    /// name the engine may use to label its own artifacts.
    async fn compute(&self, name: &str, config: &ResolvedConfig) -> Result<f64, ComputeError>;
}

/// Ways an isolated engine run can fail.
#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    /// The worker process could not be started or communicated with.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The worker exceeded its time budget and was killed.
    #[error("Engine timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// The worker exited non-zero (`-1` when killed by a signal).
    #[error("Engine exited with code {exit_code}: {stderr}")]
    ExitStatus { exit_code: i32, stderr: String },

    /// The worker exited cleanly but its output carried no number.
    #[error("Engine produced no numeric result: {0}")]
    InvalidOutput(String),

    /// The engine reported a fault of its own.
    #[error("Engine fault: {0}")]
    Fault(String),
}

/// Extract the result from an engine's stdout.
///
/// Accepted forms, tried on the whole output and then on its last non-empty
/// line: a JSON number, a JSON object with a numeric `result` (or a string
/// `error`, reported as [`ComputeError::Fault`]), or a bare float such as
/// `0.42` or `nan`.
pub fn parse_result(stdout: &str) -> Result<f64, ComputeError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(ComputeError::InvalidOutput("empty output".into()));
    }

    if let Some(result) = json_result(trimmed) {
        return result;
    }

    let last = trimmed
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or(trimmed);

    if let Some(result) = json_result(last) {
        return result;
    }

    last.parse::<f64>()
        .map_err(|_| ComputeError::InvalidOutput(format!("cannot parse '{last}' as a number")))
}

/// Text form of a result as stored on the job record.
///
/// Integral values keep one decimal (`5.0`), non-finite values use
/// lower-case names (`nan`, `inf`, `-inf`).
pub fn format_result(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "inf" } else { "-inf" }.to_string()
    } else if value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

fn json_result(text: &str) -> Option<Result<f64, ComputeError>> {
    match serde_json::from_str::<Value>(text).ok()? {
        Value::Number(n) => n.as_f64().map(Ok),
        Value::Object(map) => {
            if let Some(Value::String(msg)) = map.get("error") {
                return Some(Err(ComputeError::Fault(msg.clone())));
            }
            map.get("result").and_then(Value::as_f64).map(Ok)
        }
        _ => None,
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
