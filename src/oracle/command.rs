//! Oracle backed by a local CLI process (default `claude`).
//!
//! The request goes to the child's stdin. Structured requests add
//! `--output-format json`, and the CLI's `{"result": ...}` envelope is
//! unwrapped here so callers only see the model's text.

use super::{Oracle, OracleFuture, OutputShape};
use crate::error::OracleError;
use crate::util::truncate;
use regex::Regex;
use serde::Deserialize;
use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// stderr/stdout fragments that mean the CLI is not logged in.
const AUTH_MARKERS: &[&str] = &[
    "not logged in",
    "please run /login",
    "invalid api key",
    "authentication failed",
    "authentication_error",
    "unauthorized",
];

const RATE_LIMIT_MARKERS: &[&str] = &["rate limit", "rate_limit", "too many requests", "overloaded"];

const TOO_LARGE_MARKERS: &[&str] = &[
    "prompt is too long",
    "too large",
    "context length",
    "context_length_exceeded",
];

/// A bare HTTP status in CLI output. Digits inside ids or counts do not match.
fn status_code(lower: &str) -> Option<u16> {
    static STATUS: OnceLock<Option<Regex>> = OnceLock::new();
    let re = STATUS
        .get_or_init(|| Regex::new(r"\b(401|403|413|429)\b").ok())
        .as_ref()?;
    re.captures(lower)?.get(1)?.as_str().parse().ok()
}

#[derive(Debug, Deserialize)]
struct CliEnvelope {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
}

pub struct CommandOracle {
    command: String,
    model: Option<String>,
    timeout: Duration,
}

impl CommandOracle {
    pub fn new(command: impl Into<String>, model: Option<String>, timeout_secs: u64) -> Self {
        Self {
            command: command.into(),
            model,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    fn build_command(&self, shape: OutputShape) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.arg("-p");
        if shape == OutputShape::Structured {
            cmd.args(["--output-format", "json"]);
        }
        if let Some(model) = self.model.as_deref() {
            cmd.args(["--model", model]);
        }
        // Dropping the child on timeout or cancellation kills it.
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, request: &str, shape: OutputShape) -> Result<String, OracleError> {
        let mut child = self.build_command(shape).spawn().map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                OracleError::NotFound {
                    command: self.command.clone(),
                }
            } else {
                OracleError::Process(format!("failed to start '{}': {}", self.command, err))
            }
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A child that exits early closes stdin; its exit status reports why.
            let _ = stdin.write_all(request.as_bytes()).await;
            drop(stdin);
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => return Err(OracleError::Process(err.to_string())),
            Err(_) => {
                return Err(OracleError::Timeout {
                    secs: self.timeout.as_secs(),
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            let detail = if stderr.trim().is_empty() { &stdout } else { &stderr };
            return Err(classify_failure(
                detail,
                output.status.code(),
                self.timeout.as_secs(),
            ));
        }

        if shape == OutputShape::Structured {
            return unwrap_envelope(&stdout, self.timeout.as_secs());
        }
        Ok(stdout)
    }
}

impl Oracle for CommandOracle {
    fn invoke<'a>(&'a self, request: &'a str, shape: OutputShape) -> OracleFuture<'a> {
        Box::pin(self.run(request, shape))
    }

    fn name(&self) -> &str {
        &self.command
    }
}

/// Unwrap the CLI's JSON envelope. Output that is not an envelope is passed
/// through for the decoder to handle.
fn unwrap_envelope(stdout: &str, timeout_secs: u64) -> Result<String, OracleError> {
    let envelope: CliEnvelope = match serde_json::from_str(stdout.trim()) {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!(error = %err, "oracle output is not a CLI envelope; passing through");
            return Ok(stdout.to_string());
        }
    };
    let result = envelope.result.unwrap_or_default();
    if envelope.is_error {
        return Err(classify_failure(&result, None, timeout_secs));
    }
    Ok(result)
}

/// Map CLI failure text to an error category.
///
/// Recoverable categories are checked first: a rate-limit message that also
/// mentions an auth word must not abort the run.
pub(crate) fn classify_failure(
    detail: &str,
    exit_code: Option<i32>,
    timeout_secs: u64,
) -> OracleError {
    let lower = detail.to_lowercase();
    let summary = truncate(detail.trim(), 300);
    let code = status_code(&lower);
    if code == Some(429) || RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
        return OracleError::RateLimited(summary);
    }
    if code == Some(413) || TOO_LARGE_MARKERS.iter().any(|m| lower.contains(m)) {
        return OracleError::PayloadTooLarge(summary);
    }
    if matches!(code, Some(401) | Some(403)) || AUTH_MARKERS.iter().any(|m| lower.contains(m)) {
        return OracleError::Auth(summary);
    }
    if lower.contains("timed out") || lower.contains("timeout") {
        return OracleError::Timeout { secs: timeout_secs };
    }
    match exit_code {
        Some(code) => OracleError::Process(format!("exit code {}: {}", code, summary)),
        None => OracleError::Process(summary),
    }
}
