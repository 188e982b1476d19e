//! Assistant invocation boundary.
//!
//! The coding assistant is an external CLI collaborator. Its output arrives
//! in one of two observed shapes — a single result object with aggregate
//! usage, or a list of message events with per-message usage and `tool_use`
//! blocks. Both are normalized into one canonical [`AssistantUsage`] here,
//! before anything downstream looks at them; output matching neither shape
//! is a protocol error and becomes a trial `error` outcome.

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Prompts above this size go over stdin: huge failing-test output can push
/// the combined argv+env past the OS limit.
const PROMPT_ARG_MAX_BYTES: usize = 100_000;

#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("assistant output matched neither known shape: {0}")]
    Protocol(String),
    #[error("assistant produced no work (exit {exit_code}): {detail}")]
    EmptyRun { exit_code: i32, detail: String },
}

/// Canonical usage metrics, identical for both output shapes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistantUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tool_calls: u64,
    pub cost_usd: f64,
    pub num_turns: u64,
}

impl AssistantUsage {
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0 && self.tool_calls == 0
    }
}

/// Result of one assistant invocation.
#[derive(Debug, Clone)]
pub struct AssistantOutcome {
    pub exit_code: i32,
    pub wall_time: Duration,
    pub usage: AssistantUsage,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
}

/// The invocation contract the orchestrator depends on.
#[async_trait]
pub trait Assistant: Send + Sync {
    async fn invoke(
        &self,
        workspace: &Path,
        prompt: &str,
        timeout: Duration,
    ) -> Result<AssistantOutcome, AssistantError>;
}

/// Normalize raw assistant stdout into canonical usage.
///
/// Shape 1: a list of message events. Token usage is summed across events;
/// tool calls are counted from `tool_use` content blocks.
///
/// Shape 2: a single result object with a `usage` map. Input tokens sum the
/// plain, cache-read, and cache-creation counts — the assistant caches
/// prompts aggressively, so `input_tokens` alone badly undercounts.
pub fn normalize_output(stdout: &str) -> Result<AssistantUsage, AssistantError> {
    let value: Value = serde_json::from_str(stdout.trim())
        .map_err(|e| AssistantError::Protocol(format!("not JSON: {e}")))?;

    match value {
        Value::Array(events) => Ok(usage_from_events(&events)),
        Value::Object(ref map) => {
            let usage = map
                .get("usage")
                .and_then(Value::as_object)
                .ok_or_else(|| AssistantError::Protocol("result object has no usage".into()))?;

            let input_tokens = ["input_tokens", "cache_read_input_tokens", "cache_creation_input_tokens"]
                .iter()
                .map(|k| usage.get(*k).and_then(Value::as_u64).unwrap_or(0))
                .sum();
            let num_turns = map.get("num_turns").and_then(Value::as_u64).unwrap_or(0);
            let tool_calls = map
                .get("tool_calls")
                .and_then(Value::as_array)
                .map(|calls| calls.len() as u64)
                .unwrap_or(num_turns);

            Ok(AssistantUsage {
                input_tokens,
                output_tokens: usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
                tool_calls,
                cost_usd: map
                    .get("total_cost_usd")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0),
                num_turns,
            })
        }
        other => Err(AssistantError::Protocol(format!(
            "top-level JSON is {}, expected object or array",
            type_name(&other)
        ))),
    }
}

fn usage_from_events(events: &[Value]) -> AssistantUsage {
    let mut usage = AssistantUsage::default();
    for event in events {
        let Some(map) = event.as_object() else {
            continue;
        };
        if let Some(u) = map.get("usage").and_then(Value::as_object) {
            usage.input_tokens += u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
            usage.output_tokens += u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
        }
        if let Some(content) = map.get("content").and_then(Value::as_array) {
            usage.tool_calls += content
                .iter()
                .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_use"))
                .count() as u64;
        }
    }
    usage
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Which context files the assistant read, recovered from the message-event
/// shape. Best-effort: absent or single-object output yields an empty list.
pub fn context_files_read(stdout: &str, workspace: &Path) -> Vec<String> {
    let Ok(Value::Array(events)) = serde_json::from_str::<Value>(stdout.trim()) else {
        return Vec::new();
    };
    let prefix = workspace.to_string_lossy().to_string();
    let mut files = std::collections::BTreeSet::new();
    for event in &events {
        let Some(content) = event.get("content").and_then(Value::as_array) else {
            continue;
        };
        for block in content {
            if block.get("type").and_then(Value::as_str) != Some("tool_use")
                || block.get("name").and_then(Value::as_str) != Some("Read")
            {
                continue;
            }
            let Some(path) = block
                .get("input")
                .and_then(|i| i.get("file_path"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            if path.ends_with("AGENTS.md") || path.ends_with("CLAUDE.md") {
                let rel = path
                    .strip_prefix(&prefix)
                    .map(|p| p.trim_start_matches('/'))
                    .unwrap_or(path);
                files.insert(rel.to_string());
            }
        }
    }
    files.into_iter().collect()
}

/// CLI-based assistant (claude by default).
#[derive(Debug, Clone)]
pub struct CliAssistant {
    pub program: String,
    pub model: Option<String>,
    pub max_turns: u32,
}

impl Default for CliAssistant {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            model: None,
            max_turns: 50,
        }
    }
}

impl CliAssistant {
    pub fn with_model(model: Option<String>) -> Self {
        Self {
            model,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Assistant for CliAssistant {
    async fn invoke(
        &self,
        workspace: &Path,
        prompt: &str,
        timeout: Duration,
    ) -> Result<AssistantOutcome, AssistantError> {
        let mut cmd = Command::new(&self.program);
        cmd.current_dir(workspace)
            .args(["--print", "--output-format", "json"])
            .args(["--max-turns", &self.max_turns.to_string()])
            .arg("--dangerously-skip-permissions")
            .env("CLAUDE_NO_TELEMETRY", "1")
            // Allow running from within an assistant session.
            .env_remove("CLAUDECODE")
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(model) = &self.model {
            cmd.args(["--model", model]);
        }

        let via_stdin = prompt.len() >= PROMPT_ARG_MAX_BYTES;
        if via_stdin {
            cmd.stdin(std::process::Stdio::piped());
        } else {
            cmd.arg(prompt);
            cmd.stdin(std::process::Stdio::null());
        }

        let start = Instant::now();
        let mut child = cmd.spawn()?;
        if via_stdin {
            if let Some(mut stdin) = child.stdin.take() {
                // Broken pipe means the process already exited; the exit
                // status will tell the rest of the story.
                let _ = stdin.write_all(prompt.as_bytes()).await;
            }
        }

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let exit_code = output.status.code().unwrap_or(-1);
                let usage = normalize_output(&stdout)?;
                debug!(
                    tool_calls = usage.tool_calls,
                    output_tokens = usage.output_tokens,
                    "assistant invocation finished"
                );
                Ok(AssistantOutcome {
                    exit_code,
                    wall_time: start.elapsed(),
                    usage,
                    timed_out: false,
                    stdout,
                    stderr,
                })
            }
            Err(_elapsed) => Ok(AssistantOutcome {
                exit_code: -1,
                wall_time: start.elapsed(),
                usage: AssistantUsage::default(),
                timed_out: true,
                stdout: String::new(),
                stderr: "assistant timed out".to_string(),
            }),
        }
    }
}
