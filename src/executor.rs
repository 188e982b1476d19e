//! Isolated executor: run one command in a fresh, resource-bounded sandbox
//! bound to exactly one workspace directory.
//!
//! Timeout is a *result*, not an error — a hung test or a slow assistant is
//! an expected experimental outcome, so `run` reports `timed_out` instead of
//! failing. The process tree is force-stopped when the bound is hit.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::git::absolutize;

/// Label attached to every container this harness starts, so an interrupted
/// run's leftovers can be found and removed on the next startup.
pub const SANDBOX_LABEL: &str = "replay-harness=1";

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sandbox runtime error: {0}")]
    Runtime(String),
}

/// Memory/CPU bounds for one sandbox invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory: String,
    pub cpus: String,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: "4g".to_string(),
            cpus: "2".to_string(),
        }
    }
}

/// One command to run inside a sandbox.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub command: String,
    pub workspace: PathBuf,
    pub limits: ResourceLimits,
    pub timeout: Duration,
}

/// Captured result of a sandboxed command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    fn timed_out() -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: "command timed out".to_string(),
            timed_out: true,
        }
    }
}

/// The sandbox-runtime contract the core depends on. Implementations must
/// not leak state between invocations beyond the bound workspace.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn run(&self, spec: ExecSpec) -> Result<ExecResult, ExecError>;
}

/// Docker-backed sandbox: fresh `--rm` container per invocation, workspace
/// bind-mounted at `/work`.
#[derive(Debug, Clone)]
pub struct DockerSandbox {
    pub image: String,
    /// Named volume mounted at `/root/.cache` so package downloads survive
    /// across containers. `None` disables it.
    pub cache_volume: Option<String>,
}

impl DockerSandbox {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            cache_volume: Some("replay-harness-pkgcache".to_string()),
        }
    }

    fn build_args(&self, spec: &ExecSpec) -> Vec<String> {
        let workspace = absolutize(&spec.workspace);
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--label".to_string(),
            SANDBOX_LABEL.to_string(),
            "-v".to_string(),
            format!("{}:/work", workspace.display()),
        ];
        if let Some(volume) = &self.cache_volume {
            args.push("-v".to_string());
            args.push(format!("{volume}:/root/.cache"));
        }
        args.extend([
            "-w".to_string(),
            "/work".to_string(),
            "--network".to_string(),
            "host".to_string(),
            "--memory".to_string(),
            spec.limits.memory.clone(),
            "--cpus".to_string(),
            spec.limits.cpus.clone(),
            self.image.clone(),
            "sh".to_string(),
            "-c".to_string(),
            spec.command.clone(),
        ]);
        args
    }

    /// Remove labeled containers left behind by a previous abnormal
    /// termination. Called once at run startup; failures are logged, not
    /// fatal — a missing docker binary just means nothing to sweep.
    pub async fn sweep_orphans() {
        let ps = Command::new("docker")
            .args(["ps", "-q", "--filter", &format!("label={SANDBOX_LABEL}")])
            .kill_on_drop(true)
            .output()
            .await;
        let ids: Vec<String> = match ps {
            Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
                .lines()
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            Ok(output) => {
                warn!(
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "orphan sweep: docker ps failed"
                );
                return;
            }
            Err(e) => {
                debug!(error = %e, "orphan sweep skipped: docker unavailable");
                return;
            }
        };
        if ids.is_empty() {
            return;
        }
        warn!(count = ids.len(), "removing orphaned sandbox containers");
        let mut args = vec!["rm".to_string(), "-f".to_string()];
        args.extend(ids);
        if let Err(e) = Command::new("docker")
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
        {
            warn!(error = %e, "orphan sweep: docker rm failed");
        }
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn run(&self, spec: ExecSpec) -> Result<ExecResult, ExecError> {
        let args = self.build_args(&spec);
        run_bounded("docker", &args, None, spec.timeout).await
    }
}

/// Unsandboxed fallback: `sh -c` directly in the workspace. Same contract,
/// no isolation — used by tests and explicit `--no-sandbox` runs.
#[derive(Debug, Clone, Default)]
pub struct ProcessSandbox;

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn run(&self, spec: ExecSpec) -> Result<ExecResult, ExecError> {
        let args = vec!["-c".to_string(), spec.command.clone()];
        run_bounded("sh", &args, Some(&spec.workspace), spec.timeout).await
    }
}

/// Spawn, capture output, and force-stop the child when `timeout` elapses.
async fn run_bounded(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<ExecResult, ExecError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let child = cmd.spawn()?;
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output?;
            Ok(ExecResult {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                timed_out: false,
            })
        }
        // wait_with_output consumed the child; kill_on_drop tears the
        // process tree down when the future is dropped here.
        Err(_elapsed) => Ok(ExecResult::timed_out()),
    }
}
