//! Source-control collaborator: read-only history queries plus workspace
//! checkouts. Never mutates upstream history.

use std::path::{Path, PathBuf};
use std::process::Output;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("git {action} failed (exit {code}): {stderr}")]
    Command {
        action: &'static str,
        code: i32,
        stderr: String,
    },
}

impl GitError {
    fn from_output(action: &'static str, output: &Output) -> Self {
        Self::Command {
            action,
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }
}

async fn git(action: &'static str, cwd: Option<&Path>, args: &[&str]) -> Result<Output, GitError> {
    let mut cmd = Command::new("git");
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.args(args).kill_on_drop(true);
    let output = cmd.output().await?;
    if !output.status.success() {
        return Err(GitError::from_output(action, &output));
    }
    Ok(output)
}

fn stdout_str(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Clone `url` into `dest`.
///
/// With a `reference` clone available, tries `--shared` first (git
/// alternates, nearly instant) and falls back to `--local` (hardlink copy):
/// large repositories can fail `--shared` under concurrent access.
pub async fn clone(
    url: &str,
    dest: &Path,
    shallow: bool,
    reference: Option<&Path>,
) -> Result<(), GitError> {
    let dest_str = dest.to_string_lossy().to_string();
    if let Some(reference) = reference {
        let ref_str = reference.to_string_lossy().to_string();
        let shared = git(
            "clone",
            None,
            &["clone", "--shared", "--no-checkout", &ref_str, &dest_str],
        )
        .await;
        if shared.is_ok() {
            return Ok(());
        }
        warn!(dest = %dest_str, "git clone --shared failed, falling back to --local");
        if dest.exists() {
            tokio::fs::remove_dir_all(dest).await?;
        }
        git(
            "clone",
            None,
            &["clone", "--local", "--no-checkout", &ref_str, &dest_str],
        )
        .await?;
        return Ok(());
    }

    let mut args = vec!["clone"];
    if shallow {
        args.extend(["--depth", "1"]);
    }
    args.extend([url, dest_str.as_str()]);
    git("clone", None, &args).await?;
    Ok(())
}

/// Check out a specific revision, fetching it first if the clone does not
/// already have it (shallow and shared clones often will not).
pub async fn checkout(repo: &Path, revision: &str) -> Result<(), GitError> {
    if git("checkout", Some(repo), &["checkout", revision])
        .await
        .is_ok()
    {
        return Ok(());
    }
    git(
        "fetch",
        Some(repo),
        &["fetch", "--depth", "1", "origin", revision],
    )
    .await?;
    git("checkout", Some(repo), &["checkout", revision]).await?;
    Ok(())
}

/// Full commit message for a revision.
pub async fn commit_message(repo: &Path, revision: &str) -> Result<String, GitError> {
    let output = git("log", Some(repo), &["log", "-1", "--format=%B", revision]).await?;
    Ok(stdout_str(&output))
}

/// Stage and commit everything as a baseline snapshot.
///
/// Called after stripping and treatment placement so that `diff_stats` only
/// measures changes made by the assistant, not by the harness. Signing is
/// disabled: global git config (e.g. hardware-key SSH signing) must not be
/// able to fail the commit.
pub async fn create_baseline_commit(repo: &Path) -> Result<(), GitError> {
    git("add", Some(repo), &["add", "-A"]).await?;
    // Nothing-to-commit exits non-zero and is fine.
    let mut cmd = Command::new("git");
    cmd.current_dir(repo)
        .args([
            "-c",
            "commit.gpgsign=false",
            "-c",
            "user.name=replay-harness",
            "-c",
            "user.email=harness@localhost",
            "commit",
            "--allow-empty",
            "-m",
            "replay-harness baseline",
        ])
        .kill_on_drop(true);
    let _ = cmd.output().await?;
    Ok(())
}

/// Uncommitted-change statistics for a workspace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffStats {
    pub lines_changed: u64,
    pub files_changed: u64,
    pub files: Vec<String>,
}

static CONTEXT_FILE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(^|/)(AGENTS\.md|CLAUDE\.md|\.github/|\.claude/|\.cursor/|\.cursorrules)")
        .expect("context file pattern")
});

/// True for AI context files the harness itself plants; those never count
/// as assistant work product.
pub fn is_context_file(path: &str) -> bool {
    CONTEXT_FILE_RE.is_match(path)
}

/// Diff stats for tracked + untracked changes since the baseline commit.
///
/// Stages everything first so files the assistant created show up, then
/// reads `--cached --numstat` against HEAD. Binary files report `-` counts
/// and contribute zero lines.
pub async fn diff_stats(repo: &Path) -> Result<DiffStats, GitError> {
    git("add", Some(repo), &["add", "-A"]).await?;

    let names = git(
        "diff",
        Some(repo),
        &["diff", "--cached", "--name-only", "HEAD"],
    )
    .await?;
    let files: Vec<String> = stdout_str(&names)
        .lines()
        .filter(|f| !f.is_empty() && !is_context_file(f))
        .map(str::to_string)
        .collect();

    let mut lines_changed = 0u64;
    if !files.is_empty() {
        let numstat = git(
            "diff",
            Some(repo),
            &["diff", "--cached", "--numstat", "HEAD"],
        )
        .await?;
        for line in stdout_str(&numstat).lines() {
            let mut parts = line.split('\t');
            let (Some(added), Some(deleted), Some(path)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            if is_context_file(path) {
                continue;
            }
            lines_changed += added.parse::<u64>().unwrap_or(0);
            lines_changed += deleted.parse::<u64>().unwrap_or(0);
        }
    }

    Ok(DiffStats {
        lines_changed,
        files_changed: files.len() as u64,
        files,
    })
}

/// Contents of `path` as of `revision`, without touching the working tree.
pub async fn show_file(repo: &Path, revision: &str, path: &str) -> Result<String, GitError> {
    let spec = format!("{revision}:{path}");
    let output = git("show", Some(repo), &["show", &spec]).await?;
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// `git log --format=<fmt> -<n>` lines for the scanner.
pub async fn log_lines(
    repo: &Path,
    format: &str,
    max_count: usize,
    since: Option<&str>,
) -> Result<Vec<String>, GitError> {
    let fmt = format!("--format={format}");
    let count = format!("-{max_count}");
    let since_arg = since.map(|s| format!("--since={s}"));
    let mut args = vec!["log", fmt.as_str(), count.as_str()];
    if let Some(since_arg) = since_arg.as_deref() {
        args.push(since_arg);
    }
    let output = git("log", Some(repo), &args).await?;
    Ok(stdout_str(&output).lines().map(str::to_string).collect())
}

/// Resolve `<revision>^`, or `None` for a root commit.
pub async fn parent_revision(repo: &Path, revision: &str) -> Result<Option<String>, GitError> {
    let spec = format!("{revision}^");
    match git("rev-parse", Some(repo), &["rev-parse", &spec]).await {
        Ok(output) => Ok(Some(stdout_str(&output))),
        Err(GitError::Command { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Shortstat summary for one commit against its parent.
pub async fn commit_shortstat(repo: &Path, revision: &str) -> Result<String, GitError> {
    let parent = format!("{revision}^");
    let output = git(
        "diff",
        Some(repo),
        &["diff", "--shortstat", &parent, revision],
    )
    .await?;
    Ok(stdout_str(&output))
}

/// Paths touched by one commit.
pub async fn commit_files(repo: &Path, revision: &str) -> Result<Vec<String>, GitError> {
    let parent = format!("{revision}^");
    let output = git(
        "diff",
        Some(repo),
        &["diff", "--name-only", &parent, revision],
    )
    .await?;
    Ok(stdout_str(&output).lines().map(str::to_string).collect())
}

/// Absolute path form used for workspace binds and reference clones.
pub fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}
