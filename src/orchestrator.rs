//! Trial orchestrator: drives one (trial, condition) pair through its
//! stage machine.
//!
//! `ACQUIRE_WORKSPACE → CHECKOUT → SETUP → TREATMENT → INVOKE_ASSISTANT →
//! VERIFY → RECORD → RELEASE`, with a terminal failure reachable from any
//! stage. Infrastructure failures never escape [`run_trial`] — they become
//! a `RunRecord` with outcome `error`, so one broken trial cannot sink a
//! batch. A `fail` outcome is reserved for the assistant genuinely not
//! fixing the bug; it is a measured result and is never retried.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, OnceCell, Semaphore};
use tracing::{info, warn};

use crate::assistant::{Assistant, AssistantUsage};
use crate::cache::{
    ArtifactFile, ArtifactStore, CacheError, CacheOutcome, Fingerprint, TREATMENT_VERSION,
};
use crate::executor::{ExecSpec, ResourceLimits, Sandbox};
use crate::git::{self, DiffStats};
use crate::prompt;
use crate::trial::{Condition, PromptSource, RepoConfig, Trial};

/// Cap on stored test output; full logs stay in the workspace, the record
/// only needs enough to eyeball.
const TEST_OUTPUT_CAP: usize = 2000;

// =============================================================================
// Records
// =============================================================================

/// Terminal outcome of one (trial, condition) execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The assistant's fix made the verification tests pass.
    Pass,
    /// The assistant attempted a fix and the tests still fail.
    Fail,
    /// The harness malfunctioned; this tells us nothing about the assistant.
    Error,
}

impl Outcome {
    /// Pass and fail are experimental results and survive a resume; errors
    /// are re-executed.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Pass | Self::Fail)
    }
}

/// Immutable result of one (trial, condition) execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub trial_id: String,
    pub condition: Condition,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub wall_time_seconds: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tool_calls: u64,
    pub lines_changed: u64,
    #[serde(default)]
    pub files_touched: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub treatment_cache_hit: Option<bool>,
    #[serde(default)]
    pub test_output: String,
    pub recorded_at: String,
}

impl RunRecord {
    fn error_record(trial: &Trial, condition: Condition, stage: Stage, message: String) -> Self {
        Self {
            trial_id: trial.id.clone(),
            condition,
            outcome: Outcome::Error,
            error: Some(format!("[{}] {}", stage.as_str(), message)),
            wall_time_seconds: 0.0,
            input_tokens: 0,
            output_tokens: 0,
            tool_calls: 0,
            lines_changed: 0,
            files_touched: Vec::new(),
            artifact_fingerprint: None,
            treatment_cache_hit: None,
            test_output: String::new(),
            recorded_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Pipeline stage names, used for progress logging and error tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    AcquireWorkspace,
    Checkout,
    Setup,
    Treatment,
    InvokeAssistant,
    Verify,
    Record,
    Release,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AcquireWorkspace => "acquire_workspace",
            Self::Checkout => "checkout",
            Self::Setup => "setup",
            Self::Treatment => "treatment",
            Self::InvokeAssistant => "invoke_assistant",
            Self::Verify => "verify",
            Self::Record => "record",
            Self::Release => "release",
        }
    }
}

// =============================================================================
// Workspaces
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("workspace pool closed")]
    PoolClosed,
}

/// Bounded pool of workspace directories. Each workspace is exclusively
/// owned by one (trial, condition) execution for its lifetime.
#[derive(Clone)]
pub struct WorkspacePool {
    root: PathBuf,
    slots: Arc<Semaphore>,
    retain: bool,
}

impl WorkspacePool {
    pub fn new(root: impl Into<PathBuf>, capacity: usize, retain: bool) -> Self {
        Self {
            root: root.into(),
            slots: Arc::new(Semaphore::new(capacity.max(1))),
            retain,
        }
    }

    /// Remove leftover workspace directories from a previous abnormal
    /// termination. Called once before scheduling.
    pub fn sweep_orphans(&self) -> std::io::Result<usize> {
        if !self.root.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            warn!(count = removed, "swept orphaned workspaces");
        }
        Ok(removed)
    }

    /// Block until a slot frees up, then hand out a fresh directory.
    pub async fn acquire(&self, name: &str) -> Result<Workspace, WorkspaceError> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkspaceError::PoolClosed)?;
        let path = self.root.join(name);
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        std::fs::create_dir_all(&path)?;
        Ok(Workspace {
            path,
            retain: self.retain,
            _permit: permit,
        })
    }
}

/// An exclusively owned workspace directory plus its pool slot.
pub struct Workspace {
    path: PathBuf,
    retain: bool,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Scoped teardown: remove the directory (unless retention is on) and
    /// free the slot.
    pub async fn release(self) {
        if self.retain {
            return;
        }
        let path = self.path.clone();
        let result = tokio::task::spawn_blocking(move || std::fs::remove_dir_all(&path)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "workspace removal failed"),
            Err(e) => warn!(error = %e, "workspace removal task failed"),
        }
    }
}

// =============================================================================
// Pre-validation sharing
// =============================================================================

/// Pre-validation (sandbox setup + confirming the test fails at the pre-fix
/// revision) is identical across conditions of the same trial, so the first
/// condition to arrive runs it and the rest share the result.
#[derive(Clone, Default)]
pub struct PrevalidationCache {
    cells: Arc<Mutex<HashMap<String, Arc<OnceCell<Result<Option<String>, String>>>>>>,
}

impl PrevalidationCache {
    pub async fn get_or_run<F, Fut>(&self, trial_id: &str, run: F) -> Result<Option<String>, String>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Option<String>, String>>,
    {
        let cell = {
            let mut cells = self.cells.lock().await;
            cells.entry(trial_id.to_string()).or_default().clone()
        };
        cell.get_or_init(run).await.clone()
    }
}

// =============================================================================
// Context & policies
// =============================================================================

/// Stage timeouts. Pre-validation and verification bound sandboxed test
/// runs; treatment and assistant bound CLI invocations.
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub pre_validation: Duration,
    pub verification: Duration,
    pub assistant: Duration,
    pub treatment_build: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            pre_validation: Duration::from_secs(180),
            verification: Duration::from_secs(180),
            assistant: Duration::from_secs(300),
            treatment_build: Duration::from_secs(900),
        }
    }
}

/// Bounded backoff for transient infrastructure failures only.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff * 2u32.saturating_pow(attempt)
    }
}

/// Everything a trial execution needs, passed explicitly — there is no
/// process-wide session state.
pub struct TrialContext {
    pub repo: RepoConfig,
    pub workspaces: WorkspacePool,
    pub store: ArtifactStore,
    pub sandbox: Arc<dyn Sandbox>,
    pub assistant: Arc<dyn Assistant>,
    pub prevalidation: PrevalidationCache,
    pub timeouts: Timeouts,
    pub retry: RetryPolicy,
    pub limits: ResourceLimits,
    /// Local clone used as a `--reference` for fast workspace clones.
    pub reference_clone: Option<PathBuf>,
    pub cancel: watch::Receiver<bool>,
}

impl TrialContext {
    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn exec_spec(&self, workspace: &Path, command: String, timeout: Duration) -> ExecSpec {
        ExecSpec {
            command,
            workspace: workspace.to_path_buf(),
            limits: self.limits.clone(),
            timeout,
        }
    }
}

// =============================================================================
// The state machine
// =============================================================================

/// Execute one (trial, condition) pair to a terminal record.
///
/// Never returns an error: every failure mode is folded into the record's
/// outcome. The workspace is released on every exit path.
pub async fn run_trial(ctx: &TrialContext, trial: &Trial, condition: Condition) -> RunRecord {
    if ctx.cancelled() {
        return RunRecord::error_record(
            trial,
            condition,
            Stage::AcquireWorkspace,
            "run cancelled".to_string(),
        );
    }

    info!(trial = %trial.id, condition = %condition, stage = Stage::AcquireWorkspace.as_str(), "starting");
    let workspace = match ctx.workspaces.acquire(&workspace_name(ctx, trial, condition)).await {
        Ok(ws) => ws,
        Err(e) => {
            return RunRecord::error_record(trial, condition, Stage::AcquireWorkspace, e.to_string())
        }
    };

    let record = run_stages(ctx, trial, condition, workspace.path()).await;

    info!(trial = %trial.id, condition = %condition, stage = Stage::Release.as_str(), outcome = ?record.outcome, "finished");
    workspace.release().await;
    record
}

fn workspace_name(ctx: &TrialContext, trial: &Trial, condition: Condition) -> String {
    // Trials can share a pre-fix revision, so the id hash keeps names unique.
    let id_hex = blake3::hash(trial.id.as_bytes()).to_hex();
    let id_hash = &id_hex[..8];
    format!(
        "{}-{}-{}-{}",
        ctx.repo.slug(),
        &trial.pre_fix_revision[..trial.pre_fix_revision.len().min(8)],
        id_hash,
        condition
    )
}

/// All stages between acquisition and release. Early-returns produce error
/// records; the caller owns teardown.
async fn run_stages(
    ctx: &TrialContext,
    trial: &Trial,
    condition: Condition,
    workspace: &Path,
) -> RunRecord {
    // --- CHECKOUT ---
    info!(trial = %trial.id, condition = %condition, stage = Stage::Checkout.as_str(), revision = %trial.pre_fix_revision, "checking out");
    if let Err(e) = checkout_pre_fix(ctx, trial, workspace).await {
        return RunRecord::error_record(trial, condition, Stage::Checkout, e.to_string());
    }

    if ctx.cancelled() {
        return RunRecord::error_record(trial, condition, Stage::Setup, "run cancelled".to_string());
    }

    // --- SETUP ---
    info!(trial = %trial.id, condition = %condition, stage = Stage::Setup.as_str(), "preparing workspace");
    let pre_validation_output = match setup_workspace(ctx, trial, workspace).await {
        Ok(output) => output,
        Err(e) => return RunRecord::error_record(trial, condition, Stage::Setup, e),
    };

    if ctx.cancelled() {
        return RunRecord::error_record(
            trial,
            condition,
            Stage::Treatment,
            "run cancelled".to_string(),
        );
    }

    // --- TREATMENT ---
    let mut artifact_fingerprint = None;
    let mut treatment_cache_hit = None;
    if condition.needs_artifact() {
        info!(trial = %trial.id, condition = %condition, stage = Stage::Treatment.as_str(), "resolving context artifact");
        match apply_treatment(ctx, trial, condition, workspace).await {
            Ok(outcome) => {
                artifact_fingerprint = Some(outcome.artifact.fingerprint.clone());
                treatment_cache_hit = Some(outcome.cache_hit);
            }
            Err(e) => {
                return RunRecord::error_record(trial, condition, Stage::Treatment, e.to_string())
            }
        }
    }

    // Snapshot so diff stats measure only assistant work.
    if let Err(e) = git::create_baseline_commit(workspace).await {
        return RunRecord::error_record(trial, condition, Stage::Treatment, e.to_string());
    }

    if ctx.cancelled() {
        return RunRecord::error_record(
            trial,
            condition,
            Stage::InvokeAssistant,
            "run cancelled".to_string(),
        );
    }

    // --- INVOKE_ASSISTANT ---
    info!(trial = %trial.id, condition = %condition, stage = Stage::InvokeAssistant.as_str(), "invoking assistant");
    let fix_prompt = match build_fix_prompt(trial, condition, workspace, pre_validation_output).await
    {
        Ok(p) => p,
        Err(e) => return RunRecord::error_record(trial, condition, Stage::InvokeAssistant, e),
    };

    let invocation = ctx
        .assistant
        .invoke(workspace, &fix_prompt, ctx.timeouts.assistant)
        .await;
    let (usage, wall_time) = match invocation {
        Ok(outcome) if outcome.timed_out => {
            let mut record = RunRecord::error_record(
                trial,
                condition,
                Stage::InvokeAssistant,
                format!(
                    "assistant timed out after {:.1}s",
                    outcome.wall_time.as_secs_f64()
                ),
            );
            record.wall_time_seconds = outcome.wall_time.as_secs_f64();
            return record;
        }
        Ok(outcome) if outcome.usage.is_empty() => {
            return RunRecord::error_record(
                trial,
                condition,
                Stage::InvokeAssistant,
                format!(
                    "assistant produced no work (exit {}, stderr: {})",
                    outcome.exit_code,
                    snippet(&outcome.stderr, 200)
                ),
            );
        }
        Ok(outcome) => (outcome.usage, outcome.wall_time),
        Err(e) => {
            return RunRecord::error_record(trial, condition, Stage::InvokeAssistant, e.to_string())
        }
    };

    // --- VERIFY ---
    // Cancellation does not skip verification: the assistant already ran,
    // so abandoning now would waste a measurable outcome.
    info!(trial = %trial.id, condition = %condition, stage = Stage::Verify.as_str(), "running verification tests");
    let verification = ctx
        .sandbox
        .run(ctx.exec_spec(
            workspace,
            ctx.repo.sandbox.verification_command(trial),
            ctx.timeouts.verification,
        ))
        .await;
    let verification = match verification {
        Ok(result) => result,
        Err(e) => return RunRecord::error_record(trial, condition, Stage::Verify, e.to_string()),
    };
    if verification.timed_out {
        let mut record = RunRecord::error_record(
            trial,
            condition,
            Stage::Verify,
            "verification timed out".to_string(),
        );
        record.wall_time_seconds = wall_time.as_secs_f64();
        return record;
    }

    let test_output = format!("{}{}", verification.stdout, verification.stderr);
    let outcome = if verification_passed(verification.exit_code, &test_output) {
        Outcome::Pass
    } else {
        Outcome::Fail
    };

    let diff = git::diff_stats(workspace).await.unwrap_or_else(|e| {
        warn!(trial = %trial.id, error = %e, "diff stats failed; reporting zeros");
        DiffStats::default()
    });

    finish_record(
        trial,
        condition,
        outcome,
        usage,
        wall_time,
        diff,
        test_output,
        artifact_fingerprint,
        treatment_cache_hit,
    )
}

fn verification_passed(exit_code: i32, output: &str) -> bool {
    exit_code == 0 && !output.contains("no tests ran")
}

#[allow(clippy::too_many_arguments)]
fn finish_record(
    trial: &Trial,
    condition: Condition,
    outcome: Outcome,
    usage: AssistantUsage,
    wall_time: Duration,
    diff: DiffStats,
    test_output: String,
    artifact_fingerprint: Option<String>,
    treatment_cache_hit: Option<bool>,
) -> RunRecord {
    RunRecord {
        trial_id: trial.id.clone(),
        condition,
        outcome,
        error: None,
        wall_time_seconds: wall_time.as_secs_f64(),
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        tool_calls: usage.tool_calls,
        lines_changed: diff.lines_changed,
        files_touched: diff.files,
        artifact_fingerprint,
        treatment_cache_hit,
        test_output: snippet(&test_output, TEST_OUTPUT_CAP),
        recorded_at: Utc::now().to_rfc3339(),
    }
}

fn snippet(text: &str, cap: usize) -> String {
    if text.len() <= cap {
        return text.to_string();
    }
    let mut end = cap;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

// =============================================================================
// Stage bodies
// =============================================================================

async fn checkout_pre_fix(
    ctx: &TrialContext,
    trial: &Trial,
    workspace: &Path,
) -> Result<(), git::GitError> {
    // The workspace directory exists (the pool created it); clone wants it
    // absent.
    if workspace.exists() {
        tokio::fs::remove_dir_all(workspace).await?;
    }
    git::clone(
        &ctx.repo.url,
        workspace,
        false,
        ctx.reference_clone.as_deref(),
    )
    .await?;
    git::checkout(workspace, &trial.pre_fix_revision).await
}

/// Strip pre-existing context files, inject the fix commit's test when
/// needed, and pre-validate. Returns the failing-test output for prompt
/// building, shared across conditions of this trial.
async fn setup_workspace(
    ctx: &TrialContext,
    trial: &Trial,
    workspace: &Path,
) -> Result<Option<String>, String> {
    let removed =
        strip_context_files(workspace, &ctx.repo.strip_extra).map_err(|e| e.to_string())?;
    if !removed.is_empty() {
        info!(trial = %trial.id, count = removed.len(), "stripped pre-existing context files");
    }

    if trial.prompt_source == PromptSource::FailingTest {
        if let Some(test_file) = &trial.test_file {
            inject_test_from_fix(workspace, &trial.fix_revision, test_file).await;
        }
    }

    let trial_cloned = trial.clone();
    let workspace_buf = workspace.to_path_buf();
    ctx.prevalidation
        .get_or_run(&trial.id, || async move {
            pre_validate(ctx, &trial_cloned, &workspace_buf)
                .await
                .map_err(|e| format!("pre-validation failed: {e}"))
        })
        .await
}

/// Many repositories add the bug-reproducing test functions in the same
/// commit as the fix. Injecting the fix commit's version of the test file
/// into the pre-fix workspace recreates the failing-test scenario.
async fn inject_test_from_fix(workspace: &Path, fix_revision: &str, test_file: &str) {
    match git::show_file(workspace, fix_revision, test_file).await {
        Ok(contents) => {
            let dest = workspace.join(test_file);
            if let Some(parent) = dest.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Err(e) = std::fs::write(&dest, contents) {
                warn!(test_file, error = %e, "test injection write failed");
            }
        }
        Err(e) => {
            // The test file may simply not exist at the fix commit either.
            warn!(test_file, error = %e, "test injection skipped");
        }
    }
}

/// Confirm the trial is runnable before spending assistant tokens: sandbox
/// setup works, and for failing-test trials the target test genuinely fails
/// at the pre-fix revision. Returns the captured test output.
async fn pre_validate(
    ctx: &TrialContext,
    trial: &Trial,
    workspace: &Path,
) -> Result<Option<String>, String> {
    let sandbox_cfg = &ctx.repo.sandbox;

    if trial.prompt_source != PromptSource::FailingTest && trial.test_file.is_none() {
        // Smoke-test the setup chain only; a full suite run here is too slow.
        let result = ctx
            .sandbox
            .run(ctx.exec_spec(
                workspace,
                sandbox_cfg.with_setup("true"),
                ctx.timeouts.pre_validation,
            ))
            .await
            .map_err(|e| e.to_string())?;
        if result.timed_out {
            return Err("sandbox setup timed out".to_string());
        }
        if result.exit_code != 0 {
            return Err(format!("sandbox setup failed (exit {})", result.exit_code));
        }
        return Ok(None);
    }

    let result = ctx
        .sandbox
        .run(ctx.exec_spec(
            workspace,
            sandbox_cfg.verification_command(trial),
            ctx.timeouts.pre_validation,
        ))
        .await
        .map_err(|e| e.to_string())?;

    if result.timed_out {
        return Err("test command timed out; sandbox or test infrastructure broken".to_string());
    }
    if trial.prompt_source == PromptSource::FailingTest && result.exit_code == 0 {
        return Err(format!(
            "test already passes at pre-fix revision {}; not a valid failing-test trial",
            &trial.pre_fix_revision[..trial.pre_fix_revision.len().min(8)]
        ));
    }

    Ok(Some(format!("{}{}", result.stdout, result.stderr)))
}

/// Fetch or build the condition's context artifact, then write its files
/// into the workspace. Lease contention is retried with bounded backoff.
async fn apply_treatment(
    ctx: &TrialContext,
    trial: &Trial,
    condition: Condition,
    workspace: &Path,
) -> Result<CacheOutcome, CacheError> {
    let fp = Fingerprint::new(
        condition,
        &ctx.repo.url,
        &trial.pre_fix_revision,
        TREATMENT_VERSION,
    );

    let mut attempt = 0;
    let outcome = loop {
        let result = ctx
            .store
            .get_or_build(&fp, || build_context_artifact(ctx, condition, workspace))
            .await;
        match result {
            Ok(outcome) => break outcome,
            Err(e) if e.is_transient() && attempt + 1 < ctx.retry.max_attempts => {
                let backoff = ctx.retry.backoff(attempt);
                warn!(fingerprint = %fp.key_hash, attempt, error = %e, "transient cache failure; backing off");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    };

    // On a hit the files were generated elsewhere; plant them here. On a
    // miss they were generated in this workspace and are already in place,
    // but rewriting them is harmless and keeps one code path.
    for file in &outcome.artifact.files {
        let dest = workspace.join(&file.path);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&dest, &file.contents)?;
    }

    Ok(outcome)
}

/// Builder run by the cache's lease winner: invoke the assistant with the
/// condition's generation prompt and harvest the context files it created.
async fn build_context_artifact(
    ctx: &TrialContext,
    condition: Condition,
    workspace: &Path,
) -> Result<Vec<ArtifactFile>, CacheError> {
    let generation_prompt = prompt::generation_for(condition)
        .ok_or_else(|| CacheError::Build("condition has no treatment".to_string()))?;

    let outcome = ctx
        .assistant
        .invoke(workspace, &generation_prompt, ctx.timeouts.treatment_build)
        .await
        .map_err(|e| CacheError::Build(e.to_string()))?;
    if outcome.timed_out {
        return Err(CacheError::Build(format!(
            "context generation timed out after {:.0}s",
            outcome.wall_time.as_secs_f64()
        )));
    }

    if condition == Condition::FlatContext {
        dual_write_flat_context(workspace);
    }

    let files = collect_context_files(workspace).map_err(CacheError::Io)?;
    if files.is_empty() {
        return Err(CacheError::Build(format!(
            "context generation produced no files (took {:.0}s); likely failed silently",
            outcome.wall_time.as_secs_f64()
        )));
    }
    Ok(files)
}

/// Flat context is consumed under both conventional names; mirror whichever
/// one the assistant wrote.
fn dual_write_flat_context(workspace: &Path) {
    let claude = workspace.join("CLAUDE.md");
    let agents = workspace.join("AGENTS.md");
    let result = match (claude.exists(), agents.exists()) {
        (true, false) => std::fs::copy(&claude, &agents).map(|_| ()),
        (false, true) => std::fs::copy(&agents, &claude).map(|_| ()),
        _ => Ok(()),
    };
    if let Err(e) = result {
        warn!(error = %e, "flat context dual-write failed");
    }
}

/// All context files in a workspace, as workspace-relative artifact files.
pub fn collect_context_files(workspace: &Path) -> std::io::Result<Vec<ArtifactFile>> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(workspace)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.file_name() != std::ffi::OsStr::new(".git"))
    {
        let entry = entry.map_err(std::io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name != "AGENTS.md" && name != "CLAUDE.md" {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(workspace)
            .map_err(std::io::Error::other)?;
        files.push(ArtifactFile {
            path: rel.to_string_lossy().replace('\\', "/"),
            contents: std::fs::read(entry.path())?,
        });
    }
    Ok(files)
}

/// Remove AI context files so every condition starts from the same blank
/// slate: all `AGENTS.md`/`CLAUDE.md` files, `.github/`, plus per-repo
/// extras. Returns the removed paths.
pub fn strip_context_files(
    workspace: &Path,
    strip_extra: &[String],
) -> std::io::Result<Vec<String>> {
    let mut removed = Vec::new();

    for file in collect_context_files(workspace)? {
        std::fs::remove_file(workspace.join(&file.path))?;
        removed.push(file.path);
    }

    let github = workspace.join(".github");
    if github.exists() {
        std::fs::remove_dir_all(&github)?;
        removed.push(".github".to_string());
    }

    let workspace_canonical = workspace.canonicalize()?;
    for extra in strip_extra {
        let target = workspace.join(extra);
        // Refuse anything that escapes the workspace.
        let Ok(canonical) = target.canonicalize() else {
            continue;
        };
        if !canonical.starts_with(&workspace_canonical) {
            continue;
        }
        if canonical.is_file() {
            std::fs::remove_file(&canonical)?;
            removed.push(extra.clone());
        } else if canonical.is_dir() {
            std::fs::remove_dir_all(&canonical)?;
            removed.push(extra.clone());
        }
    }

    removed.sort();
    removed.dedup();
    Ok(removed)
}

async fn build_fix_prompt(
    trial: &Trial,
    condition: Condition,
    workspace: &Path,
    pre_validation_output: Option<String>,
) -> Result<String, String> {
    match trial.prompt_source {
        PromptSource::CommitMessage => {
            let message = git::commit_message(workspace, &trial.fix_revision)
                .await
                .map_err(|e| format!("could not read fix commit message: {e}"))?;
            Ok(prompt::from_commit_message(&message, condition))
        }
        PromptSource::FailingTest => {
            let output = pre_validation_output
                .ok_or_else(|| "no failing-test output captured during setup".to_string())?;
            Ok(prompt::from_failing_test(&output, condition))
        }
        PromptSource::Issue => Err("issue-based prompts require an issue fetcher".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settled_outcomes_survive_resume() {
        assert!(Outcome::Pass.is_settled());
        assert!(Outcome::Fail.is_settled());
        assert!(!Outcome::Error.is_settled());
    }

    #[test]
    fn snippet_respects_char_boundaries() {
        let s = "héllo wörld";
        let cut = snippet(s, 2);
        assert!(cut.len() <= 2);
        assert!(s.starts_with(&cut));
        assert_eq!(snippet("short", 100), "short");
    }

    #[test]
    fn verification_requires_clean_pass() {
        assert!(verification_passed(0, "4 passed in 0.2s"));
        assert!(!verification_passed(1, "1 failed"));
        assert!(!verification_passed(0, "no tests ran"));
    }

    #[test]
    fn strip_removes_context_files_and_github() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path();
        std::fs::write(ws.join("CLAUDE.md"), "ctx").unwrap();
        std::fs::create_dir_all(ws.join("sub")).unwrap();
        std::fs::write(ws.join("sub/AGENTS.md"), "ctx").unwrap();
        std::fs::create_dir_all(ws.join(".github/workflows")).unwrap();
        std::fs::write(ws.join(".github/workflows/ci.yml"), "ci").unwrap();
        std::fs::write(ws.join("README.md"), "keep").unwrap();

        let removed = strip_context_files(ws, &[]).unwrap();
        assert!(removed.contains(&"CLAUDE.md".to_string()));
        assert!(removed.contains(&"sub/AGENTS.md".to_string()));
        assert!(removed.contains(&".github".to_string()));
        assert!(ws.join("README.md").exists());
        assert!(!ws.join("CLAUDE.md").exists());
        assert!(!ws.join(".github").exists());
    }

    #[test]
    fn strip_extra_cannot_escape_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        let outside = dir.path().join("outside.txt");
        std::fs::write(&outside, "precious").unwrap();

        let removed = strip_context_files(&ws, &["../outside.txt".to_string()]).unwrap();
        assert!(removed.is_empty());
        assert!(outside.exists());
    }

    #[tokio::test]
    async fn prevalidation_cache_runs_once_per_trial() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let cache = PrevalidationCache::default();
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let runs = runs.clone();
            let result = cache
                .get_or_run("trial-1", || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(Some("failing output".to_string()))
                })
                .await;
            assert_eq!(result.unwrap().as_deref(), Some("failing output"));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
