//! Run coordinator: schedules trials × conditions across a bounded worker
//! pool and owns the run set's persisted state.
//!
//! The run set is an append-only JSONL file. Workers emit records; this
//! module is the only writer. Resumability contract: re-invoking a
//! partially completed run set re-executes only missing or
//! previously-erroring pairs — previously passed or failed pairs are
//! experimental results and are skipped unless `force` is set.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::assistant::Assistant;
use crate::cache::{ArtifactStore, CacheError};
use crate::executor::{DockerSandbox, ResourceLimits, Sandbox};
use crate::git;
use crate::orchestrator::{
    run_trial, Outcome, PrevalidationCache, RetryPolicy, RunRecord, Timeouts, TrialContext,
    WorkspacePool,
};
use crate::trial::{Category, Condition, Trial, TrialError, TrialFile};

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("run set line {line} is corrupt: {detail}")]
    CorruptRunSet { line: usize, detail: String },
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("trial error: {0}")]
    Trial(#[from] TrialError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("task join error: {0}")]
    Join(String),
}

// =============================================================================
// Run set persistence
// =============================================================================

/// A loaded run set: every record ever appended, in append order.
#[derive(Debug, Clone, Default)]
pub struct RunSet {
    pub records: Vec<RunRecord>,
}

impl RunSet {
    /// Load from JSONL. A torn final line (crash mid-append) is dropped
    /// with a warning; corruption anywhere else is fatal — the run set is
    /// the experiment's ground truth.
    pub fn load(path: &Path) -> Result<Self, RunError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut records = Vec::with_capacity(lines.len());
        for (idx, line) in lines.iter().enumerate() {
            match serde_json::from_str::<RunRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) if idx + 1 == lines.len() => {
                    warn!(line = idx + 1, error = %e, "dropping torn final run set line");
                }
                Err(e) => {
                    return Err(RunError::CorruptRunSet {
                        line: idx + 1,
                        detail: e.to_string(),
                    })
                }
            }
        }
        Ok(Self { records })
    }

    /// Latest record per (trial, condition); later appends win, so an
    /// error pair re-run on resume supersedes its old record.
    pub fn latest(&self) -> HashMap<(String, Condition), &RunRecord> {
        let mut latest = HashMap::new();
        for record in &self.records {
            latest.insert((record.trial_id.clone(), record.condition), record);
        }
        latest
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Append-only writer for the run set file. Each append is flushed before
/// returning, so a worker's record is durable before its future resolves.
#[derive(Clone)]
pub struct RunSetWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl RunSetWriter {
    pub fn open_append(path: &Path) -> Result<Self, RunError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file: Arc::new(std::sync::Mutex::new(file)),
        })
    }

    pub async fn append(&self, record: &RunRecord) -> Result<(), RunError> {
        let line = serde_json::to_string(record).map_err(|e| RunError::Serde(e.to_string()))?;
        let file = self.file.clone();
        tokio::task::spawn_blocking(move || {
            use std::io::Write;
            let mut guard = file.lock().map_err(|_| {
                RunError::Io(std::io::Error::other("run set writer lock poisoned"))
            })?;
            writeln!(guard, "{line}")?;
            guard.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| RunError::Join(e.to_string()))?
    }
}

// =============================================================================
// Batch configuration & planning
// =============================================================================

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub workspaces_dir: PathBuf,
    pub concurrency: usize,
    pub conditions: Vec<Condition>,
    pub category: Option<Category>,
    pub force: bool,
    pub dry_run: bool,
    pub keep_workspaces: bool,
    pub timeouts: Timeouts,
    pub retry: RetryPolicy,
    pub limits: ResourceLimits,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workspaces_dir: PathBuf::from("workspaces"),
            concurrency: 2,
            conditions: Condition::all().to_vec(),
            category: None,
            force: false,
            dry_run: false,
            keep_workspaces: false,
            timeouts: Timeouts::default(),
            retry: RetryPolicy::default(),
            limits: ResourceLimits::default(),
        }
    }
}

/// External collaborators injected into a batch run.
pub struct Harness {
    pub sandbox: Arc<dyn Sandbox>,
    pub assistant: Arc<dyn Assistant>,
    pub store: ArtifactStore,
}

/// What a batch did, for reporting and the process exit code.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub scheduled: usize,
    pub skipped: usize,
    pub pass: usize,
    pub fail: usize,
    pub error: usize,
    pub cancelled: bool,
    /// Pairs that were (or would be, under dry-run) executed.
    pub planned: Vec<(String, Condition)>,
}

impl RunSummary {
    pub fn had_errors(&self) -> bool {
        self.error > 0
    }

    fn tally(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Pass => self.pass += 1,
            Outcome::Fail => self.fail += 1,
            Outcome::Error => self.error += 1,
        }
    }
}

/// The Cartesian product of selected trials × conditions, minus pairs whose
/// latest recorded outcome is settled.
pub fn plan_pairs<'a>(
    trial_file: &'a TrialFile,
    existing: &RunSet,
    config: &RunConfig,
) -> (Vec<(&'a Trial, Condition)>, usize) {
    let latest = existing.latest();
    let mut pairs = Vec::new();
    let mut skipped = 0;
    for trial in trial_file.select(config.category) {
        for &condition in &config.conditions {
            let settled = latest
                .get(&(trial.id.clone(), condition))
                .map(|r| r.outcome.is_settled())
                .unwrap_or(false);
            if settled && !config.force {
                skipped += 1;
            } else {
                pairs.push((trial, condition));
            }
        }
    }
    (pairs, skipped)
}

// =============================================================================
// Batch execution
// =============================================================================

/// Run (or resume) a batch against a run set file.
///
/// Per-trial infrastructure failures become `error` records and never abort
/// the batch; only harness-fatal conditions (run set unwritable, store
/// unusable) surface as `Err`.
pub async fn run_batch(
    harness: &Harness,
    trial_file: &TrialFile,
    run_set_path: &Path,
    config: &RunConfig,
    cancel: watch::Receiver<bool>,
) -> Result<RunSummary, RunError> {
    let existing = RunSet::load(run_set_path)?;
    let (pairs, skipped) = plan_pairs(trial_file, &existing, config);

    let mut summary = RunSummary {
        scheduled: pairs.len(),
        skipped,
        planned: pairs
            .iter()
            .map(|(t, c)| (t.id.clone(), *c))
            .collect(),
        ..RunSummary::default()
    };

    eprintln!(
        "[run] {} pairs to execute, {} already settled (run set: {})",
        pairs.len(),
        skipped,
        run_set_path.display()
    );

    if config.dry_run || pairs.is_empty() {
        return Ok(summary);
    }

    // Crash-recovery sweep before scheduling anything.
    let pool_root = config.workspaces_dir.join("work");
    std::fs::create_dir_all(&pool_root)?;
    let pool = WorkspacePool::new(&pool_root, config.concurrency, config.keep_workspaces);
    pool.sweep_orphans()?;
    DockerSandbox::sweep_orphans().await;

    let reference_clone = prepare_reference(trial_file, &config.workspaces_dir).await;

    let writer = RunSetWriter::open_append(run_set_path)?;

    let ctx = Arc::new(TrialContext {
        repo: trial_file.repo.clone(),
        workspaces: pool,
        store: harness.store.clone(),
        sandbox: harness.sandbox.clone(),
        assistant: harness.assistant.clone(),
        prevalidation: PrevalidationCache::default(),
        timeouts: config.timeouts.clone(),
        retry: config.retry.clone(),
        limits: config.limits.clone(),
        reference_clone,
        cancel: cancel.clone(),
    });

    let total = pairs.len();
    let cancel_gate = cancel.clone();
    let results: Vec<Result<RunRecord, RunError>> = stream::iter(
        pairs
            .into_iter()
            .enumerate()
            .map(|(idx, (trial, condition))| {
                let ctx = ctx.clone();
                let writer = writer.clone();
                let trial = trial.clone();
                async move {
                    eprintln!(
                        "[run] [{}/{}] {} × {}",
                        idx + 1,
                        total,
                        trial.id,
                        condition
                    );
                    let record = run_trial(&ctx, &trial, condition).await;
                    // Durable before this worker resolves: a crash loses at
                    // most in-flight pairs.
                    writer.append(&record).await?;
                    eprintln!(
                        "[run] [{}/{}] {} × {} → {:?}{}",
                        idx + 1,
                        total,
                        record.trial_id,
                        condition,
                        record.outcome,
                        record
                            .error
                            .as_deref()
                            .map(|e| format!(" ({e})"))
                            .unwrap_or_default()
                    );
                    Ok(record)
                }
            }),
    )
    // Cancellation stops pulling new pairs; in-flight ones finish and
    // record a terminal outcome inside run_trial.
    .take_while(move |_| {
        let cancelled = *cancel_gate.borrow();
        async move { !cancelled }
    })
    .buffer_unordered(config.concurrency.max(1))
    .collect()
    .await;

    for result in results {
        summary.tally(result?.outcome);
    }
    summary.cancelled = *cancel.borrow();
    if summary.cancelled {
        info!("run cancelled; unstarted pairs remain schedulable on resume");
    }

    eprintln!(
        "[run] complete — {} pass, {} fail, {} error, {} skipped",
        summary.pass, summary.fail, summary.error, summary.skipped
    );

    Ok(summary)
}

/// Set up a local reference clone so per-workspace clones are cheap. A
/// repository URL that is already a local path is used directly; otherwise
/// one shared clone is made (and reused) under the workspaces directory.
async fn prepare_reference(trial_file: &TrialFile, workspaces_dir: &Path) -> Option<PathBuf> {
    let url = &trial_file.repo.url;
    let local = Path::new(url);
    if local.join(".git").exists() || local.join("HEAD").exists() {
        return Some(git::absolutize(local));
    }

    let dest = workspaces_dir
        .join("reference")
        .join(trial_file.repo.slug());
    if dest.join(".git").exists() {
        return Some(git::absolutize(&dest));
    }
    match git::clone(url, &dest, false, None).await {
        Ok(()) => Some(git::absolutize(&dest)),
        Err(e) => {
            warn!(error = %e, "reference clone failed; workspaces will clone from origin");
            None
        }
    }
}
