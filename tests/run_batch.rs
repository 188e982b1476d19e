//! End-to-end batch runs against a small throwaway git repository, with a
//! scripted assistant and the unsandboxed process executor.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::tempdir;
use tokio::sync::watch;

use replay_harness::assistant::{Assistant, AssistantError, AssistantOutcome, AssistantUsage};
use replay_harness::cache::{ArtifactStore, LeasePolicy};
use replay_harness::coordinator::{run_batch, Harness, RunConfig, RunSet};
use replay_harness::executor::ProcessSandbox;
use replay_harness::orchestrator::Outcome;
use replay_harness::trial::{
    Category, Condition, PromptSource, RepoConfig, SandboxConfig, Trial, TrialFile,
};

// =============================================================================
// Fixture repository
// =============================================================================

fn git(dir: &Path, args: &[&str]) {
    let output = std::process::Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .expect("git binary available");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

fn rev_parse(dir: &Path, spec: &str) -> String {
    let output = std::process::Command::new("git")
        .current_dir(dir)
        .args(["rev-parse", spec])
        .output()
        .unwrap();
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Two commits: one introducing a "broken" lib, one fixing it. The trial
/// replays the pre-fix state; verification greps for the fixed content.
fn init_fixture_repo(dir: &Path) -> (String, String) {
    git(dir, &["init"]);
    git(dir, &["config", "user.email", "dev@example.com"]);
    git(dir, &["config", "user.name", "Dev"]);
    git(dir, &["config", "commit.gpgsign", "false"]);

    std::fs::write(dir.join("lib.txt"), "status: broken\n").unwrap();
    std::fs::write(dir.join("CLAUDE.md"), "stale context\n").unwrap();
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-m", "add widget library"]);

    std::fs::write(dir.join("lib.txt"), "status: fixed\n").unwrap();
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-m", "fix widget status reporting bug"]);

    (rev_parse(dir, "HEAD^"), rev_parse(dir, "HEAD"))
}

fn trial_file(repo_path: &Path, pre_fix: &str, fix: &str, ids: &[&str]) -> TrialFile {
    TrialFile {
        repo: RepoConfig {
            url: repo_path.to_string_lossy().to_string(),
            default_branch: "main".to_string(),
            sandbox: SandboxConfig {
                image: "unused-under-process-sandbox".to_string(),
                setup: vec![],
                test_command: "grep -q 'status: fixed' lib.txt".to_string(),
            },
            strip_extra: vec![],
        },
        trials: ids
            .iter()
            .map(|id| Trial {
                id: id.to_string(),
                category: Category::SimpleFix,
                pre_fix_revision: pre_fix.to_string(),
                fix_revision: fix.to_string(),
                test_file: None,
                test_pattern: None,
                prompt_source: PromptSource::CommitMessage,
                issue_number: None,
            })
            .collect(),
    }
}

// =============================================================================
// Scripted assistants
// =============================================================================

/// Fixes the bug on fix prompts; writes context files on generation prompts.
struct ScriptedAssistant {
    fix_invocations: AtomicUsize,
    generation_invocations: AtomicUsize,
    fixes_the_bug: bool,
}

impl ScriptedAssistant {
    fn fixing() -> Self {
        Self {
            fix_invocations: AtomicUsize::new(0),
            generation_invocations: AtomicUsize::new(0),
            fixes_the_bug: true,
        }
    }

    fn failing() -> Self {
        Self {
            fixes_the_bug: false,
            ..Self::fixing()
        }
    }
}

#[async_trait]
impl Assistant for ScriptedAssistant {
    async fn invoke(
        &self,
        workspace: &Path,
        prompt: &str,
        _timeout: Duration,
    ) -> Result<AssistantOutcome, AssistantError> {
        let is_generation = prompt.contains("Explore this repository");
        if is_generation {
            self.generation_invocations.fetch_add(1, Ordering::SeqCst);
            std::fs::write(workspace.join("CLAUDE.md"), "generated overview\n").unwrap();
        } else {
            self.fix_invocations.fetch_add(1, Ordering::SeqCst);
            if self.fixes_the_bug {
                std::fs::write(workspace.join("lib.txt"), "status: fixed\n").unwrap();
            }
        }
        Ok(AssistantOutcome {
            exit_code: 0,
            wall_time: Duration::from_millis(10),
            usage: AssistantUsage {
                input_tokens: 500,
                output_tokens: 80,
                tool_calls: 4,
                cost_usd: 0.01,
                num_turns: 4,
            },
            timed_out: false,
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

/// Produces nothing: an empty run, recorded as a harness error.
struct BrokenAssistant;

#[async_trait]
impl Assistant for BrokenAssistant {
    async fn invoke(
        &self,
        _workspace: &Path,
        _prompt: &str,
        _timeout: Duration,
    ) -> Result<AssistantOutcome, AssistantError> {
        Ok(AssistantOutcome {
            exit_code: 1,
            wall_time: Duration::from_millis(5),
            usage: AssistantUsage::default(),
            timed_out: false,
            stdout: String::new(),
            stderr: "CLI exploded".to_string(),
        })
    }
}

// =============================================================================
// Harness wiring
// =============================================================================

fn harness(root: &Path, assistant: Arc<dyn Assistant>) -> Harness {
    let policy = LeasePolicy {
        ttl: Duration::from_secs(30),
        poll_interval: Duration::from_millis(20),
        wait_max: Duration::from_secs(30),
    };
    Harness {
        sandbox: Arc::new(ProcessSandbox),
        assistant,
        store: ArtifactStore::open_with_policy(root.join("cache"), policy).unwrap(),
    }
}

fn config(root: &Path, conditions: Vec<Condition>) -> RunConfig {
    RunConfig {
        workspaces_dir: root.join("workspaces"),
        concurrency: 1,
        conditions,
        ..RunConfig::default()
    }
}

fn no_cancel() -> watch::Receiver<bool> {
    // A receiver keeps working after its sender drops; it just never
    // changes value again.
    let (_tx, rx) = watch::channel(false);
    rx
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn baseline_pass_and_fail_outcomes_are_recorded() {
    let repo_dir = tempdir().unwrap();
    let (pre_fix, fix) = init_fixture_repo(repo_dir.path());
    let work = tempdir().unwrap();

    let trials = trial_file(repo_dir.path(), &pre_fix, &fix, &["widget-fix"]);
    let run_set_path = work.path().join("run.jsonl");

    let h = harness(work.path(), Arc::new(ScriptedAssistant::fixing()));
    let summary = run_batch(
        &h,
        &trials,
        &run_set_path,
        &config(work.path(), vec![Condition::Baseline]),
        no_cancel(),
    )
    .await
    .unwrap();

    assert_eq!(summary.scheduled, 1);
    assert_eq!(summary.pass, 1);
    assert_eq!(summary.error, 0);

    let set = RunSet::load(&run_set_path).unwrap();
    assert_eq!(set.records.len(), 1);
    let record = &set.records[0];
    assert_eq!(record.outcome, Outcome::Pass);
    assert_eq!(record.trial_id, "widget-fix");
    assert_eq!(record.input_tokens, 500);
    assert!(record.error.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_assistant_yields_fail_not_error() {
    let repo_dir = tempdir().unwrap();
    let (pre_fix, fix) = init_fixture_repo(repo_dir.path());
    let work = tempdir().unwrap();

    let trials = trial_file(repo_dir.path(), &pre_fix, &fix, &["widget-fix"]);
    let run_set_path = work.path().join("run.jsonl");

    let h = harness(work.path(), Arc::new(ScriptedAssistant::failing()));
    let summary = run_batch(
        &h,
        &trials,
        &run_set_path,
        &config(work.path(), vec![Condition::Baseline]),
        no_cancel(),
    )
    .await
    .unwrap();

    assert_eq!(summary.fail, 1);
    assert_eq!(summary.error, 0);
    let set = RunSet::load(&run_set_path).unwrap();
    assert_eq!(set.records[0].outcome, Outcome::Fail);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn checkout_failure_is_an_error_and_never_reaches_verification() {
    let repo_dir = tempdir().unwrap();
    let (_pre_fix, fix) = init_fixture_repo(repo_dir.path());
    let work = tempdir().unwrap();

    let bogus = "0000000000000000000000000000000000000000";
    let trials = trial_file(repo_dir.path(), bogus, &fix, &["broken-revision"]);
    let run_set_path = work.path().join("run.jsonl");

    let assistant = Arc::new(ScriptedAssistant::fixing());
    let h = harness(work.path(), assistant.clone());
    let summary = run_batch(
        &h,
        &trials,
        &run_set_path,
        &config(work.path(), vec![Condition::Baseline]),
        no_cancel(),
    )
    .await
    .unwrap();

    assert_eq!(summary.error, 1);
    assert_eq!(summary.pass + summary.fail, 0);

    let set = RunSet::load(&run_set_path).unwrap();
    let record = &set.records[0];
    assert_eq!(record.outcome, Outcome::Error);
    assert!(record.error.as_deref().unwrap().starts_with("[checkout]"));
    // The assistant was never consulted, so verification cannot have run.
    assert_eq!(assistant.fix_invocations.load(Ordering::SeqCst), 0);
    assert!(record.test_output.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resume_skips_settled_pairs_and_reruns_errors() {
    let repo_dir = tempdir().unwrap();
    let (pre_fix, fix) = init_fixture_repo(repo_dir.path());
    let work = tempdir().unwrap();

    let trials = trial_file(repo_dir.path(), &pre_fix, &fix, &["t-one", "t-two"]);
    let run_set_path = work.path().join("run.jsonl");
    let cfg = config(work.path(), vec![Condition::Baseline]);

    // First invocation: a broken assistant CLI produces error outcomes.
    let broken = harness(work.path(), Arc::new(BrokenAssistant));
    let first = run_batch(&broken, &trials, &run_set_path, &cfg, no_cancel())
        .await
        .unwrap();
    assert_eq!(first.error, 2);

    // Second invocation: errors are re-executed and now pass.
    let fixed = harness(work.path(), Arc::new(ScriptedAssistant::fixing()));
    let second = run_batch(&fixed, &trials, &run_set_path, &cfg, no_cancel())
        .await
        .unwrap();
    assert_eq!(second.scheduled, 2);
    assert_eq!(second.pass, 2);

    // Third invocation: everything is settled; nothing runs.
    let third = run_batch(&fixed, &trials, &run_set_path, &cfg, no_cancel())
        .await
        .unwrap();
    assert_eq!(third.scheduled, 0);
    assert_eq!(third.skipped, 2);

    // The loaded run set resolves to one terminal record per pair, with
    // the later pass superseding the earlier error.
    let set = RunSet::load(&run_set_path).unwrap();
    assert_eq!(set.records.len(), 4);
    let latest = set.latest();
    assert_eq!(latest.len(), 2);
    assert!(latest.values().all(|r| r.outcome == Outcome::Pass));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn treatment_artifact_is_built_once_and_shared_across_trials() {
    let repo_dir = tempdir().unwrap();
    let (pre_fix, fix) = init_fixture_repo(repo_dir.path());
    let work = tempdir().unwrap();

    // Two trials at the same pre-fix revision share one fingerprint.
    let trials = trial_file(repo_dir.path(), &pre_fix, &fix, &["t-one", "t-two"]);
    let run_set_path = work.path().join("run.jsonl");

    let assistant = Arc::new(ScriptedAssistant::fixing());
    let h = harness(work.path(), assistant.clone());
    let summary = run_batch(
        &h,
        &trials,
        &run_set_path,
        &config(work.path(), vec![Condition::FlatContext]),
        no_cancel(),
    )
    .await
    .unwrap();

    assert_eq!(summary.pass, 2);
    assert_eq!(assistant.generation_invocations.load(Ordering::SeqCst), 1);

    let set = RunSet::load(&run_set_path).unwrap();
    let fingerprints: Vec<_> = set
        .records
        .iter()
        .map(|r| r.artifact_fingerprint.clone().unwrap())
        .collect();
    assert_eq!(fingerprints[0], fingerprints[1]);

    let mut hits: Vec<bool> = set
        .records
        .iter()
        .map(|r| r.treatment_cache_hit.unwrap())
        .collect();
    hits.sort();
    assert_eq!(hits, vec![false, true]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_stops_scheduling_without_fabricating_records() {
    let repo_dir = tempdir().unwrap();
    let (pre_fix, fix) = init_fixture_repo(repo_dir.path());
    let work = tempdir().unwrap();

    let trials = trial_file(repo_dir.path(), &pre_fix, &fix, &["t-one", "t-two"]);
    let run_set_path = work.path().join("run.jsonl");

    let (tx, rx) = watch::channel(true);
    let h = harness(work.path(), Arc::new(ScriptedAssistant::fixing()));
    let summary = run_batch(
        &h,
        &trials,
        &run_set_path,
        &config(work.path(), vec![Condition::Baseline]),
        rx,
    )
    .await
    .unwrap();
    drop(tx);

    assert!(summary.cancelled);
    assert_eq!(summary.pass + summary.fail + summary.error, 0);
    // Nothing started, so the run set stays empty and every pair remains
    // schedulable on resume.
    let set = RunSet::load(&run_set_path).unwrap();
    assert!(set.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dry_run_plans_without_executing() {
    let repo_dir = tempdir().unwrap();
    let (pre_fix, fix) = init_fixture_repo(repo_dir.path());
    let work = tempdir().unwrap();

    let trials = trial_file(repo_dir.path(), &pre_fix, &fix, &["t-one"]);
    let run_set_path = work.path().join("run.jsonl");

    let assistant = Arc::new(ScriptedAssistant::fixing());
    let h = harness(work.path(), assistant.clone());
    let cfg = RunConfig {
        dry_run: true,
        ..config(work.path(), vec![Condition::Baseline, Condition::FlatContext])
    };
    let summary = run_batch(&h, &trials, &run_set_path, &cfg, no_cancel())
        .await
        .unwrap();

    assert_eq!(summary.scheduled, 2);
    assert_eq!(summary.planned.len(), 2);
    assert_eq!(assistant.fix_invocations.load(Ordering::SeqCst), 0);
    assert!(!run_set_path.exists() || RunSet::load(&run_set_path).unwrap().is_empty());
}
