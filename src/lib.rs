#![forbid(unsafe_code)]

//! # replay-harness
//!
//! Controlled experiments on AI bug-fixing. For each treatment condition,
//! the harness replays a historical bug fix from a real repository: check
//! out the pre-fix state, apply the treatment (none, a flat context dump,
//! or a structured knowledge layer), let the assistant attempt a fix, then
//! run the repository's own tests to score the attempt.
//!
//! The load-bearing parts are the artifact cache (at-most-once computation
//! of shared treatment artifacts under concurrency, via durable expiring
//! leases), the append-only resumable run set, and the small-sample
//! statistics that decide whether a treatment effect is real.

pub mod assistant;
pub mod cache;
pub mod coordinator;
pub mod executor;
pub mod git;
pub mod orchestrator;
pub mod prompt;
pub mod report;
pub mod scanner;
pub mod stats;
pub mod trial;

pub use assistant::{Assistant, AssistantOutcome, AssistantUsage, CliAssistant};
pub use cache::{Artifact, ArtifactFile, ArtifactStore, CacheError, Fingerprint, LeasePolicy};
pub use coordinator::{run_batch, Harness, RunConfig, RunError, RunSet, RunSetWriter, RunSummary};
pub use executor::{DockerSandbox, ExecResult, ExecSpec, ProcessSandbox, ResourceLimits, Sandbox};
pub use orchestrator::{run_trial, Outcome, RunRecord, Timeouts, TrialContext, WorkspacePool};
pub use scanner::{scan_repo, ScanError, ScanOptions};
pub use stats::{analyze, wilson_interval, Analysis, AnalysisOptions};
pub use trial::{Category, Condition, PromptSource, RepoConfig, Trial, TrialFile};
