#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use replay_harness::cache::ArtifactStore;
use replay_harness::coordinator::{run_batch, Harness, RunConfig, RunSet};
use replay_harness::executor::{DockerSandbox, ProcessSandbox, ResourceLimits, Sandbox};
use replay_harness::scanner::{self, ScanOptions};
use replay_harness::stats::{analyze, AnalysisOptions};
use replay_harness::trial::{Category, Condition, RepoConfig, SandboxConfig, TrialFile};
use replay_harness::{report, CliAssistant};

#[derive(Parser)]
#[command(name = "replay", version, about = "Bug-fix replay experiment harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a local clone's history for candidate trials
    Scan {
        /// Path to a local clone of the repository
        #[arg(long)]
        repo: PathBuf,
        /// Repository URL recorded in the trial file
        #[arg(long)]
        url: String,
        /// Sandbox image for this repository
        #[arg(long)]
        image: String,
        /// Setup commands run before tests (repeatable)
        #[arg(long)]
        setup: Vec<String>,
        /// Test command
        #[arg(long)]
        test_command: String,
        /// Maximum candidates to keep
        #[arg(long, default_value_t = 50)]
        limit: usize,
        /// Only consider commits since this date (git --since syntax)
        #[arg(long)]
        since: Option<String>,
        /// Output trial file (YAML draft for curation)
        #[arg(long)]
        out: PathBuf,
    },
    /// Run (or resume) a batch of trials × conditions
    Run {
        /// Curated trial file
        #[arg(long)]
        trials: PathBuf,
        /// Run set file (append-only JSONL; reused to resume)
        #[arg(long)]
        run_set: PathBuf,
        /// Conditions to run (default: all)
        #[arg(long, value_delimiter = ',')]
        conditions: Option<Vec<String>>,
        /// Only trials in this category
        #[arg(long)]
        category: Option<String>,
        /// Parallel workers
        #[arg(long, default_value_t = 2)]
        concurrency: usize,
        /// Plan the batch without executing anything
        #[arg(long)]
        dry_run: bool,
        /// Re-execute pairs that already passed or failed
        #[arg(long)]
        force: bool,
        /// Keep workspace directories after each trial
        #[arg(long)]
        keep_workspaces: bool,
        /// Run commands directly instead of in containers
        #[arg(long)]
        no_sandbox: bool,
        /// Assistant model override
        #[arg(long)]
        model: Option<String>,
        /// Workspace pool directory
        #[arg(long, default_value = "workspaces")]
        workspaces_dir: PathBuf,
        /// Artifact cache directory
        #[arg(long)]
        cache_dir: Option<PathBuf>,
        /// Sandbox memory limit
        #[arg(long, default_value = "4g")]
        memory: String,
        /// Sandbox CPU limit
        #[arg(long, default_value = "2")]
        cpus: String,
    },
    /// Analyze a run set and render a report
    Report {
        #[arg(long)]
        run_set: PathBuf,
        /// Output path (stdout when omitted)
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long, default_value = "md")]
        format: String,
        #[arg(long, default_value_t = 0.95)]
        confidence: f64,
        /// Difference intervals wider than this are flagged inconclusive
        #[arg(long, default_value_t = 0.5)]
        inconclusive_width: f64,
    },
    /// Export the artifact cache manifest as JSONL
    CacheExport {
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Delete all cached artifacts
    CacheClear {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Scan {
            repo,
            url,
            image,
            setup,
            test_command,
            limit,
            since,
            out,
        } => {
            let options = ScanOptions {
                limit,
                since,
                ..ScanOptions::default()
            };
            let scanned = scanner::scan_repo(&repo, &options).await?;
            eprintln!("[scan] {} candidate trials found", scanned.len());

            let repo_config = RepoConfig {
                url: url.clone(),
                default_branch: "main".to_string(),
                sandbox: SandboxConfig {
                    image,
                    setup,
                    test_command,
                },
                strip_extra: Vec::new(),
            };
            let file = scanner::generate_trial_file(repo_config, scanned);
            let header = format!(
                "# DRAFT - review and curate before running\n# Generated from: {}\n# Trials found: {}\n",
                url,
                file.trials.len()
            );
            std::fs::write(&out, format!("{header}{}", file.to_yaml()?))
                .with_context(|| format!("writing {}", out.display()))?;
            eprintln!("[scan] wrote {}", out.display());
            Ok(())
        }

        Commands::Run {
            trials,
            run_set,
            conditions,
            category,
            concurrency,
            dry_run,
            force,
            keep_workspaces,
            no_sandbox,
            model,
            workspaces_dir,
            cache_dir,
            memory,
            cpus,
        } => {
            let trial_file = TrialFile::from_yaml_path(&trials)
                .with_context(|| format!("loading {}", trials.display()))?;

            let conditions = match conditions {
                Some(names) => names
                    .iter()
                    .map(|n| n.parse::<Condition>())
                    .collect::<Result<Vec<_>, _>>()?,
                None => Condition::all().to_vec(),
            };
            let category = category
                .map(|c| c.parse::<Category>())
                .transpose()?;

            let config = RunConfig {
                workspaces_dir,
                concurrency,
                conditions,
                category,
                force,
                dry_run,
                keep_workspaces,
                limits: ResourceLimits { memory, cpus },
                ..RunConfig::default()
            };

            let store =
                ArtifactStore::open(cache_dir.unwrap_or_else(ArtifactStore::default_root))?;
            let sandbox: Arc<dyn Sandbox> = if no_sandbox {
                Arc::new(ProcessSandbox)
            } else {
                Arc::new(DockerSandbox::new(trial_file.repo.sandbox.image.clone()))
            };
            let harness = Harness {
                sandbox,
                assistant: Arc::new(CliAssistant::with_model(model)),
                store,
            };

            let (cancel_tx, cancel_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("[run] interrupt received; finishing in-flight trials");
                    let _ = cancel_tx.send(true);
                }
            });

            let summary = run_batch(&harness, &trial_file, &run_set, &config, cancel_rx).await?;
            if summary.had_errors() {
                // Errors are harness malfunctions; make them visible to CI.
                std::process::exit(2);
            }
            Ok(())
        }

        Commands::Report {
            run_set,
            out,
            format,
            confidence,
            inconclusive_width,
        } => {
            let set = RunSet::load(&run_set)?;
            let options = AnalysisOptions {
                confidence,
                inconclusive_width,
            };
            let analysis = analyze(&set, &options);
            let name = run_set
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "run".to_string());
            let rendered = match format.as_str() {
                "json" => report::render_json(&analysis)?,
                "md" => report::render_markdown(&analysis, &name),
                other => anyhow::bail!("unknown format: {other} (expected md or json)"),
            };
            match out {
                Some(path) => {
                    std::fs::write(&path, rendered)
                        .with_context(|| format!("writing {}", path.display()))?;
                    eprintln!("[report] wrote {}", path.display());
                }
                None => println!("{rendered}"),
            }
            Ok(())
        }

        Commands::CacheExport { dir, out } => {
            let store = ArtifactStore::open(dir.unwrap_or_else(ArtifactStore::default_root))?;
            store.export_jsonl(&out).await?;
            eprintln!("[cache] exported manifest to {}", out.display());
            Ok(())
        }

        Commands::CacheClear { dir } => {
            let store = ArtifactStore::open(dir.unwrap_or_else(ArtifactStore::default_root))?;
            let deleted = store.clear().await?;
            eprintln!("[cache] cleared {deleted} artifacts");
            Ok(())
        }
    }
}
