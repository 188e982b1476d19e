//! Trial definitions: validated, serialized descriptions of replayable bug fixes.
//!
//! A trial file is YAML with one repository block and a curated list of
//! trials. Trials are produced by the scanner, hand-curated, and read-only
//! from then on.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Difficulty bucket assigned from diff size at scan time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    SimpleFix,
    TargetedRefactor,
    ComplexFix,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SimpleFix => "simple_fix",
            Self::TargetedRefactor => "targeted_refactor",
            Self::ComplexFix => "complex_fix",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = TrialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple_fix" => Ok(Self::SimpleFix),
            "targeted_refactor" => Ok(Self::TargetedRefactor),
            "complex_fix" => Ok(Self::ComplexFix),
            other => Err(TrialError::UnknownCategory(other.to_string())),
        }
    }
}

/// Experimental treatment applied before the assistant attempts a fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// No assistance aid of any kind.
    Baseline,
    /// One flat generated context dump at the repository root.
    FlatContext,
    /// Structured knowledge-layer files generated per directory.
    StructuredLayer,
}

impl Condition {
    pub fn all() -> [Condition; 3] {
        [Self::Baseline, Self::FlatContext, Self::StructuredLayer]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::FlatContext => "flat_context",
            Self::StructuredLayer => "structured_layer",
        }
    }

    /// Whether this condition needs a precomputed context artifact.
    pub fn needs_artifact(self) -> bool {
        !matches!(self, Self::Baseline)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Condition {
    type Err = TrialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "baseline" => Ok(Self::Baseline),
            "flat_context" => Ok(Self::FlatContext),
            "structured_layer" => Ok(Self::StructuredLayer),
            other => Err(TrialError::UnknownCondition(other.to_string())),
        }
    }
}

/// Where the fix prompt comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptSource {
    /// Failing test output captured at the pre-fix revision.
    FailingTest,
    /// The fix commit's own message.
    CommitMessage,
    /// An upstream issue title and body.
    Issue,
}

/// Sandbox image and commands for one repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub image: String,
    #[serde(default)]
    pub setup: Vec<String>,
    pub test_command: String,
}

impl SandboxConfig {
    /// Full shell command to verify a trial: setup chain, then the test
    /// command narrowed to the trial's test file / pattern.
    pub fn verification_command(&self, trial: &Trial) -> String {
        let mut cmd = self.test_command.clone();
        if let Some(file) = &trial.test_file {
            cmd.push(' ');
            cmd.push_str(file);
        }
        if let Some(pattern) = &trial.test_pattern {
            cmd.push_str(&format!(" -k '{pattern}'"));
        }
        self.with_setup(&cmd)
    }

    /// Prefix a command with the setup chain.
    pub fn with_setup(&self, cmd: &str) -> String {
        if self.setup.is_empty() {
            cmd.to_string()
        } else {
            format!("{} && {}", self.setup.join(" && "), cmd)
        }
    }
}

/// Repository under experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    pub url: String,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    pub sandbox: SandboxConfig,
    /// Extra context files/dirs to strip beyond the universal patterns.
    #[serde(default)]
    pub strip_extra: Vec<String>,
}

fn default_branch() -> String {
    "main".to_string()
}

impl RepoConfig {
    /// Short name derived from the URL, e.g. `https://host/org/proj.git` → `proj`.
    pub fn slug(&self) -> String {
        let tail = self
            .url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or("repo");
        tail.trim_end_matches(".git").to_string()
    }
}

/// One replayable bug-fix scenario. Immutable once scanned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trial {
    pub id: String,
    pub category: Category,
    pub pre_fix_revision: String,
    pub fix_revision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_pattern: Option<String>,
    pub prompt_source: PromptSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_number: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum TrialError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("trial file has no trials")]
    Empty,
    #[error("duplicate trial id: {0}")]
    DuplicateId(String),
    #[error("invalid trial {trial_id}: {reason}")]
    Invalid { trial_id: String, reason: String },
    #[error("unknown condition: {0}")]
    UnknownCondition(String),
    #[error("unknown category: {0}")]
    UnknownCategory(String),
}

/// The trial definition store: one repository plus its curated trials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialFile {
    pub repo: RepoConfig,
    pub trials: Vec<Trial>,
}

impl TrialFile {
    pub fn from_yaml_path(path: impl AsRef<Path>) -> Result<Self, TrialError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, TrialError> {
        let file: TrialFile = serde_yaml::from_str(raw)?;
        file.validate()?;
        Ok(file)
    }

    pub fn to_yaml(&self) -> Result<String, TrialError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<(), TrialError> {
        if self.trials.is_empty() {
            return Err(TrialError::Empty);
        }
        let mut seen = HashSet::new();
        for trial in &self.trials {
            if trial.id.trim().is_empty() {
                return Err(TrialError::Invalid {
                    trial_id: "<unnamed>".to_string(),
                    reason: "empty id".to_string(),
                });
            }
            if !seen.insert(trial.id.as_str()) {
                return Err(TrialError::DuplicateId(trial.id.clone()));
            }
            for (field, value) in [
                ("pre_fix_revision", &trial.pre_fix_revision),
                ("fix_revision", &trial.fix_revision),
            ] {
                if value.trim().is_empty() {
                    return Err(TrialError::Invalid {
                        trial_id: trial.id.clone(),
                        reason: format!("empty {field}"),
                    });
                }
            }
            if trial.prompt_source == PromptSource::FailingTest && trial.test_file.is_none() {
                return Err(TrialError::Invalid {
                    trial_id: trial.id.clone(),
                    reason: "failing_test trials must name a test_file".to_string(),
                });
            }
            if trial.prompt_source == PromptSource::Issue && trial.issue_number.is_none() {
                return Err(TrialError::Invalid {
                    trial_id: trial.id.clone(),
                    reason: "issue trials must carry an issue_number".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Trials surviving an optional category filter.
    pub fn select(&self, category: Option<Category>) -> Vec<&Trial> {
        self.trials
            .iter()
            .filter(|t| category.map_or(true, |c| t.category == c))
            .collect()
    }
}
