//! History scanner: mines a repository's commit log for candidate bug-fix
//! trials.
//!
//! Scanning is read-only and shallow by design — pattern matching on commit
//! messages, diff-size bounds, and test-file correlation. Output is a draft
//! trial file meant to be curated by hand before a run.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::git::{self, GitError};
use crate::trial::{Category, PromptSource, RepoConfig, Trial, TrialFile};

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("repository unreachable at {path}: {source}")]
    RepoUnreachable {
        path: String,
        #[source]
        source: GitError,
    },
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("no bug-fix commits matched in {scanned} commits")]
    NoMatches { scanned: usize },
}

static BUG_FIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bfix\b|\bbug\b|\bfixes?\s+#\d+|\bcloses?\s+#\d+|\bresolves?\s+#\d+")
        .expect("bug fix pattern")
});

static ISSUE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"#(\d+)").expect("issue pattern"));

static TEST_PATH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)test|spec").expect("test pattern"));

static FILES_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+) files? changed").expect("files pattern"));
static INSERTIONS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+) insertions?").expect("insertions pattern"));
static DELETIONS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+) deletions?").expect("deletions pattern"));

/// True when a commit message reads like a bug fix.
pub fn is_bug_fix(message: &str) -> bool {
    BUG_FIX_RE.is_match(message)
}

/// Size-based category, matching the curation buckets.
pub fn categorize(lines: u64, files: u64) -> Category {
    if lines < 50 && files <= 2 {
        Category::SimpleFix
    } else if lines < 200 && files <= 5 {
        Category::TargetedRefactor
    } else {
        Category::ComplexFix
    }
}

/// Lowercase slug of the message head, for trial ids.
pub fn slugify(text: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for c in text.chars().take(64) {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    slug.chars().take(50).collect()
}

fn capture_u64(re: &Regex, haystack: &str) -> u64 {
    re.captures(haystack)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// Parse `git diff --shortstat` output into (lines, files).
pub fn parse_shortstat(output: &str) -> (u64, u64) {
    let files = capture_u64(&FILES_RE, output);
    let lines = capture_u64(&INSERTIONS_RE, output) + capture_u64(&DELETIONS_RE, output);
    (lines, files)
}

/// A candidate trial plus the scan evidence that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct ScannedTrial {
    pub trial: Trial,
    pub commit_message: String,
    pub lines_changed: u64,
    pub files_changed: u64,
}

/// Scan options: how far back and how many candidates to keep.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub limit: usize,
    pub since: Option<String>,
    pub max_lines_changed: u64,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            limit: 50,
            since: None,
            max_lines_changed: 1000,
        }
    }
}

/// Scan a local clone for bug-fix commits.
///
/// Over-fetches the log (10x limit), filters by message pattern, resolves
/// parents, and keeps at most `limit` candidates. Commits that fail parent
/// resolution or stat collection are skipped, so partial history damage
/// yields partial results rather than a failed scan.
pub async fn scan_repo(repo: &Path, options: &ScanOptions) -> Result<Vec<ScannedTrial>, ScanError> {
    let lines = git::log_lines(repo, "%H|%s", options.limit * 10, options.since.as_deref())
        .await
        .map_err(|source| ScanError::RepoUnreachable {
            path: repo.display().to_string(),
            source,
        })?;

    let mut scanned = Vec::new();
    let mut inspected = 0usize;

    for line in &lines {
        let Some((hash, message)) = line.split_once('|') else {
            continue;
        };
        inspected += 1;
        if !is_bug_fix(message) {
            continue;
        }

        let Some(parent) = git::parent_revision(repo, hash).await? else {
            debug!(revision = hash, "skipping root commit");
            continue;
        };

        let shortstat = git::commit_shortstat(repo, hash).await?;
        let (lines_changed, files_changed) = parse_shortstat(&shortstat);
        if lines_changed == 0 || lines_changed > options.max_lines_changed {
            continue;
        }

        let test_file = git::commit_files(repo, hash)
            .await?
            .into_iter()
            .find(|f| TEST_PATH_RE.is_match(f));

        let issue_number = ISSUE_RE
            .captures(message)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok());

        let prompt_source = if test_file.is_some() {
            PromptSource::FailingTest
        } else {
            PromptSource::CommitMessage
        };

        scanned.push(ScannedTrial {
            trial: Trial {
                id: slugify(message),
                category: categorize(lines_changed, files_changed),
                pre_fix_revision: parent,
                fix_revision: hash.to_string(),
                test_file,
                test_pattern: None,
                prompt_source,
                issue_number,
            },
            commit_message: message.to_string(),
            lines_changed,
            files_changed,
        });

        if scanned.len() >= options.limit {
            break;
        }
    }

    if scanned.is_empty() {
        return Err(ScanError::NoMatches { scanned: inspected });
    }

    dedupe_ids(&mut scanned);
    Ok(scanned)
}

/// Distinct messages can slugify identically; suffix later collisions.
fn dedupe_ids(scanned: &mut [ScannedTrial]) {
    let mut seen = std::collections::HashMap::new();
    for entry in scanned.iter_mut() {
        let count: &mut usize = seen.entry(entry.trial.id.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            entry.trial.id = format!("{}-{}", entry.trial.id, count);
        }
    }
}

/// Render a curated-draft trial file from scan results.
pub fn generate_trial_file(repo: RepoConfig, scanned: Vec<ScannedTrial>) -> TrialFile {
    TrialFile {
        repo,
        trials: scanned.into_iter().map(|s| s.trial).collect(),
    }
}
