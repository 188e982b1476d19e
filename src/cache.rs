//! Content-addressed artifact cache with durable, expiring leases.
//!
//! Treatment artifacts (generated context layers) are expensive to build and
//! invariant across trials drawn from the same repository state, so they are
//! shared through this store. The contract of [`ArtifactStore::get_or_build`]:
//!
//! - a terminal entry for a fingerprint is returned without invoking the
//!   builder, after an integrity check against its stored checksum;
//! - otherwise exactly one caller — possibly in another process — wins a
//!   lease row in the SQLite manifest and runs the builder, while all other
//!   callers poll until the entry appears or the lease expires;
//! - a failed build persists nothing and releases the lease;
//! - a lease abandoned by a crashed producer is reclaimed after expiry.
//!
//! Payloads are directories of files written under a temp name and renamed
//! into place, so a partially written artifact is never observable.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::warn;

use crate::trial::Condition;

/// Version tag folded into every fingerprint. Bump when treatment generation
/// changes in a way that invalidates previously cached artifacts.
pub const TREATMENT_VERSION: u32 = 1;

/// Deterministic identity of a cacheable artifact's exact inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub condition: Condition,
    pub repo: String,
    pub revision: String,
    pub treatment_version: u32,
    pub key_hash: String,
}

impl Fingerprint {
    pub fn new(condition: Condition, repo: &str, revision: &str, treatment_version: u32) -> Self {
        let version = treatment_version.to_string();
        let key_hash = hash_fields(&[condition.as_str(), repo, revision, version.as_str()]);
        Self {
            condition,
            repo: repo.to_string(),
            revision: revision.to_string(),
            treatment_version,
            key_hash,
        }
    }
}

/// One file in an artifact payload, path relative to the workspace root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFile {
    pub path: String,
    pub contents: Vec<u8>,
}

/// A verified cache payload.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub fingerprint: String,
    pub files: Vec<ArtifactFile>,
    pub checksum: String,
}

/// Result of a `get_or_build`, tagged with whether the builder ran.
#[derive(Debug, Clone)]
pub struct CacheOutcome {
    pub artifact: Artifact,
    pub cache_hit: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("corrupt cache entry {fingerprint}: {detail}")]
    Corruption { fingerprint: String, detail: String },
    #[error("lease for {fingerprint} held by {holder}; gave up waiting")]
    LeaseConflict { fingerprint: String, holder: String },
    #[error("artifact payload path not workspace-relative: {0}")]
    InvalidPayloadPath(String),
    #[error("artifact build failed: {0}")]
    Build(String),
}

impl CacheError {
    /// Lease contention is transient: the orchestrator retries it with
    /// backoff. Everything else is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::LeaseConflict { .. })
    }
}

/// Tuning knobs for lease waits.
#[derive(Debug, Clone)]
pub struct LeasePolicy {
    /// How long a producer may hold a lease before it is reclaimable.
    pub ttl: Duration,
    /// Polling cadence for waiters.
    pub poll_interval: Duration,
    /// Upper bound on a waiter's patience before surfacing `LeaseConflict`.
    pub wait_max: Duration,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(900),
            poll_interval: Duration::from_millis(500),
            wait_max: Duration::from_secs(960),
        }
    }
}

#[derive(Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    conn: Arc<Mutex<Connection>>,
    policy: LeasePolicy,
    producer_id: String,
}

enum LeaseAttempt {
    Acquired,
    Held { holder: String },
}

impl ArtifactStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, CacheError> {
        Self::open_with_policy(root, LeasePolicy::default())
    }

    pub fn open_with_policy(
        root: impl AsRef<Path>,
        policy: LeasePolicy,
    ) -> Result<Self, CacheError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        let conn = Connection::open(root.join("manifest.sqlite"))?;
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS artifacts (\
               fingerprint TEXT PRIMARY KEY,\
               condition TEXT NOT NULL,\
               repo TEXT NOT NULL,\
               revision TEXT NOT NULL,\
               treatment_version INTEGER NOT NULL,\
               checksum TEXT NOT NULL,\
               file_count INTEGER NOT NULL,\
               producer_id TEXT NOT NULL,\
               created_at INTEGER NOT NULL,\
               hit_count INTEGER NOT NULL DEFAULT 0\
             );\
             CREATE TABLE IF NOT EXISTS leases (\
               fingerprint TEXT PRIMARY KEY,\
               holder TEXT NOT NULL,\
               acquired_at INTEGER NOT NULL,\
               expires_at INTEGER NOT NULL\
             );",
        )?;

        let producer_id = format!("{}-{}", std::process::id(), uuid::Uuid::new_v4());

        Ok(Self {
            root,
            conn: Arc::new(Mutex::new(conn)),
            policy,
            producer_id,
        })
    }

    pub fn default_root() -> PathBuf {
        if let Ok(path) = std::env::var("REPLAY_CACHE_DIR") {
            return PathBuf::from(path);
        }
        PathBuf::from(".replay-cache")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Exclusive store-wide file lock, used by destructive maintenance.
    pub fn lock_exclusive(&self) -> Result<StoreLock, CacheError> {
        StoreLock::new(&self.root)
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError>,
    {
        let guard = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        f(&guard)
    }

    /// Fetch the artifact for `fp`, or run `build` under a durable lease.
    pub async fn get_or_build<F, Fut>(
        &self,
        fp: &Fingerprint,
        build: F,
    ) -> Result<CacheOutcome, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<ArtifactFile>, CacheError>>,
    {
        let deadline = Instant::now() + self.policy.wait_max;

        loop {
            if let Some(artifact) = self.load_verified(fp).await? {
                return Ok(CacheOutcome {
                    artifact,
                    cache_hit: true,
                });
            }

            match self.try_acquire_lease(fp).await? {
                LeaseAttempt::Acquired => break,
                LeaseAttempt::Held { holder } => {
                    if Instant::now() >= deadline {
                        return Err(CacheError::LeaseConflict {
                            fingerprint: fp.key_hash.clone(),
                            holder,
                        });
                    }
                    tokio::time::sleep(self.policy.poll_interval).await;
                }
            }
        }

        // Lease held from here: every exit path must release it.
        let built = build().await;
        let outcome = match built {
            Ok(files) => self.persist(fp, files).await.map(|artifact| CacheOutcome {
                artifact,
                cache_hit: false,
            }),
            Err(e) => Err(e),
        };
        if let Err(release_err) = self.release_lease(fp).await {
            warn!(fingerprint = %fp.key_hash, error = %release_err, "failed to release cache lease");
        }
        outcome
    }

    /// Load and integrity-check an existing entry. `Ok(None)` means absent;
    /// a checksum mismatch or missing payload is `Corruption`, never a
    /// silent rebuild.
    async fn load_verified(&self, fp: &Fingerprint) -> Result<Option<Artifact>, CacheError> {
        let store = self.clone();
        let key = fp.key_hash.clone();
        tokio::task::spawn_blocking(move || {
            let row: Option<String> = store.with_conn(|conn| {
                conn.query_row(
                    "SELECT checksum FROM artifacts WHERE fingerprint = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(CacheError::from)
            })?;
            let Some(expected) = row else {
                return Ok(None);
            };

            let payload_dir = store.payload_dir(&key);
            let files = read_payload_dir(&payload_dir).map_err(|e| CacheError::Corruption {
                fingerprint: key.clone(),
                detail: format!("payload unreadable: {e}"),
            })?;
            let actual = checksum_files(&files);
            if actual != expected {
                return Err(CacheError::Corruption {
                    fingerprint: key.clone(),
                    detail: format!("checksum mismatch: stored {expected}, computed {actual}"),
                });
            }

            store.with_conn(|conn| {
                conn.execute(
                    "UPDATE artifacts SET hit_count = hit_count + 1 WHERE fingerprint = ?1",
                    params![key],
                )?;
                Ok(())
            })?;

            Ok(Some(Artifact {
                fingerprint: key,
                files,
                checksum: actual,
            }))
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    /// One atomic attempt at the lease row: reclaim if expired, then
    /// `INSERT OR IGNORE`. The affected-row count tells us who won.
    async fn try_acquire_lease(&self, fp: &Fingerprint) -> Result<LeaseAttempt, CacheError> {
        let store = self.clone();
        let key = fp.key_hash.clone();
        let ttl_secs = self.policy.ttl.as_secs() as i64;
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let now = now_epoch();
                let reclaimed = conn.execute(
                    "DELETE FROM leases WHERE fingerprint = ?1 AND expires_at < ?2",
                    params![key, now],
                )?;
                if reclaimed > 0 {
                    warn!(fingerprint = %key, "reclaimed expired cache lease from dead producer");
                }
                let inserted = conn.execute(
                    "INSERT OR IGNORE INTO leases (fingerprint, holder, acquired_at, expires_at)\
                     VALUES (?1, ?2, ?3, ?4)",
                    params![key, store.producer_id, now, now + ttl_secs],
                )?;
                if inserted == 1 {
                    return Ok(LeaseAttempt::Acquired);
                }
                let holder: String = conn
                    .query_row(
                        "SELECT holder FROM leases WHERE fingerprint = ?1",
                        params![key],
                        |row| row.get(0),
                    )
                    .optional()?
                    .unwrap_or_else(|| "unknown".to_string());
                Ok(LeaseAttempt::Held { holder })
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    async fn release_lease(&self, fp: &Fingerprint) -> Result<(), CacheError> {
        let store = self.clone();
        let key = fp.key_hash.clone();
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                conn.execute(
                    "DELETE FROM leases WHERE fingerprint = ?1 AND holder = ?2",
                    params![key, store.producer_id],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    /// Write the payload under a temp name, rename into place, then insert
    /// the manifest row. A crash between rename and insert leaves a stale
    /// payload directory that the next producer clears.
    async fn persist(
        &self,
        fp: &Fingerprint,
        files: Vec<ArtifactFile>,
    ) -> Result<Artifact, CacheError> {
        for file in &files {
            let p = Path::new(&file.path);
            if p.is_absolute()
                || p.components()
                    .any(|c| matches!(c, std::path::Component::ParentDir))
            {
                return Err(CacheError::InvalidPayloadPath(file.path.clone()));
            }
        }

        let store = self.clone();
        let fp = fp.clone();
        tokio::task::spawn_blocking(move || {
            let checksum = checksum_files(&files);
            let final_dir = store.payload_dir(&fp.key_hash);
            let tmp_dir = store
                .root
                .join(format!("{}.tmp-{}", fp.key_hash, store.producer_id));

            if tmp_dir.exists() {
                std::fs::remove_dir_all(&tmp_dir)?;
            }
            for file in &files {
                let dest = tmp_dir.join(&file.path);
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&dest, &file.contents)?;
            }

            if final_dir.exists() {
                std::fs::remove_dir_all(&final_dir)?;
            }
            std::fs::rename(&tmp_dir, &final_dir)?;

            store.with_conn(|conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO artifacts (\
                        fingerprint, condition, repo, revision, treatment_version,\
                        checksum, file_count, producer_id, created_at\
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        fp.key_hash,
                        fp.condition.as_str(),
                        fp.repo,
                        fp.revision,
                        fp.treatment_version,
                        checksum,
                        files.len() as i64,
                        store.producer_id,
                        now_epoch(),
                    ],
                )?;
                Ok(())
            })?;

            Ok(Artifact {
                fingerprint: fp.key_hash,
                files,
                checksum,
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    fn payload_dir(&self, key_hash: &str) -> PathBuf {
        self.root.join(key_hash)
    }

    /// Dump the manifest as JSONL for inspection.
    pub async fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<(), CacheError> {
        let path = path.as_ref().to_path_buf();
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT fingerprint, condition, repo, revision, treatment_version,\
                            checksum, file_count, producer_id, created_at, hit_count \
                     FROM artifacts ORDER BY created_at DESC",
                )?;
                let mut rows = stmt.query([])?;
                let mut file = std::fs::File::create(path)?;
                while let Some(row) = rows.next()? {
                    let record = CacheExportRow {
                        fingerprint: row.get(0)?,
                        condition: row.get(1)?,
                        repo: row.get(2)?,
                        revision: row.get(3)?,
                        treatment_version: row.get(4)?,
                        checksum: row.get(5)?,
                        file_count: row.get(6)?,
                        producer_id: row.get(7)?,
                        created_at: row.get(8)?,
                        hit_count: row.get(9)?,
                    };
                    let line = serde_json::to_string(&record)
                        .map_err(|e| CacheError::Serde(e.to_string()))?;
                    use std::io::Write;
                    writeln!(file, "{line}")?;
                }
                Ok(())
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    /// Delete every entry and payload. Takes the store-wide file lock so a
    /// concurrent run in another process cannot observe a half-cleared store.
    pub async fn clear(&self) -> Result<usize, CacheError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let _lock = store.lock_exclusive()?;
            let keys: Vec<String> = store.with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT fingerprint FROM artifacts")?;
                let keys = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(keys)
            })?;
            for key in &keys {
                let dir = store.payload_dir(key);
                if dir.exists() {
                    std::fs::remove_dir_all(dir)?;
                }
            }
            store.with_conn(|conn| {
                conn.execute("DELETE FROM artifacts", [])?;
                conn.execute("DELETE FROM leases", [])?;
                Ok(())
            })?;
            Ok(keys.len())
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

#[derive(Debug, Serialize)]
struct CacheExportRow {
    fingerprint: String,
    condition: String,
    repo: String,
    revision: String,
    treatment_version: i64,
    checksum: String,
    file_count: i64,
    producer_id: String,
    created_at: i64,
    hit_count: i64,
}

#[derive(Debug)]
pub struct StoreLock {
    _file: std::fs::File,
}

impl StoreLock {
    fn new(root: &Path) -> Result<Self, CacheError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(root.join(".lock"))?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

fn read_payload_dir(dir: &Path) -> std::io::Result<Vec<ArtifactFile>> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(std::io::Error::other)?;
        files.push(ArtifactFile {
            path: rel.to_string_lossy().replace('\\', "/"),
            contents: std::fs::read(entry.path())?,
        });
    }
    Ok(files)
}

/// Order-independent checksum over an artifact's files.
pub fn checksum_files(files: &[ArtifactFile]) -> String {
    let mut sorted: Vec<&ArtifactFile> = files.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));
    let mut hasher = blake3::Hasher::new();
    for file in sorted {
        hasher.update(file.path.as_bytes());
        hasher.update(&(file.contents.len() as u64).to_le_bytes());
        hasher.update(&file.contents);
    }
    hasher.finalize().to_hex().to_string()
}

fn hash_fields(fields: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            hasher.update(b"|");
        }
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic_and_input_sensitive() {
        let a = Fingerprint::new(Condition::StructuredLayer, "https://x/repo", "abc123", 1);
        let b = Fingerprint::new(Condition::StructuredLayer, "https://x/repo", "abc123", 1);
        assert_eq!(a.key_hash, b.key_hash);

        let other_rev = Fingerprint::new(Condition::StructuredLayer, "https://x/repo", "abc124", 1);
        assert_ne!(a.key_hash, other_rev.key_hash);

        let other_cond = Fingerprint::new(Condition::FlatContext, "https://x/repo", "abc123", 1);
        assert_ne!(a.key_hash, other_cond.key_hash);

        let other_version =
            Fingerprint::new(Condition::StructuredLayer, "https://x/repo", "abc123", 2);
        assert_ne!(a.key_hash, other_version.key_hash);
    }

    #[test]
    fn checksum_ignores_file_order() {
        let a = ArtifactFile {
            path: "AGENTS.md".to_string(),
            contents: b"alpha".to_vec(),
        };
        let b = ArtifactFile {
            path: "docs/AGENTS.md".to_string(),
            contents: b"beta".to_vec(),
        };
        assert_eq!(
            checksum_files(&[a.clone(), b.clone()]),
            checksum_files(&[b, a])
        );
    }

    #[test]
    fn checksum_distinguishes_path_content_boundary() {
        let a = ArtifactFile {
            path: "ab".to_string(),
            contents: b"c".to_vec(),
        };
        let b = ArtifactFile {
            path: "a".to_string(),
            contents: b"bc".to_vec(),
        };
        assert_ne!(checksum_files(&[a]), checksum_files(&[b]));
    }
}
