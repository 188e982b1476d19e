use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use replay_harness::cache::{
    ArtifactFile, ArtifactStore, CacheError, Fingerprint, LeasePolicy, TREATMENT_VERSION,
};
use replay_harness::trial::Condition;
use tempfile::tempdir;

fn fast_policy() -> LeasePolicy {
    LeasePolicy {
        ttl: Duration::from_secs(5),
        poll_interval: Duration::from_millis(20),
        wait_max: Duration::from_secs(10),
    }
}

fn fp(revision: &str) -> Fingerprint {
    Fingerprint::new(
        Condition::StructuredLayer,
        "https://example.com/org/widget.git",
        revision,
        TREATMENT_VERSION,
    )
}

fn payload(tag: &str) -> Vec<ArtifactFile> {
    vec![
        ArtifactFile {
            path: "CLAUDE.md".to_string(),
            contents: format!("root index {tag}").into_bytes(),
        },
        ArtifactFile {
            path: "src/AGENTS.md".to_string(),
            contents: format!("src notes {tag}").into_bytes(),
        },
    ]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_build_once_and_see_identical_bytes() {
    let dir = tempdir().unwrap();
    // Two store handles with separate connections, standing in for
    // separate worker processes sharing one cache directory.
    let store_a = ArtifactStore::open_with_policy(dir.path(), fast_policy()).unwrap();
    let store_b = ArtifactStore::open_with_policy(dir.path(), fast_policy()).unwrap();

    let builds = Arc::new(AtomicUsize::new(0));
    let fingerprint = fp("abc123");

    let mut tasks = Vec::new();
    for i in 0..8 {
        let store = if i % 2 == 0 {
            store_a.clone()
        } else {
            store_b.clone()
        };
        let builds = builds.clone();
        let fingerprint = fingerprint.clone();
        tasks.push(tokio::spawn(async move {
            store
                .get_or_build(&fingerprint, || async move {
                    builds.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(payload("shared"))
                })
                .await
                .unwrap()
        }));
    }

    let mut checksums = Vec::new();
    let mut hits = 0;
    for task in tasks {
        let outcome = task.await.unwrap();
        checksums.push(outcome.artifact.checksum.clone());
        if outcome.cache_hit {
            hits += 1;
        }
        assert_eq!(outcome.artifact.files.len(), 2);
    }

    assert_eq!(builds.load(Ordering::SeqCst), 1, "builder must run exactly once");
    assert_eq!(hits, 7, "every caller but the producer is a hit");
    assert!(checksums.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test]
async fn second_call_reuses_entry_without_invoking_builder() {
    let dir = tempdir().unwrap();
    let store = ArtifactStore::open_with_policy(dir.path(), fast_policy()).unwrap();
    let fingerprint = fp("abc123");

    let first = store
        .get_or_build(&fingerprint, || async { Ok(payload("v1")) })
        .await
        .unwrap();
    assert!(!first.cache_hit);

    // Same inputs from a second scheduled trial: identical fingerprint,
    // builder never runs.
    let again = fp("abc123");
    assert_eq!(again.key_hash, fingerprint.key_hash);
    let second = store
        .get_or_build(&again, || async {
            panic!("builder must not run on a cache hit")
        })
        .await
        .unwrap();
    assert!(second.cache_hit);
    assert_eq!(second.artifact.checksum, first.artifact.checksum);
    assert_eq!(second.artifact.files, first.artifact.files);
}

#[tokio::test]
async fn failed_build_persists_nothing_and_releases_the_lease() {
    let dir = tempdir().unwrap();
    let store = ArtifactStore::open_with_policy(dir.path(), fast_policy()).unwrap();
    let fingerprint = fp("abc123");

    let failed = store
        .get_or_build(&fingerprint, || async {
            Err(CacheError::Build("generator crashed".to_string()))
        })
        .await;
    assert!(matches!(failed, Err(CacheError::Build(_))));

    // The lease is gone, so a retry builds fresh instead of deadlocking.
    let retry = store
        .get_or_build(&fingerprint, || async { Ok(payload("retry")) })
        .await
        .unwrap();
    assert!(!retry.cache_hit);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expired_lease_from_dead_producer_is_reclaimed() {
    let dir = tempdir().unwrap();
    let short_ttl = LeasePolicy {
        ttl: Duration::from_secs(1),
        poll_interval: Duration::from_millis(50),
        wait_max: Duration::from_secs(30),
    };
    let dead = ArtifactStore::open_with_policy(dir.path(), short_ttl.clone()).unwrap();
    let alive = ArtifactStore::open_with_policy(dir.path(), short_ttl).unwrap();
    let fingerprint = fp("abc123");

    // A producer that acquires the lease and then never finishes.
    let hung = {
        let fingerprint = fingerprint.clone();
        tokio::spawn(async move {
            dead.get_or_build(&fingerprint, || async {
                tokio::time::sleep(Duration::from_secs(300)).await;
                Ok(payload("never"))
            })
            .await
        })
    };
    // Give it time to win the lease, then pass the one-second expiry.
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let outcome = alive
        .get_or_build(&fingerprint, || async { Ok(payload("reclaimed")) })
        .await
        .unwrap();
    assert!(!outcome.cache_hit);
    assert_eq!(outcome.artifact.files[0].contents, b"root index reclaimed");

    hung.abort();
}

#[tokio::test]
async fn tampered_payload_is_detected_not_served() {
    let dir = tempdir().unwrap();
    let store = ArtifactStore::open_with_policy(dir.path(), fast_policy()).unwrap();
    let fingerprint = fp("abc123");

    store
        .get_or_build(&fingerprint, || async { Ok(payload("v1")) })
        .await
        .unwrap();

    // Corrupt the stored payload behind the manifest's back.
    let payload_path = dir.path().join(&fingerprint.key_hash).join("CLAUDE.md");
    std::fs::write(&payload_path, "tampered").unwrap();

    let result = store
        .get_or_build(&fingerprint, || async { Ok(payload("v1")) })
        .await;
    assert!(matches!(result, Err(CacheError::Corruption { .. })));
}

#[tokio::test]
async fn traversal_paths_in_payload_are_rejected() {
    let dir = tempdir().unwrap();
    let store = ArtifactStore::open_with_policy(dir.path(), fast_policy()).unwrap();
    let fingerprint = fp("abc123");

    let result = store
        .get_or_build(&fingerprint, || async {
            Ok(vec![ArtifactFile {
                path: "../escape.md".to_string(),
                contents: b"nope".to_vec(),
            }])
        })
        .await;
    assert!(matches!(result, Err(CacheError::InvalidPayloadPath(_))));
}

#[tokio::test]
async fn export_and_clear_cover_the_manifest() {
    let dir = tempdir().unwrap();
    let store = ArtifactStore::open_with_policy(dir.path(), fast_policy()).unwrap();

    store
        .get_or_build(&fp("abc123"), || async { Ok(payload("a")) })
        .await
        .unwrap();
    store
        .get_or_build(&fp("def456"), || async { Ok(payload("b")) })
        .await
        .unwrap();

    let export = dir.path().join("export.jsonl");
    store.export_jsonl(&export).await.unwrap();
    let raw = std::fs::read_to_string(&export).unwrap();
    assert_eq!(raw.lines().count(), 2);
    let row: serde_json::Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
    assert_eq!(row["condition"], "structured_layer");
    assert_eq!(row["file_count"], 2);

    let deleted = store.clear().await.unwrap();
    assert_eq!(deleted, 2);
    let rebuilt = store
        .get_or_build(&fp("abc123"), || async { Ok(payload("a")) })
        .await
        .unwrap();
    assert!(!rebuilt.cache_hit);
}
