//! End-to-end ingest pipeline tests against a real sqlite outbox (no
//! external backends configured).

use std::sync::Arc;

use lattice_config::{LatticeConfig, SecretMode};
use lattice_core::LatticeError;
use lattice_core::fanout::{FanoutHealth, FanoutSignal};
use lattice_core::ingest::{IngestDeps, IngestService, WriteRequest};
use lattice_core::outbox::{
    EnqueueOptions, EventEnvelope, FanoutTarget, JobStatus, OutboxSupervisor,
};
use lattice_core::recent::RecentRing;
use lattice_core::rollup::RollupBuffer;
use lattice_core::topics::TopicTree;

struct Harness {
    _dir: tempfile::TempDir,
    ingest: Arc<IngestService>,
    outbox: Arc<OutboxSupervisor>,
    signal: Arc<FanoutSignal>,
}

async fn harness(mutate: impl FnOnce(&mut LatticeConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let (mut config, _) = LatticeConfig::load();
    config.storage.task_db_path = dir.path().join("tasks.db");
    config.storage.topic_tree_path = dir.path().join("topics.json");
    config.storage.mongo_uri = None;
    config.storage.canonical_url = None;
    config.admission.enabled = false;
    config.fanout.coalesce_targets = vec!["vector".to_string()];
    config.fanout.coalesce_window_secs = 30.0;
    mutate(&mut config);

    let pool = lattice_core::db::open_sqlite_pool(&config.storage.task_db_path)
        .await
        .unwrap();
    let outbox = OutboxSupervisor::init(&config.storage, pool, 5.0)
        .await
        .unwrap();
    let signal = Arc::new(FanoutSignal::new(16));
    let topics = Arc::new(TopicTree::load(config.storage.topic_tree_path.clone()).await);
    let rollups = Arc::new(RollupBuffer::new(config.rollup.flush_secs));
    let recent = Arc::new(RecentRing::new(32, None));

    let ingest = IngestService::new(
        &config,
        IngestDeps {
            outbox: Arc::clone(&outbox),
            signal: Arc::clone(&signal),
            health: Arc::new(FanoutHealth::default()),
            raw: None,
            canonical: None,
            topics,
            rollups,
            recent,
            enabled_targets: vec![FanoutTarget::Vector],
        },
    );
    Harness {
        _dir: dir,
        ingest,
        outbox,
        signal,
    }
}

fn write(project: &str, file: &str, content: &str) -> WriteRequest {
    WriteRequest {
        project: project.to_string(),
        file: file.to_string(),
        content: content.to_string(),
        topic_path: None,
        request_id: None,
    }
}

#[tokio::test]
async fn identical_writes_within_the_window_dedupe() {
    let harness = harness(|_| {}).await;

    let first = harness
        .ingest
        .write(write("alpha", "notes/a.md", "hello"))
        .await
        .unwrap();
    assert!(first.ok);
    assert_eq!(first.deduped, Some(false));
    assert_eq!(first.fanout.get("vector").map(String::as_str), Some("queued"));

    let second = harness
        .ingest
        .write(write("alpha", "notes/a.md", "hello"))
        .await
        .unwrap();
    assert_eq!(second.event_id, first.event_id);
    assert_eq!(second.deduped, Some(true));
    assert!(second.fanout.is_empty());

    // Exactly one durable row and one wake signal.
    let rows = harness
        .outbox
        .list_jobs(&[JobStatus::Pending], None, 10)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert!(harness.signal.wait(std::time::Duration::from_millis(10)).await);
}

#[tokio::test]
async fn differing_writes_to_one_file_coalesce_into_one_row() {
    let harness = harness(|_| {}).await;

    harness
        .ingest
        .write(write("alpha", "notes/a.md", "first version"))
        .await
        .unwrap();
    let second = harness
        .ingest
        .write(write("alpha", "notes/a.md", "second version"))
        .await
        .unwrap();
    assert_eq!(
        second.fanout.get("vector").map(String::as_str),
        Some("coalesced")
    );

    let rows = harness
        .outbox
        .list_jobs(
            &[JobStatus::Pending, JobStatus::Retrying, JobStatus::Running],
            None,
            10,
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].summary, "second version");
}

#[tokio::test]
async fn hot_files_buffer_rollups_and_skip_unchanged_hashes() {
    let harness = harness(|_| {}).await;
    let file = "telemetry/queue__latest.json";

    let first = harness
        .ingest
        .write(write("alpha", file, "{\"queueDepth\":42}"))
        .await
        .unwrap();
    assert_eq!(first.rollup_buffered, Some(true));
    assert!(first.fanout.is_empty());

    let unchanged = harness
        .ingest
        .write(write("alpha", file, "{\"queueDepth\":42}"))
        .await
        .unwrap();
    assert_eq!(unchanged.deduped, Some(true));
    assert_eq!(unchanged.latest_hash_unchanged, Some(true));

    let changed = harness
        .ingest
        .write(write("alpha", file, "{\"queueDepth\":43}"))
        .await
        .unwrap();
    assert_eq!(changed.rollup_buffered, Some(true));

    // Rollup traffic never reaches the outbox.
    let rows = harness
        .outbox
        .list_jobs(&[JobStatus::Pending], None, 10)
        .await
        .unwrap();
    assert!(rows.is_empty());

    let flush = harness.ingest.flush_rollups(true).await;
    assert_eq!(flush["flushed"].as_u64(), Some(1));
}

#[tokio::test]
async fn secret_block_mode_rejects_and_redact_mode_warns() {
    let blocking = harness(|config| {
        config.secrets.storage_mode = SecretMode::Block;
    })
    .await;
    let err = blocking
        .ingest
        .write(write("alpha", "notes/a.md", "api_key=sk-1234567890abcdefghijklmno"))
        .await
        .unwrap_err();
    assert!(matches!(err, LatticeError::Validation(_)));

    let redacting = harness(|config| {
        config.secrets.storage_mode = SecretMode::Redact;
    })
    .await;
    let outcome = redacting
        .ingest
        .write(write("alpha", "notes/b.md", "api_key=sk-1234567890abcdefghijklmno"))
        .await
        .unwrap();
    assert!(outcome.warnings.iter().any(|warning| warning.contains("redacted")));
}

#[tokio::test]
async fn summary_cache_serves_stale_and_refreshes_in_background() {
    let dir = tempfile::tempdir().unwrap();
    let (mut config, _) = LatticeConfig::load();
    config.storage.task_db_path = dir.path().join("tasks.db");
    config.storage.mongo_uri = None;
    let pool = lattice_core::db::open_sqlite_pool(&config.storage.task_db_path)
        .await
        .unwrap();
    let supervisor = OutboxSupervisor::init(&config.storage, pool, 0.05)
        .await
        .unwrap();

    let envelope = |event_id: &str| EventEnvelope {
        event_id: event_id.to_string(),
        project: "alpha".to_string(),
        file: format!("notes/{event_id}.md"),
        summary: "s".to_string(),
        payload: serde_json::json!({}),
        topic_path: "notes".to_string(),
        topic_tags: vec!["notes".to_string()],
    };
    let opts = EnqueueOptions {
        force_requeue: false,
        coalesce_window_secs: 0.0,
        coalesce_targets: Default::default(),
        max_attempts: 10,
    };

    supervisor
        .enqueue(&envelope("evt-1"), &[FanoutTarget::Vector], &opts)
        .await
        .unwrap();
    let first = supervisor.summary_cached().await;
    assert_eq!(first.by_status.get("pending"), Some(&1));

    // Grow the backlog without touching the cache, then let the TTL lapse.
    supervisor
        .enqueue(&envelope("evt-2"), &[FanoutTarget::Vector], &opts)
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // Stale read: the cached snapshot comes back while a background
    // refresh repopulates the cache.
    let stale = supervisor.summary_cached().await;
    assert_eq!(stale.by_status.get("pending"), Some(&1));

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let refreshed = supervisor.summary_cached().await;
    assert_eq!(refreshed.by_status.get("pending"), Some(&2));
}

#[tokio::test]
async fn traversal_paths_are_rejected() {
    let harness = harness(|_| {}).await;
    let err = harness
        .ingest
        .write(write("alpha", "notes/../../etc/passwd", "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, LatticeError::Validation(_)));
}
