//! Embedded outbox backend contract tests.

use std::collections::HashSet;

use lattice_core::db::open_sqlite_pool;
use lattice_core::outbox::{
    ClaimFilter, EnqueueOptions, EventEnvelope, FanoutTarget, GcParams, JobStatus, OutboxStore,
    RetryPolicy, SqliteOutbox,
};
use sqlx::sqlite::SqlitePool;

async fn outbox() -> (tempfile::TempDir, SqlitePool, SqliteOutbox) {
    let dir = tempfile::tempdir().unwrap();
    let pool = open_sqlite_pool(&dir.path().join("outbox.db")).await.unwrap();
    let store = SqliteOutbox::init(pool.clone()).await.unwrap();
    (dir, pool, store)
}

fn envelope(event_id: &str, file: &str, summary: &str) -> EventEnvelope {
    EventEnvelope {
        event_id: event_id.to_string(),
        project: "alpha".to_string(),
        file: file.to_string(),
        summary: summary.to_string(),
        payload: serde_json::json!({"projectName": "alpha", "fileName": file}),
        topic_path: "notes".to_string(),
        topic_tags: vec!["notes".to_string()],
    }
}

fn opts(force_requeue: bool, coalesce: &[FanoutTarget], window_secs: f64) -> EnqueueOptions {
    EnqueueOptions {
        force_requeue,
        coalesce_window_secs: window_secs,
        coalesce_targets: coalesce.iter().copied().collect::<HashSet<_>>(),
        max_attempts: 10,
    }
}

#[tokio::test]
async fn enqueue_is_idempotent_per_event_and_target() {
    let (_dir, _pool, store) = outbox().await;
    let targets = [FanoutTarget::Vector, FanoutTarget::Analytic];

    let first = store
        .enqueue(&envelope("evt-1", "notes/a.md", "hello"), &targets, &opts(false, &[], 0.0))
        .await
        .unwrap();
    assert_eq!(first.inserted, 2);
    assert_eq!(first.existing, 0);

    let second = store
        .enqueue(&envelope("evt-1", "notes/a.md", "hello"), &targets, &opts(false, &[], 0.0))
        .await
        .unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.existing, 2);

    let requeued = store
        .enqueue(&envelope("evt-1", "notes/a.md", "hello"), &targets, &opts(true, &[], 0.0))
        .await
        .unwrap();
    assert_eq!(requeued.requeued, 2);

    let pending = store
        .list_jobs(&[JobStatus::Pending], None, 10)
        .await
        .unwrap();
    assert_eq!(pending.len(), 2);
}

#[tokio::test]
async fn coalescing_collapses_same_file_within_window() {
    let (_dir, _pool, store) = outbox().await;
    let coalesce = [FanoutTarget::Vector];

    let first = store
        .enqueue(
            &envelope("evt-1", "notes/a.md", "first summary"),
            &[FanoutTarget::Vector],
            &opts(false, &coalesce, 30.0),
        )
        .await
        .unwrap();
    assert_eq!(first.inserted, 1);

    let second = store
        .enqueue(
            &envelope("evt-2", "notes/a.md", "latest summary"),
            &[FanoutTarget::Vector],
            &opts(false, &coalesce, 30.0),
        )
        .await
        .unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.coalesced, 1);
    assert_eq!(second.coalesced_by_target.get("vector"), Some(&1));

    let open = store
        .list_jobs(
            &[JobStatus::Pending, JobStatus::Retrying, JobStatus::Running],
            None,
            10,
        )
        .await
        .unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].summary, "latest summary");

    let summary = store.summary().await.unwrap();
    assert_eq!(summary.by_status.get("pending"), Some(&1));
}

#[tokio::test]
async fn coalescing_never_touches_terminal_rows() {
    let (_dir, _pool, store) = outbox().await;
    let coalesce = [FanoutTarget::Vector];

    store
        .enqueue(
            &envelope("evt-1", "notes/a.md", "first"),
            &[FanoutTarget::Vector],
            &opts(false, &coalesce, 30.0),
        )
        .await
        .unwrap();
    let claimed = store.claim_batch(1, ClaimFilter::Any).await.unwrap();
    store.mark_success(claimed[0].id).await.unwrap();

    let next = store
        .enqueue(
            &envelope("evt-2", "notes/a.md", "second"),
            &[FanoutTarget::Vector],
            &opts(false, &coalesce, 30.0),
        )
        .await
        .unwrap();
    assert_eq!(next.coalesced, 0);
    assert_eq!(next.inserted, 1);
}

#[tokio::test]
async fn claim_orders_by_due_time_then_id_and_increments_attempts() {
    let (_dir, _pool, store) = outbox().await;
    for index in 0..3 {
        store
            .enqueue(
                &envelope(&format!("evt-{index}"), &format!("notes/{index}.md"), "s"),
                &[FanoutTarget::Vector],
                &opts(false, &[], 0.0),
            )
            .await
            .unwrap();
    }

    let first_batch = store.claim_batch(2, ClaimFilter::Any).await.unwrap();
    assert_eq!(first_batch.len(), 2);
    assert!(first_batch[0].id < first_batch[1].id);
    assert!(first_batch.iter().all(|job| job.attempts == 1));
    assert!(first_batch.iter().all(|job| job.status == JobStatus::Running));

    let second_batch = store.claim_batch(2, ClaimFilter::Any).await.unwrap();
    assert_eq!(second_batch.len(), 1);

    // Nothing claimable remains.
    assert!(store.claim_batch(2, ClaimFilter::Any).await.unwrap().is_empty());
}

#[tokio::test]
async fn claim_filter_excludes_and_selects_targets() {
    let (_dir, _pool, store) = outbox().await;
    store
        .enqueue(
            &envelope("evt-1", "a.md", "s"),
            &[FanoutTarget::Vector, FanoutTarget::Archival],
            &opts(false, &[], 0.0),
        )
        .await
        .unwrap();

    let general = store
        .claim_batch(10, ClaimFilter::Excluding(FanoutTarget::Archival))
        .await
        .unwrap();
    assert_eq!(general.len(), 1);
    assert_eq!(general[0].target, FanoutTarget::Vector);

    let archival = store
        .claim_batch(10, ClaimFilter::Only(FanoutTarget::Archival))
        .await
        .unwrap();
    assert_eq!(archival.len(), 1);
    assert_eq!(archival[0].target, FanoutTarget::Archival);
}

#[tokio::test]
async fn retry_backoff_then_terminal_failure_at_max_attempts() {
    let (_dir, _pool, store) = outbox().await;
    let mut options = opts(false, &[], 0.0);
    options.max_attempts = 2;
    store
        .enqueue(&envelope("evt-1", "a.md", "s"), &[FanoutTarget::Vector], &options)
        .await
        .unwrap();

    // Zero-base policy keeps the row immediately claimable after a retry.
    let policy = RetryPolicy {
        base_secs: 0.0,
        cap_secs: 0.0,
    };

    let first = store.claim_batch(1, ClaimFilter::Any).await.unwrap();
    store.mark_retry(&first[0], "sink down", &policy).await.unwrap();
    let retrying = store
        .list_jobs(&[JobStatus::Retrying], None, 10)
        .await
        .unwrap();
    assert_eq!(retrying.len(), 1);
    assert_eq!(retrying[0].last_error.as_deref(), Some("sink down"));

    let second = store.claim_batch(1, ClaimFilter::Any).await.unwrap();
    assert_eq!(second[0].attempts, 2);
    store.mark_retry(&second[0], "still down", &policy).await.unwrap();

    let failed = store.list_jobs(&[JobStatus::Failed], None, 10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].completed_at.is_some());
}

#[tokio::test]
async fn stale_running_rows_are_recoverable() {
    let (_dir, _pool, store) = outbox().await;
    store
        .enqueue(&envelope("evt-1", "a.md", "s"), &[FanoutTarget::Vector], &opts(false, &[], 0.0))
        .await
        .unwrap();
    let claimed = store.claim_batch(1, ClaimFilter::Any).await.unwrap();
    assert_eq!(claimed.len(), 1);

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let recovered = store.recover_stale_running(0).await.unwrap();
    assert_eq!(recovered, 1);

    let rows = store
        .list_jobs(&[JobStatus::Retrying], None, 10)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert!(
        rows[0]
            .last_error
            .as_deref()
            .unwrap_or_default()
            .contains("recovered from stale running")
    );

    // And it is claimable again: no row was lost.
    let reclaimed = store.claim_batch(1, ClaimFilter::Any).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].attempts, 2);
}

async fn backdate(pool: &SqlitePool, dedupe_key: &str, status: &str, stamp: &str, completed: bool) {
    let completed_at = completed.then_some(stamp);
    sqlx::query(
        "UPDATE fanout_outbox \
         SET status = ?, created_at = ?, updated_at = ?, next_attempt_at = ?, \
             last_attempt_at = ?, completed_at = ? \
         WHERE dedupe_key = ?",
    )
    .bind(status)
    .bind(stamp)
    .bind(stamp)
    .bind(stamp)
    .bind(stamp)
    .bind(completed_at)
    .bind(dedupe_key)
    .execute(pool)
    .await
    .unwrap();
}

#[tokio::test]
async fn gc_prunes_terminal_and_stale_rows_and_is_idempotent() {
    let (_dir, pool, store) = outbox().await;
    let options = opts(false, &[], 0.0);
    store
        .enqueue(&envelope("evt-1", "notes/a.md", ""), &[FanoutTarget::Vector], &options)
        .await
        .unwrap();
    store
        .enqueue(&envelope("evt-2", "notes/b.md", ""), &[FanoutTarget::Analytic], &options)
        .await
        .unwrap();
    store
        .enqueue(&envelope("evt-3", "notes/c.md", ""), &[FanoutTarget::Archival], &options)
        .await
        .unwrap();
    store
        .enqueue(&envelope("evt-4", "notes/d.md", ""), &[FanoutTarget::Vector], &options)
        .await
        .unwrap();

    let old = "2000-01-01T00:00:00.000Z";
    backdate(&pool, "evt-1:vector", "succeeded", old, true).await;
    backdate(&pool, "evt-2:analytic", "failed", old, true).await;
    backdate(&pool, "evt-3:archival", "retrying", old, false).await;
    // evt-4 stays fresh and must survive.
    sqlx::query("UPDATE fanout_outbox SET status = 'succeeded' WHERE dedupe_key = 'evt-4:vector'")
        .execute(&pool)
        .await
        .unwrap();

    let params = GcParams {
        succeeded_hours: 24,
        failed_hours: 168,
        stale_pending_hours: 24,
        stale_targets: vec![FanoutTarget::Archival],
        vacuum: false,
        vacuum_min_deleted: 500,
        min_vacuum_interval_secs: 86_400,
    };
    let result = store.gc(&params).await.unwrap();
    assert_eq!(result.backend, "sqlite");
    assert_eq!(result.deleted.succeeded, 1);
    assert_eq!(result.deleted.failed, 1);
    assert_eq!(result.deleted.stale_pending_targets, 1);
    assert_eq!(result.deleted.total, 3);
    assert_eq!(result.after_total, 1);
    assert!(result.checkpoint.ok);
    assert!(!result.vacuum.ran);

    // A second run over the same state deletes nothing.
    let again = store.gc(&params).await.unwrap();
    assert_eq!(again.deleted.total, 0);
    assert_eq!(again.after_total, 1);
}

#[tokio::test]
async fn summary_groups_by_status_and_target() {
    let (_dir, _pool, store) = outbox().await;
    store
        .enqueue(
            &envelope("evt-1", "a.md", "s"),
            &[FanoutTarget::Vector, FanoutTarget::Archival],
            &opts(false, &[], 0.0),
        )
        .await
        .unwrap();
    let claimed = store
        .claim_batch(1, ClaimFilter::Only(FanoutTarget::Vector))
        .await
        .unwrap();
    store.mark_success(claimed[0].id).await.unwrap();

    let summary = store.summary().await.unwrap();
    assert_eq!(summary.by_status.get("succeeded"), Some(&1));
    assert_eq!(summary.by_status.get("pending"), Some(&1));
    assert_eq!(summary.outstanding(), 1);
    assert_eq!(summary.outstanding_for(FanoutTarget::Archival), 1);
    assert_eq!(summary.outstanding_for(FanoutTarget::Vector), 0);
}
