//! Task queue contract tests: affinity, leases, approval gates, retry
//! budgets, and the runtime snapshot.

use lattice_core::db::open_sqlite_pool;
use lattice_core::outbox::RetryPolicy;
use lattice_core::tasks::{
    ActionMeta, TaskCreate, TaskQueue, TaskStatus, WorkerIdentity,
};
use serde_json::json;
use sqlx::sqlite::SqlitePool;

async fn queue_with_lease(lease_secs: u64) -> (tempfile::TempDir, SqlitePool, TaskQueue) {
    let dir = tempfile::tempdir().unwrap();
    let pool = open_sqlite_pool(&dir.path().join("tasks.db")).await.unwrap();
    let queue = TaskQueue::init(
        pool.clone(),
        None,
        lease_secs,
        3,
        RetryPolicy {
            base_secs: 0.0,
            cap_secs: 0.0,
        },
    )
    .await
    .unwrap();
    (dir, pool, queue)
}

fn meta() -> ActionMeta {
    ActionMeta {
        action_type: "memory_write",
        risk_level: "low",
        approval_required: false,
    }
}

fn task(title: &str, agent: Option<&str>, priority: i64) -> TaskCreate {
    TaskCreate {
        title: title.to_string(),
        project: Some("alpha".to_string()),
        agent: agent.map(str::to_string),
        priority,
        payload: json!({"action": "memory_write", "file": "notes/a.md", "content": "x"}),
        run_after: None,
        max_attempts: None,
    }
}

#[tokio::test]
async fn claim_respects_agent_affinity() {
    let (_dir, _pool, queue) = queue_with_lease(60).await;
    let external = queue
        .create(task("external task", Some("codex-subagent"), 9), meta())
        .await
        .unwrap();
    let internal = queue
        .create(task("internal task", Some("internal"), 8), meta())
        .await
        .unwrap();
    let unassigned = queue.create(task("unassigned task", None, 1), meta()).await.unwrap();

    let internal_worker = WorkerIdentity::internal("internal-worker-1");
    let first = queue.claim_next(&internal_worker).await.unwrap().unwrap();
    assert_eq!(first.id, internal.id);
    let second = queue.claim_next(&internal_worker).await.unwrap().unwrap();
    assert_eq!(second.id, unassigned.id);
    assert!(queue.claim_next(&internal_worker).await.unwrap().is_none());

    let codex = WorkerIdentity::external("codex-subagent");
    let third = queue.claim_next(&codex).await.unwrap().unwrap();
    assert_eq!(third.id, external.id);
    assert_eq!(third.claimed_by.as_deref(), Some("codex-subagent"));
    assert_eq!(third.attempts, 1);
}

#[tokio::test]
async fn expired_leases_are_requeued_with_an_event() {
    let (_dir, _pool, queue) = queue_with_lease(0).await;
    let created = queue.create(task("leaky", None, 0), meta()).await.unwrap();

    let worker = WorkerIdentity::internal("internal-worker-0");
    let claimed = queue.claim_next(&worker).await.unwrap().unwrap();
    assert_eq!(claimed.status, TaskStatus::Running);

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let recovered = queue.recover_expired_leases(10).await.unwrap();
    assert_eq!(recovered, 1);

    let reloaded = queue.get(&created.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, TaskStatus::Queued);
    assert!(reloaded.claimed_by.is_none());

    let events = queue.events(&created.id).await.unwrap();
    assert!(
        events
            .iter()
            .any(|event| event.message.as_deref().unwrap_or_default().contains("lease expired"))
    );
}

#[tokio::test]
async fn approval_gate_blocks_claims_until_approved() {
    let (_dir, _pool, queue) = queue_with_lease(60).await;
    let gated_meta = ActionMeta {
        action_type: "http_callback",
        risk_level: "high",
        approval_required: true,
    };
    let created = queue.create(task("call home", None, 5), gated_meta).await.unwrap();
    assert!(created.approval_required);

    let worker = WorkerIdentity::internal("internal-worker-0");
    assert!(queue.claim_next(&worker).await.unwrap().is_none());

    let approved = queue
        .approve(&created.id, Some("operator"), Some("reviewed"))
        .await
        .unwrap();
    assert_eq!(approved.status, TaskStatus::Approved);
    assert!(approved.approved);

    let claimed = queue.claim_next(&worker).await.unwrap().unwrap();
    assert_eq!(claimed.id, created.id);
}

#[tokio::test]
async fn retry_budget_exhaustion_deadletters() {
    let (_dir, _pool, queue) = queue_with_lease(60).await;
    let mut create = task("fragile", None, 0);
    create.max_attempts = Some(1);
    let created = queue.create(create, meta()).await.unwrap();

    let worker = WorkerIdentity::internal("internal-worker-0");
    let claimed = queue.claim_next(&worker).await.unwrap().unwrap();
    assert_eq!(claimed.attempts, 1);

    let failed = queue
        .requeue_for_retry(&created.id, "boom")
        .await
        .unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.last_error.as_deref().unwrap_or_default().contains("max attempts"));

    let deadletter = queue.list_deadletter(Some("alpha"), 10).await.unwrap();
    assert_eq!(deadletter.len(), 1);
    assert_eq!(deadletter[0].id, created.id);
}

#[tokio::test]
async fn retry_below_budget_requeues_with_backoff_event() {
    let (_dir, _pool, queue) = queue_with_lease(60).await;
    let created = queue.create(task("retryable", None, 0), meta()).await.unwrap();
    let worker = WorkerIdentity::internal("internal-worker-0");
    queue.claim_next(&worker).await.unwrap().unwrap();

    let requeued = queue
        .requeue_for_retry(&created.id, "transient upstream")
        .await
        .unwrap();
    assert_eq!(requeued.status, TaskStatus::Queued);
    assert_eq!(requeued.attempts, 1);
    let events = queue.events(&created.id).await.unwrap();
    assert!(
        events
            .iter()
            .any(|event| event.message.as_deref().unwrap_or_default().contains("retry scheduled"))
    );
}

#[tokio::test]
async fn terminal_statuses_only_move_via_replay() {
    let (_dir, _pool, queue) = queue_with_lease(60).await;
    let created = queue.create(task("one shot", None, 0), meta()).await.unwrap();
    queue
        .update_status(
            &created.id,
            TaskStatus::Succeeded,
            Some("done"),
            json!({}),
            Some(json!({"answer": 42})),
        )
        .await
        .unwrap();

    let err = queue
        .update_status(&created.id, TaskStatus::Running, None, json!({}), None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("terminal"));

    let replayed = queue
        .replay(&created.id, Some("operator"), None, true)
        .await
        .unwrap();
    assert_eq!(replayed.status, TaskStatus::Queued);
    assert_eq!(replayed.attempts, 0);
    assert!(replayed.completed_at.is_none());
}

#[tokio::test]
async fn runtime_snapshot_reports_ready_running_and_deadletter() {
    let (_dir, pool, queue) = queue_with_lease(60).await;
    let worker = WorkerIdentity::internal("internal-worker-0");

    // deadletter: the retry budget must actually be spent
    let mut dead_create = task("dead", None, 0);
    dead_create.max_attempts = Some(1);
    let dead = queue.create(dead_create, meta()).await.unwrap();
    assert_eq!(queue.claim_next(&worker).await.unwrap().unwrap().id, dead.id);
    queue.requeue_for_retry(&dead.id, "boom").await.unwrap();

    // failed early with attempts left: failed, but not deadlettered
    let aborted = queue.create(task("aborted", None, 0), meta()).await.unwrap();
    queue
        .update_status(
            &aborted.id,
            TaskStatus::Failed,
            Some("operator abort"),
            json!({}),
            None,
        )
        .await
        .unwrap();

    // ready: plain queued task
    queue.create(task("ready", None, 0), meta()).await.unwrap();
    // ready: approved task with its approval satisfied
    let approved = queue
        .create(
            task("approved", None, 0),
            ActionMeta {
                action_type: "http_callback",
                risk_level: "high",
                approval_required: true,
            },
        )
        .await
        .unwrap();
    queue.approve(&approved.id, None, None).await.unwrap();
    // blocked: approval required but not granted
    queue
        .create(
            task("blocked", None, 0),
            ActionMeta {
                action_type: "http_callback",
                risk_level: "high",
                approval_required: true,
            },
        )
        .await
        .unwrap();
    // future: not yet due
    let future = queue.create(task("future", None, 0), meta()).await.unwrap();
    sqlx::query("UPDATE tasks SET run_after = '2999-01-01T00:00:00.000Z' WHERE id = ?")
        .bind(&future.id)
        .execute(&pool)
        .await
        .unwrap();
    // running
    let running = queue.create(task("running", None, 9), meta()).await.unwrap();
    let claimed = queue.claim_next(&worker).await.unwrap().unwrap();
    assert_eq!(claimed.id, running.id);

    let snapshot = queue.runtime_snapshot(serde_json::Value::Null).await.unwrap();
    assert_eq!(snapshot.queue_ready, 2);
    assert_eq!(snapshot.running, 1);
    assert_eq!(snapshot.deadletter, 1);
    // queued = ready + blocked (awaiting approval) + future
    assert_eq!(snapshot.by_status.get("queued").copied().unwrap_or(0), 3);
    assert_eq!(snapshot.by_status.get("approved").copied().unwrap_or(0), 1);
    // both failures show in the histogram, only one is deadletter
    assert_eq!(snapshot.by_status.get("failed").copied().unwrap_or(0), 2);

    let deadletter = queue.list_deadletter(Some("alpha"), 10).await.unwrap();
    assert_eq!(deadletter.len(), 1);
    assert_eq!(deadletter[0].id, dead.id);
}

#[tokio::test]
async fn list_filters_unassigned_agents() {
    let (_dir, _pool, queue) = queue_with_lease(60).await;
    queue
        .create(task("a", Some("codex-subagent"), 0), meta())
        .await
        .unwrap();
    queue.create(task("b", Some(""), 0), meta()).await.unwrap();
    queue.create(task("c", None, 0), meta()).await.unwrap();

    let codex = queue
        .list(Some("alpha"), Some("codex-subagent"), None, 10)
        .await
        .unwrap();
    assert_eq!(codex.len(), 1);
    assert_eq!(codex[0].title, "a");

    let unassigned = queue
        .list(Some("alpha"), Some("unassigned"), None, 10)
        .await
        .unwrap();
    let titles: Vec<&str> = unassigned.iter().map(|task| task.title.as_str()).collect();
    assert_eq!(titles, vec!["b", "c"]);
}
