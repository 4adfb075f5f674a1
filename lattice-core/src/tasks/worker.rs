//! Internal task worker pool: claim, dispatch, record outcome.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{ActionExecutor, TaskQueue, TaskStatus, WorkerIdentity};

#[derive(Debug, Default)]
pub struct TaskWorkerHealth {
    pub executed: AtomicU64,
    pub failed: AtomicU64,
    pub workers: AtomicU64,
    last_poll_at: std::sync::Mutex<Option<String>>,
}

impl TaskWorkerHealth {
    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "workers": self.workers.load(Ordering::Relaxed),
            "executed": self.executed.load(Ordering::Relaxed),
            "failed": self.failed.load(Ordering::Relaxed),
            "lastPollAt": self
                .last_poll_at
                .lock()
                .expect("task worker health lock poisoned")
                .clone(),
        })
    }

    fn mark_poll(&self) {
        let mut guard = self
            .last_poll_at
            .lock()
            .expect("task worker health lock poisoned");
        *guard = Some(crate::event::now_iso());
    }
}

pub fn spawn_task_workers(
    queue: Arc<TaskQueue>,
    executor: Arc<ActionExecutor>,
    health: Arc<TaskWorkerHealth>,
    workers: usize,
    poll_interval_secs: f64,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    health.workers.store(workers as u64, Ordering::Relaxed);
    (0..workers)
        .map(|index| {
            let queue = Arc::clone(&queue);
            let executor = Arc::clone(&executor);
            let health = Arc::clone(&health);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                run_worker(queue, executor, health, index, poll_interval_secs, shutdown).await;
            })
        })
        .collect()
}

async fn run_worker(
    queue: Arc<TaskQueue>,
    executor: Arc<ActionExecutor>,
    health: Arc<TaskWorkerHealth>,
    index: usize,
    poll_interval_secs: f64,
    mut shutdown: watch::Receiver<bool>,
) {
    let identity = WorkerIdentity::internal(format!("internal-worker-{index}"));
    let poll = Duration::from_secs_f64(poll_interval_secs.max(0.2));
    debug!(target: "lattice::tasks", worker = %identity.name, "task worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        health.mark_poll();
        match queue.claim_next(&identity).await {
            Ok(Some(task)) => {
                let task_id = task.id.clone();
                match executor.execute(&task).await {
                    Ok(result) => {
                        health.executed.fetch_add(1, Ordering::Relaxed);
                        if let Err(err) = queue
                            .update_status(
                                &task_id,
                                TaskStatus::Succeeded,
                                Some("completed by internal worker"),
                                json!({"worker": identity.name}),
                                Some(result),
                            )
                            .await
                        {
                            error!(target: "lattice::tasks", %task_id, %err, "status update failed");
                        }
                    }
                    Err(err) => {
                        health.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(target: "lattice::tasks", %task_id, %err, "task execution failed");
                        if let Err(requeue_err) =
                            queue.requeue_for_retry(&task_id, &err.to_string()).await
                        {
                            error!(
                                target: "lattice::tasks",
                                %task_id,
                                %requeue_err,
                                "retry scheduling failed"
                            );
                        }
                    }
                }
                // Immediately look for the next ready task.
                continue;
            }
            Ok(None) => {}
            Err(err) => {
                error!(target: "lattice::tasks", worker = %identity.name, %err, "claim failed");
            }
        }
        tokio::select! {
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(poll) => {}
        }
    }
    debug!(target: "lattice::tasks", worker = %identity.name, "task worker stopped");
}
