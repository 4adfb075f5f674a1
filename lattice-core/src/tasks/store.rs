//! Sqlite-backed task queue: rows, status events, lease-based claims, and
//! terminal-outcome writes to the canonical store.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};

use crate::canonical::CanonicalClient;
use crate::error::{LatticeError, Result};
use crate::event::{now_iso, timestamp_iso};
use crate::outbox::{RetryPolicy, parse_stored_timestamp, truncate_error};

use super::{
    ActionMeta, TaskCreate, TaskEvent, TaskRow, TaskRuntimeSnapshot, TaskStatus, WorkerIdentity,
    agent_matches,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued',
    project TEXT,
    agent TEXT,
    priority INTEGER NOT NULL DEFAULT 0,
    payload TEXT NOT NULL DEFAULT '{}',
    run_after TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 4,
    lease_expires_at TEXT,
    claimed_by TEXT,
    last_error TEXT,
    result TEXT,
    completed_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    approval_required INTEGER NOT NULL DEFAULT 0,
    approved INTEGER NOT NULL DEFAULT 0,
    risk_level TEXT,
    action_type TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_tasks_claim
    ON tasks (status, run_after, priority);
CREATE TABLE IF NOT EXISTS task_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    status TEXT NOT NULL,
    message TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_task_events_task
    ON task_events (task_id, id);
"#;

#[derive(Debug)]
pub struct TaskQueue {
    pool: SqlitePool,
    canonical: Option<Arc<CanonicalClient>>,
    lease_secs: u64,
    default_max_attempts: u32,
    retry: RetryPolicy,
}

impl TaskQueue {
    pub async fn init(
        pool: SqlitePool,
        canonical: Option<Arc<CanonicalClient>>,
        lease_secs: u64,
        default_max_attempts: u32,
        retry: RetryPolicy,
    ) -> Result<Self> {
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self {
            pool,
            canonical,
            lease_secs,
            default_max_attempts,
            retry,
        })
    }

    pub async fn create(&self, input: TaskCreate, meta: ActionMeta) -> Result<TaskRow> {
        let title = input.title.trim();
        if title.is_empty() {
            return Err(LatticeError::validation("task title must not be empty"));
        }
        let id = uuid::Uuid::new_v4().simple().to_string()[..16].to_string();
        let now = Utc::now();
        let run_after = input.run_after.unwrap_or(now);
        let max_attempts = input.max_attempts.unwrap_or(self.default_max_attempts).max(1);
        sqlx::query(
            "INSERT INTO tasks (\
                 id, title, status, project, agent, priority, payload, run_after, attempts, \
                 max_attempts, created_at, updated_at, approval_required, approved, risk_level, \
                 action_type) \
             VALUES (?, ?, 'queued', ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(&id)
        .bind(title)
        .bind(&input.project)
        .bind(&input.agent)
        .bind(input.priority)
        .bind(serde_json::to_string(&input.payload)?)
        .bind(timestamp_iso(run_after))
        .bind(max_attempts as i64)
        .bind(timestamp_iso(now))
        .bind(timestamp_iso(now))
        .bind(meta.approval_required as i64)
        .bind(meta.risk_level)
        .bind(meta.action_type)
        .execute(&self.pool)
        .await?;
        self.record_event(&id, "queued", Some("task created"), json!({}))
            .await?;
        self.get(&id)
            .await?
            .ok_or_else(|| LatticeError::internal("created task vanished"))
    }

    pub async fn get(&self, id: &str) -> Result<Option<TaskRow>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    pub async fn list(
        &self,
        project: Option<&str>,
        agent: Option<&str>,
        status: Option<TaskStatus>,
        limit: u32,
    ) -> Result<Vec<TaskRow>> {
        let mut sql = String::from("SELECT * FROM tasks WHERE 1=1");
        if project.is_some() {
            sql.push_str(" AND project = ?");
        }
        match agent {
            // "unassigned" is a query keyword: rows with no agent selector.
            Some("unassigned") => sql.push_str(" AND (agent IS NULL OR agent = '')"),
            Some(_) => sql.push_str(" AND agent = ?"),
            None => {}
        }
        if status.is_some() {
            sql.push_str(" AND status = ?");
        }
        sql.push_str(" ORDER BY created_at ASC, id ASC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(project) = project {
            query = query.bind(project);
        }
        if let Some(agent) = agent
            && agent != "unassigned"
        {
            query = query.bind(agent);
        }
        if let Some(status) = status {
            query = query.bind(status.as_str());
        }
        let rows = query
            .bind(limit.clamp(1, 500) as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    pub async fn events(&self, task_id: &str) -> Result<Vec<TaskEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM task_events WHERE task_id = ? ORDER BY id ASC LIMIT 200",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let metadata_raw: String = row.try_get("metadata")?;
                Ok(TaskEvent {
                    id: row.try_get("id")?,
                    task_id: row.try_get("task_id")?,
                    status: row.try_get("status")?,
                    message: row.try_get("message")?,
                    metadata: serde_json::from_str(&metadata_raw)
                        .unwrap_or(serde_json::Value::Null),
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn record_event(
        &self,
        task_id: &str,
        status: &str,
        message: Option<&str>,
        metadata: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO task_events (task_id, status, message, metadata, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(status)
        .bind(message)
        .bind(serde_json::to_string(&metadata)?)
        .bind(now_iso())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Requeue running tasks whose lease expired. Runs before every claim.
    pub async fn recover_expired_leases(&self, limit: u32) -> Result<u64> {
        let now_iso = now_iso();
        let rows = sqlx::query(
            "SELECT id FROM tasks \
             WHERE status = 'running' AND lease_expires_at IS NOT NULL \
               AND lease_expires_at <= ? LIMIT ?",
        )
        .bind(&now_iso)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut recovered = 0u64;
        for row in rows {
            let id: String = row.try_get("id")?;
            sqlx::query(
                "UPDATE tasks \
                 SET status = 'queued', lease_expires_at = NULL, claimed_by = NULL, \
                     updated_at = ? \
                 WHERE id = ? AND status = 'running'",
            )
            .bind(&now_iso)
            .bind(&id)
            .execute(&self.pool)
            .await?;
            self.record_event(&id, "queued", Some("lease expired; task requeued"), json!({}))
                .await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Claim the highest-priority due task matching the worker's affinity.
    pub async fn claim_next(&self, worker: &WorkerIdentity) -> Result<Option<TaskRow>> {
        self.recover_expired_leases(50).await?;

        let now = Utc::now();
        let now_iso = timestamp_iso(now);
        let mut tx = self.pool.begin().await?;
        let candidates = sqlx::query(
            "SELECT * FROM tasks \
             WHERE status IN ('queued','approved') \
               AND run_after <= ? \
               AND attempts < max_attempts \
               AND (approval_required = 0 OR approved = 1) \
             ORDER BY priority DESC, run_after ASC, created_at ASC LIMIT 50",
        )
        .bind(&now_iso)
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed: Option<TaskRow> = None;
        for row in &candidates {
            let mut task = task_from_row(row)?;
            if !agent_matches(task.agent.as_deref(), worker) {
                continue;
            }
            let lease = timestamp_iso(now + ChronoDuration::seconds(self.lease_secs as i64));
            sqlx::query(
                "UPDATE tasks \
                 SET status = 'running', attempts = attempts + 1, lease_expires_at = ?, \
                     claimed_by = ?, updated_at = ? \
                 WHERE id = ?",
            )
            .bind(&lease)
            .bind(&worker.name)
            .bind(&now_iso)
            .bind(&task.id)
            .execute(&mut *tx)
            .await?;
            task.status = TaskStatus::Running;
            task.attempts += 1;
            task.claimed_by = Some(worker.name.clone());
            task.lease_expires_at = Some(parse_stored_timestamp(&lease)?);
            claimed = Some(task);
            break;
        }
        tx.commit().await?;

        if let Some(task) = &claimed {
            self.record_event(
                &task.id,
                "running",
                Some(&format!("claimed by {}", worker.name)),
                json!({"worker": worker.name, "internal": worker.internal}),
            )
            .await?;
        }
        Ok(claimed)
    }

    /// Record a status transition. Terminal statuses also persist a
    /// structured outcome file through the canonical store.
    pub async fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        message: Option<&str>,
        metadata: serde_json::Value,
        result: Option<serde_json::Value>,
    ) -> Result<TaskRow> {
        let existing = self
            .get(id)
            .await?
            .ok_or_else(|| LatticeError::NotFound(format!("task {id} not found")))?;
        if existing.status.is_terminal() && !status.is_terminal() {
            return Err(LatticeError::validation(format!(
                "task {id} is terminal ({}); use replay to requeue",
                existing.status.as_str()
            )));
        }

        let now_iso = now_iso();
        let completed = status.is_terminal();
        sqlx::query(
            "UPDATE tasks \
             SET status = ?, updated_at = ?, \
                 completed_at = CASE WHEN ? THEN ? ELSE completed_at END, \
                 last_error = CASE WHEN ? THEN ? ELSE last_error END, \
                 result = COALESCE(?, result), \
                 lease_expires_at = CASE WHEN ? THEN NULL ELSE lease_expires_at END \
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(&now_iso)
        .bind(completed)
        .bind(&now_iso)
        .bind(status == TaskStatus::Failed)
        .bind(message.map(truncate_error))
        .bind(result.as_ref().map(serde_json::to_string).transpose()?)
        .bind(completed)
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.record_event(id, status.as_str(), message, metadata)
            .await?;

        let task = self
            .get(id)
            .await?
            .ok_or_else(|| LatticeError::NotFound(format!("task {id} not found")))?;
        if completed {
            self.write_outcome(&task).await;
        }
        Ok(task)
    }

    async fn write_outcome(&self, task: &TaskRow) {
        let Some(canonical) = &self.canonical else {
            return;
        };
        let outcome = json!({
            "kind": "task_outcome",
            "task_id": task.id,
            "title": task.title,
            "status": task.status,
            "action_type": task.action_type,
            "attempts": task.attempts,
            "last_error": task.last_error,
            "result": task.result,
            "completed_at": task.completed_at.map(timestamp_iso),
        });
        let project = task.project.as_deref().unwrap_or("_global");
        let file = format!("tasks/{}__latest.json", task.id);
        let rendered = serde_json::to_string_pretty(&outcome).unwrap_or_default();
        if let Err(err) = canonical.write_file(project, &file, &rendered).await {
            tracing::warn!(target: "lattice::tasks", task_id = %task.id, %err, "outcome write failed");
        }
    }

    pub async fn approve(
        &self,
        id: &str,
        approver: Option<&str>,
        note: Option<&str>,
    ) -> Result<TaskRow> {
        let existing = self
            .get(id)
            .await?
            .ok_or_else(|| LatticeError::NotFound(format!("task {id} not found")))?;
        if !matches!(existing.status, TaskStatus::Blocked | TaskStatus::Queued) {
            return Err(LatticeError::validation(format!(
                "task {id} cannot be approved from status {}",
                existing.status.as_str()
            )));
        }
        sqlx::query(
            "UPDATE tasks SET approved = 1, status = 'approved', updated_at = ? WHERE id = ?",
        )
        .bind(now_iso())
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.record_event(
            id,
            "approved",
            note.or(Some("task approved")),
            json!({"approver": approver}),
        )
        .await?;
        self.get(id)
            .await?
            .ok_or_else(|| LatticeError::NotFound(format!("task {id} not found")))
    }

    /// Failed execution path: reschedule with backoff, or terminal-fail when
    /// the attempt budget is spent.
    pub async fn requeue_for_retry(&self, id: &str, error: &str) -> Result<TaskRow> {
        let task = self
            .get(id)
            .await?
            .ok_or_else(|| LatticeError::NotFound(format!("task {id} not found")))?;
        if task.attempts >= task.max_attempts {
            return self
                .update_status(
                    id,
                    TaskStatus::Failed,
                    Some(&format!("max attempts reached: {error}")),
                    json!({"attempts": task.attempts}),
                    None,
                )
                .await;
        }
        let backoff = self.retry.backoff_secs(task.attempts.max(1));
        let run_after = timestamp_iso(
            Utc::now() + ChronoDuration::milliseconds((backoff * 1000.0) as i64),
        );
        sqlx::query(
            "UPDATE tasks \
             SET status = 'queued', run_after = ?, lease_expires_at = NULL, \
                 claimed_by = NULL, last_error = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(&run_after)
        .bind(truncate_error(error))
        .bind(now_iso())
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.record_event(
            id,
            "queued",
            Some(&format!("retry scheduled: {error}")),
            json!({"run_after": run_after}),
        )
        .await?;
        self.get(id)
            .await?
            .ok_or_else(|| LatticeError::NotFound(format!("task {id} not found")))
    }

    /// Unconditionally return a task to the queue, optionally zeroing its
    /// attempt counter. The only sanctioned terminal -> non-terminal move.
    pub async fn replay(
        &self,
        id: &str,
        actor: Option<&str>,
        note: Option<&str>,
        reset_attempts: bool,
    ) -> Result<TaskRow> {
        let _ = self
            .get(id)
            .await?
            .ok_or_else(|| LatticeError::NotFound(format!("task {id} not found")))?;
        let now_iso = now_iso();
        if reset_attempts {
            sqlx::query(
                "UPDATE tasks \
                 SET status = 'queued', attempts = 0, run_after = ?, lease_expires_at = NULL, \
                     claimed_by = NULL, completed_at = NULL, last_error = NULL, updated_at = ? \
                 WHERE id = ?",
            )
            .bind(&now_iso)
            .bind(&now_iso)
            .bind(id)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                "UPDATE tasks \
                 SET status = 'queued', run_after = ?, lease_expires_at = NULL, \
                     claimed_by = NULL, completed_at = NULL, updated_at = ? \
                 WHERE id = ?",
            )
            .bind(&now_iso)
            .bind(&now_iso)
            .bind(id)
            .execute(&self.pool)
            .await?;
        }
        self.record_event(
            id,
            "queued",
            note.or(Some("task replayed")),
            json!({"actor": actor, "reset_attempts": reset_attempts}),
        )
        .await?;
        self.get(id)
            .await?
            .ok_or_else(|| LatticeError::NotFound(format!("task {id} not found")))
    }

    /// Deadletter means the retry budget is spent: failed rows that still
    /// have attempts left are not deadlettered, only terminal-failed.
    pub async fn list_deadletter(&self, project: Option<&str>, limit: u32) -> Result<Vec<TaskRow>> {
        let mut sql = String::from(
            "SELECT * FROM tasks WHERE status = 'failed' AND attempts >= max_attempts",
        );
        if project.is_some() {
            sql.push_str(" AND project = ?");
        }
        sql.push_str(" ORDER BY updated_at DESC, id ASC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(project) = project {
            query = query.bind(project);
        }
        let rows = query
            .bind(limit.clamp(1, 500) as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    pub async fn runtime_snapshot(
        &self,
        workers: serde_json::Value,
    ) -> Result<TaskRuntimeSnapshot> {
        let now_iso = now_iso();
        let mut snapshot = TaskRuntimeSnapshot {
            workers,
            ..TaskRuntimeSnapshot::default()
        };

        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("n")?;
            snapshot.by_status.insert(status, count as u64);
        }

        let ready = sqlx::query(
            "SELECT COUNT(*) AS n FROM tasks \
             WHERE status IN ('queued','approved') \
               AND run_after <= ? \
               AND attempts < max_attempts \
               AND (approval_required = 0 OR approved = 1)",
        )
        .bind(&now_iso)
        .fetch_one(&self.pool)
        .await?;
        snapshot.queue_ready = ready.try_get::<i64, _>("n")? as u64;
        snapshot.running = snapshot.by_status.get("running").copied().unwrap_or(0);

        // Deadletter counts only failures with a spent retry budget.
        let deadletter = sqlx::query(
            "SELECT COUNT(*) AS n FROM tasks \
             WHERE status = 'failed' AND attempts >= max_attempts",
        )
        .fetch_one(&self.pool)
        .await?;
        snapshot.deadletter = deadletter.try_get::<i64, _>("n")? as u64;

        let oldest = sqlx::query(
            "SELECT MIN(run_after) AS oldest FROM tasks WHERE status IN ('queued','approved')",
        )
        .fetch_one(&self.pool)
        .await?;
        snapshot.oldest_run_after = oldest.try_get("oldest")?;
        Ok(snapshot)
    }
}

fn task_from_row(row: &SqliteRow) -> Result<TaskRow> {
    let status_raw: String = row.try_get("status")?;
    let payload_raw: String = row.try_get("payload")?;
    let result_raw: Option<String> = row.try_get("result")?;
    let run_after: String = row.try_get("run_after")?;
    let lease_expires_at: Option<String> = row.try_get("lease_expires_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let attempts: i64 = row.try_get("attempts")?;
    let max_attempts: i64 = row.try_get("max_attempts")?;
    let approval_required: i64 = row.try_get("approval_required")?;
    let approved: i64 = row.try_get("approved")?;

    Ok(TaskRow {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        status: TaskStatus::parse(&status_raw).unwrap_or(TaskStatus::Queued),
        project: row.try_get("project")?,
        agent: row.try_get("agent")?,
        priority: row.try_get("priority")?,
        payload: serde_json::from_str(&payload_raw).unwrap_or(serde_json::Value::Null),
        run_after: parse_stored_timestamp(&run_after)?,
        attempts: attempts as u32,
        max_attempts: max_attempts as u32,
        lease_expires_at: lease_expires_at
            .as_deref()
            .map(parse_stored_timestamp)
            .transpose()?,
        claimed_by: row.try_get("claimed_by")?,
        last_error: row.try_get("last_error")?,
        result: result_raw
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .unwrap_or(None),
        approval_required: approval_required != 0,
        approved: approved != 0,
        risk_level: row.try_get("risk_level")?,
        action_type: row.try_get("action_type")?,
        created_at: parse_stored_timestamp(&created_at)?,
        updated_at: parse_stored_timestamp(&updated_at)?,
        completed_at: completed_at
            .as_deref()
            .map(parse_stored_timestamp)
            .transpose()?,
    })
}

