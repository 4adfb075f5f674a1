//! Embedded outbox backend on sqlite. Multi-step updates run inside a
//! transaction; timestamps are stored as fixed-width RFC 3339 strings so
//! lexicographic comparison matches chronological order.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};

use crate::error::Result;
use crate::event::timestamp_iso;

use super::{
    ClaimFilter, EnqueueOptions, EnqueueOutcome, EventEnvelope, FanoutTarget, GcCheckpoint,
    GcDeleted, GcParams, GcResult, GcVacuum, JobStatus, OutboxJob, OutboxStore, OutboxSummary,
    RetryPolicy, dedupe_key, parse_stored_timestamp, truncate_error,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS fanout_outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id TEXT NOT NULL,
    target TEXT NOT NULL,
    project TEXT NOT NULL DEFAULT '',
    file TEXT NOT NULL DEFAULT '',
    summary TEXT NOT NULL DEFAULT '',
    payload TEXT NOT NULL DEFAULT '{}',
    topic_path TEXT NOT NULL DEFAULT 'root',
    topic_tags TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 10,
    next_attempt_at TEXT NOT NULL,
    last_attempt_at TEXT,
    completed_at TEXT,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    dedupe_key TEXT NOT NULL UNIQUE
);
CREATE INDEX IF NOT EXISTS idx_outbox_claim
    ON fanout_outbox (status, next_attempt_at);
CREATE INDEX IF NOT EXISTS idx_outbox_target_status
    ON fanout_outbox (target, status);
CREATE INDEX IF NOT EXISTS idx_outbox_coalesce
    ON fanout_outbox (target, project, file, updated_at);
"#;

#[derive(Debug)]
pub struct SqliteOutbox {
    pool: SqlitePool,
    last_vacuum: Mutex<Option<Instant>>,
}

impl SqliteOutbox {
    pub async fn init(pool: SqlitePool) -> Result<Self> {
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self {
            pool,
            last_vacuum: Mutex::new(None),
        })
    }

    async fn status_counts(&self) -> Result<BTreeMap<String, u64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM fanout_outbox GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("n")?;
            counts.insert(status, count as u64);
        }
        Ok(counts)
    }

    async fn total(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM fanout_outbox")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("n")?;
        Ok(count as u64)
    }

    fn vacuum_due(&self, min_interval_secs: u64) -> bool {
        let last = self.last_vacuum.lock().expect("vacuum lock poisoned");
        last.is_none_or(|at| at.elapsed().as_secs() >= min_interval_secs)
    }
}

fn job_from_row(row: &SqliteRow) -> Result<OutboxJob> {
    let target_raw: String = row.try_get("target")?;
    let status_raw: String = row.try_get("status")?;
    let payload_raw: String = row.try_get("payload")?;
    let tags_raw: String = row.try_get("topic_tags")?;
    let next_attempt_at: String = row.try_get("next_attempt_at")?;
    let last_attempt_at: Option<String> = row.try_get("last_attempt_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let attempts: i64 = row.try_get("attempts")?;
    let max_attempts: i64 = row.try_get("max_attempts")?;

    Ok(OutboxJob {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        target: FanoutTarget::parse(&target_raw).unwrap_or(FanoutTarget::Raw),
        project: row.try_get("project")?,
        file: row.try_get("file")?,
        summary: row.try_get("summary")?,
        payload: serde_json::from_str(&payload_raw).unwrap_or(serde_json::Value::Null),
        topic_path: row.try_get("topic_path")?,
        topic_tags: serde_json::from_str(&tags_raw).unwrap_or_default(),
        status: JobStatus::parse(&status_raw).unwrap_or(JobStatus::Pending),
        attempts: attempts as u32,
        max_attempts: max_attempts as u32,
        next_attempt_at: parse_stored_timestamp(&next_attempt_at)?,
        last_attempt_at: last_attempt_at
            .as_deref()
            .map(parse_stored_timestamp)
            .transpose()?,
        completed_at: completed_at
            .as_deref()
            .map(parse_stored_timestamp)
            .transpose()?,
        last_error: row.try_get("last_error")?,
        created_at: parse_stored_timestamp(&created_at)?,
        updated_at: parse_stored_timestamp(&updated_at)?,
        dedupe_key: row.try_get("dedupe_key")?,
    })
}

#[async_trait]
impl OutboxStore for SqliteOutbox {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    async fn enqueue(
        &self,
        envelope: &EventEnvelope,
        targets: &[FanoutTarget],
        opts: &EnqueueOptions,
    ) -> Result<EnqueueOutcome> {
        let now = Utc::now();
        let now_iso = timestamp_iso(now);
        let payload_raw = serde_json::to_string(&envelope.payload)?;
        let tags_raw = serde_json::to_string(&envelope.topic_tags)?;
        let mut outcome = EnqueueOutcome::default();

        let mut tx = self.pool.begin().await?;
        for &target in targets {
            if opts.coalesce_enabled_for(target) {
                let window_cutoff = timestamp_iso(
                    now - ChronoDuration::milliseconds(
                        (opts.coalesce_window_secs * 1000.0) as i64,
                    ),
                );
                let candidate = sqlx::query(
                    "SELECT id FROM fanout_outbox \
                     WHERE target = ?1 AND project = ?2 AND file = ?3 \
                       AND status IN ('pending','retrying','running') \
                       AND updated_at >= ?4 \
                     ORDER BY updated_at DESC LIMIT 1",
                )
                .bind(target.as_str())
                .bind(&envelope.project)
                .bind(&envelope.file)
                .bind(&window_cutoff)
                .fetch_optional(&mut *tx)
                .await?;
                if let Some(row) = candidate {
                    let id: i64 = row.try_get("id")?;
                    sqlx::query(
                        "UPDATE fanout_outbox \
                         SET payload = ?1, summary = ?2, topic_path = ?3, topic_tags = ?4, \
                             next_attempt_at = ?5, updated_at = ?5 \
                         WHERE id = ?6",
                    )
                    .bind(&payload_raw)
                    .bind(&envelope.summary)
                    .bind(&envelope.topic_path)
                    .bind(&tags_raw)
                    .bind(&now_iso)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                    outcome.coalesced += 1;
                    *outcome
                        .coalesced_by_target
                        .entry(target.as_str().to_string())
                        .or_insert(0) += 1;
                    continue;
                }
            }

            let key = dedupe_key(&envelope.event_id, target);
            let inserted = sqlx::query(
                "INSERT INTO fanout_outbox (\
                     event_id, target, project, file, summary, payload, topic_path, topic_tags, \
                     status, attempts, max_attempts, next_attempt_at, created_at, updated_at, dedupe_key) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', 0, ?9, ?10, ?10, ?10, ?11) \
                 ON CONFLICT(dedupe_key) DO NOTHING",
            )
            .bind(&envelope.event_id)
            .bind(target.as_str())
            .bind(&envelope.project)
            .bind(&envelope.file)
            .bind(&envelope.summary)
            .bind(&payload_raw)
            .bind(&envelope.topic_path)
            .bind(&tags_raw)
            .bind(opts.max_attempts as i64)
            .bind(&now_iso)
            .bind(&key)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if inserted > 0 {
                outcome.inserted += 1;
            } else if opts.force_requeue {
                sqlx::query(
                    "UPDATE fanout_outbox \
                     SET status = 'pending', attempts = 0, next_attempt_at = ?1, \
                         completed_at = NULL, last_error = NULL, updated_at = ?1 \
                     WHERE dedupe_key = ?2",
                )
                .bind(&now_iso)
                .bind(&key)
                .execute(&mut *tx)
                .await?;
                outcome.requeued += 1;
            } else {
                outcome.existing += 1;
            }
        }
        tx.commit().await?;
        Ok(outcome)
    }

    async fn claim_batch(&self, limit: u32, filter: ClaimFilter) -> Result<Vec<OutboxJob>> {
        let now_iso = timestamp_iso(Utc::now());
        let mut sql = String::from(
            "SELECT * FROM fanout_outbox \
             WHERE status IN ('pending','retrying') AND next_attempt_at <= ?",
        );
        match filter {
            ClaimFilter::Any => {}
            ClaimFilter::Only(_) => sql.push_str(" AND target = ?"),
            ClaimFilter::Excluding(_) => sql.push_str(" AND target != ?"),
        }
        sql.push_str(" ORDER BY next_attempt_at ASC, id ASC LIMIT ?");

        let mut tx = self.pool.begin().await?;
        let mut query = sqlx::query(&sql).bind(&now_iso);
        if let ClaimFilter::Only(target) | ClaimFilter::Excluding(target) = filter {
            query = query.bind(target.as_str());
        }
        let rows = query.bind(limit as i64).fetch_all(&mut *tx).await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut job = job_from_row(row)?;
            sqlx::query(
                "UPDATE fanout_outbox \
                 SET status = 'running', attempts = attempts + 1, \
                     last_attempt_at = ?1, updated_at = ?1 \
                 WHERE id = ?2",
            )
            .bind(&now_iso)
            .bind(job.id)
            .execute(&mut *tx)
            .await?;
            job.status = JobStatus::Running;
            job.attempts += 1;
            job.last_attempt_at = Some(parse_stored_timestamp(&now_iso)?);
            jobs.push(job);
        }
        tx.commit().await?;
        Ok(jobs)
    }

    async fn mark_success(&self, id: i64) -> Result<()> {
        let now_iso = timestamp_iso(Utc::now());
        sqlx::query(
            "UPDATE fanout_outbox \
             SET status = 'succeeded', completed_at = ?1, updated_at = ?1, last_error = NULL \
             WHERE id = ?2",
        )
        .bind(&now_iso)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        let now_iso = timestamp_iso(Utc::now());
        sqlx::query(
            "UPDATE fanout_outbox \
             SET status = 'failed', completed_at = ?1, updated_at = ?1, last_error = ?2 \
             WHERE id = ?3",
        )
        .bind(&now_iso)
        .bind(truncate_error(error))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_retry(&self, job: &OutboxJob, error: &str, policy: &RetryPolicy) -> Result<()> {
        if job.attempts >= job.max_attempts {
            return self.mark_failed(job.id, error).await;
        }
        let now = Utc::now();
        let backoff = policy.backoff_secs(job.attempts);
        let next = timestamp_iso(now + ChronoDuration::milliseconds((backoff * 1000.0) as i64));
        sqlx::query(
            "UPDATE fanout_outbox \
             SET status = 'retrying', next_attempt_at = ?1, updated_at = ?2, last_error = ?3 \
             WHERE id = ?4",
        )
        .bind(&next)
        .bind(timestamp_iso(now))
        .bind(truncate_error(error))
        .bind(job.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recover_stale_running(&self, max_age_secs: u64) -> Result<u64> {
        let now = Utc::now();
        let cutoff = timestamp_iso(now - ChronoDuration::seconds(max_age_secs as i64));
        let recovered = sqlx::query(
            "UPDATE fanout_outbox \
             SET status = 'retrying', next_attempt_at = ?1, updated_at = ?1, \
                 last_error = COALESCE(NULLIF(last_error, ''), 'recovered from stale running state') \
             WHERE status = 'running' \
               AND COALESCE(last_attempt_at, updated_at, created_at) <= ?2",
        )
        .bind(timestamp_iso(now))
        .bind(&cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(recovered)
    }

    async fn summary(&self) -> Result<OutboxSummary> {
        let by_status = self.status_counts().await?;
        let rows = sqlx::query(
            "SELECT target, status, COUNT(*) AS n FROM fanout_outbox GROUP BY target, status",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut by_target: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
        for row in rows {
            let target: String = row.try_get("target")?;
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("n")?;
            by_target
                .entry(target)
                .or_default()
                .insert(status, count as u64);
        }
        Ok(OutboxSummary {
            by_status,
            by_target,
            updated_at: Some(crate::event::now_iso()),
        })
    }

    async fn gc(&self, params: &GcParams) -> Result<GcResult> {
        let now = Utc::now();
        let before_total = self.total().await?;
        let before_status = self.status_counts().await?;

        let succeeded_cutoff =
            timestamp_iso(now - ChronoDuration::hours(params.succeeded_hours as i64));
        let failed_cutoff = timestamp_iso(now - ChronoDuration::hours(params.failed_hours as i64));
        let pending_cutoff =
            timestamp_iso(now - ChronoDuration::hours(params.stale_pending_hours as i64));

        let mut tx = self.pool.begin().await?;
        let succeeded_deleted = sqlx::query(
            "DELETE FROM fanout_outbox \
             WHERE status = 'succeeded' \
               AND COALESCE(completed_at, updated_at, created_at) < ?1",
        )
        .bind(&succeeded_cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let failed_deleted = sqlx::query(
            "DELETE FROM fanout_outbox \
             WHERE status = 'failed' \
               AND COALESCE(completed_at, updated_at, created_at) < ?1",
        )
        .bind(&failed_cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let mut stale_deleted = 0u64;
        for &target in &params.stale_targets {
            stale_deleted += sqlx::query(
                "DELETE FROM fanout_outbox \
                 WHERE target = ?1 \
                   AND status IN ('pending','retrying','running') \
                   AND COALESCE(last_attempt_at, updated_at, created_at) < ?2",
            )
            .bind(target.as_str())
            .bind(&pending_cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;

        let deleted_total = succeeded_deleted + failed_deleted + stale_deleted;

        let mut checkpoint = GcCheckpoint {
            ok: true,
            error: String::new(),
        };
        if let Err(err) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
        {
            checkpoint.ok = false;
            checkpoint.error = err.to_string();
        }

        let mut vacuum = GcVacuum {
            requested: params.vacuum,
            ran: false,
            min_deleted: params.vacuum_min_deleted,
            error: String::new(),
        };
        if params.vacuum
            && deleted_total >= params.vacuum_min_deleted
            && self.vacuum_due(params.min_vacuum_interval_secs)
        {
            match sqlx::query("VACUUM").execute(&self.pool).await {
                Ok(_) => {
                    vacuum.ran = true;
                    *self.last_vacuum.lock().expect("vacuum lock poisoned") =
                        Some(Instant::now());
                }
                Err(err) => vacuum.error = err.to_string(),
            }
        }

        let after_total = self.total().await?;
        let after_status = self.status_counts().await?;

        let mut retention_hours = BTreeMap::new();
        retention_hours.insert("succeeded".to_string(), params.succeeded_hours);
        retention_hours.insert("failed".to_string(), params.failed_hours);
        retention_hours.insert("stale_pending".to_string(), params.stale_pending_hours);

        Ok(GcResult {
            ok: true,
            backend: "sqlite".to_string(),
            before_total,
            after_total,
            before_status,
            after_status,
            deleted: GcDeleted {
                succeeded: succeeded_deleted,
                failed: failed_deleted,
                stale_pending_targets: stale_deleted,
                total: deleted_total,
            },
            retention_hours,
            stale_targets: params
                .stale_targets
                .iter()
                .map(|target| target.as_str().to_string())
                .collect(),
            checkpoint,
            vacuum,
            timestamp: crate::event::now_iso(),
        })
    }

    async fn list_jobs(
        &self,
        statuses: &[JobStatus],
        target: Option<FanoutTarget>,
        limit: u32,
    ) -> Result<Vec<OutboxJob>> {
        let status_list = statuses
            .iter()
            .map(|status| format!("'{}'", status.as_str()))
            .collect::<Vec<_>>()
            .join(",");
        let mut sql = format!(
            "SELECT * FROM fanout_outbox WHERE status IN ({status_list})"
        );
        if target.is_some() {
            sql.push_str(" AND target = ?");
        }
        sql.push_str(" ORDER BY updated_at DESC LIMIT ");
        sql.push_str(&limit.to_string());

        let rows = if let Some(target) = target {
            sqlx::query(&sql)
                .bind(target.as_str())
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query(&sql).fetch_all(&self.pool).await?
        };
        rows.iter().map(job_from_row).collect()
    }
}
