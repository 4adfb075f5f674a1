//! Document-store outbox backend. There is no multi-document transaction
//! here; every state transition is a single find-and-modify, which preserves
//! the claim/mark atomicity the contract requires.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use futures::TryStreamExt;
use mongodb::bson::{Bson, Document, doc};
use mongodb::options::ReturnDocument;
use mongodb::{Client, Collection, IndexModel};

use crate::error::{LatticeError, Result};
use crate::event::timestamp_iso;

use super::{
    ClaimFilter, EnqueueOptions, EnqueueOutcome, EventEnvelope, FanoutTarget, GcCheckpoint,
    GcDeleted, GcParams, GcResult, GcVacuum, JobStatus, OutboxJob, OutboxStore, OutboxSummary,
    RetryPolicy, dedupe_key, parse_stored_timestamp, truncate_error,
};

const NON_TERMINAL: [&str; 3] = ["pending", "retrying", "running"];

pub struct MongoOutbox {
    jobs: Collection<Document>,
    counters: Collection<Document>,
}

impl std::fmt::Debug for MongoOutbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoOutbox")
            .field("collection", &self.jobs.name())
            .finish()
    }
}

impl MongoOutbox {
    /// Connect and verify the deployment is reachable. A failure here is an
    /// init failure, which the supervisor may answer with demotion.
    pub async fn connect(uri: &str, db_name: &str, collection: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri).await?;
        let db = client.database(db_name);
        db.run_command(doc! {"ping": 1}).await?;
        let jobs = db.collection::<Document>(collection);
        let counters = db.collection::<Document>("counters");
        let unique = mongodb::options::IndexOptions::builder()
            .unique(true)
            .build();
        jobs.create_index(
            IndexModel::builder()
                .keys(doc! {"dedupe_key": 1})
                .options(unique)
                .build(),
        )
        .await?;
        jobs.create_index(
            IndexModel::builder()
                .keys(doc! {"status": 1, "next_attempt_at": 1})
                .build(),
        )
        .await?;
        Ok(Self { jobs, counters })
    }

    async fn next_id(&self) -> Result<i64> {
        let updated = self
            .counters
            .find_one_and_update(
                doc! {"_id": "fanout_outbox"},
                doc! {"$inc": {"seq": 1i64}},
            )
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await?;
        let seq = updated
            .as_ref()
            .and_then(|doc| doc.get_i64("seq").ok())
            .ok_or_else(|| LatticeError::Integrity("outbox counter unavailable".to_string()))?;
        Ok(seq)
    }

    async fn status_counts(&self) -> Result<BTreeMap<String, u64>> {
        let mut cursor = self
            .jobs
            .aggregate(vec![doc! {"$group": {"_id": "$status", "n": {"$sum": 1}}}])
            .await?;
        let mut counts = BTreeMap::new();
        while let Some(entry) = cursor.try_next().await? {
            let status = entry.get_str("_id").unwrap_or("unknown").to_string();
            let count = match entry.get("n") {
                Some(Bson::Int32(n)) => *n as u64,
                Some(Bson::Int64(n)) => *n as u64,
                _ => 0,
            };
            counts.insert(status, count);
        }
        Ok(counts)
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    err.to_string().contains("E11000")
}

fn job_document(
    id: i64,
    envelope: &EventEnvelope,
    target: FanoutTarget,
    max_attempts: u32,
    now_iso: &str,
) -> Result<Document> {
    Ok(doc! {
        "id": id,
        "event_id": &envelope.event_id,
        "target": target.as_str(),
        "project": &envelope.project,
        "file": &envelope.file,
        "summary": &envelope.summary,
        "payload": serde_json::to_string(&envelope.payload)?,
        "topic_path": &envelope.topic_path,
        "topic_tags": serde_json::to_string(&envelope.topic_tags)?,
        "status": "pending",
        "attempts": 0i64,
        "max_attempts": max_attempts as i64,
        "next_attempt_at": now_iso,
        "last_attempt_at": Bson::Null,
        "completed_at": Bson::Null,
        "last_error": Bson::Null,
        "created_at": now_iso,
        "updated_at": now_iso,
        "dedupe_key": dedupe_key(&envelope.event_id, target),
    })
}

fn job_from_doc(entry: &Document) -> Result<OutboxJob> {
    let get_opt = |key: &str| -> Option<String> {
        entry
            .get_str(key)
            .ok()
            .filter(|raw| !raw.is_empty())
            .map(str::to_string)
    };
    let payload_raw = entry.get_str("payload").unwrap_or("null");
    let tags_raw = entry.get_str("topic_tags").unwrap_or("[]");
    let created_at = entry.get_str("created_at").unwrap_or_default();
    let updated_at = entry.get_str("updated_at").unwrap_or_default();
    let next_attempt_at = entry.get_str("next_attempt_at").unwrap_or_default();
    Ok(OutboxJob {
        id: entry.get_i64("id").unwrap_or_default(),
        event_id: entry.get_str("event_id").unwrap_or_default().to_string(),
        target: FanoutTarget::parse(entry.get_str("target").unwrap_or_default())
            .unwrap_or(FanoutTarget::Raw),
        project: entry.get_str("project").unwrap_or_default().to_string(),
        file: entry.get_str("file").unwrap_or_default().to_string(),
        summary: entry.get_str("summary").unwrap_or_default().to_string(),
        payload: serde_json::from_str(payload_raw).unwrap_or(serde_json::Value::Null),
        topic_path: entry.get_str("topic_path").unwrap_or_default().to_string(),
        topic_tags: serde_json::from_str(tags_raw).unwrap_or_default(),
        status: JobStatus::parse(entry.get_str("status").unwrap_or_default())
            .unwrap_or(JobStatus::Pending),
        attempts: entry.get_i64("attempts").unwrap_or_default() as u32,
        max_attempts: entry.get_i64("max_attempts").unwrap_or(10) as u32,
        next_attempt_at: parse_stored_timestamp(next_attempt_at)?,
        last_attempt_at: get_opt("last_attempt_at")
            .as_deref()
            .map(parse_stored_timestamp)
            .transpose()?,
        completed_at: get_opt("completed_at")
            .as_deref()
            .map(parse_stored_timestamp)
            .transpose()?,
        last_error: get_opt("last_error"),
        created_at: parse_stored_timestamp(created_at)?,
        updated_at: parse_stored_timestamp(updated_at)?,
        dedupe_key: entry.get_str("dedupe_key").unwrap_or_default().to_string(),
    })
}

#[async_trait]
impl OutboxStore for MongoOutbox {
    fn kind(&self) -> &'static str {
        "mongo"
    }

    async fn enqueue(
        &self,
        envelope: &EventEnvelope,
        targets: &[FanoutTarget],
        opts: &EnqueueOptions,
    ) -> Result<EnqueueOutcome> {
        let now = Utc::now();
        let now_iso = timestamp_iso(now);
        let mut outcome = EnqueueOutcome::default();

        for &target in targets {
            if opts.coalesce_enabled_for(target) {
                let cutoff = timestamp_iso(
                    now - ChronoDuration::milliseconds(
                        (opts.coalesce_window_secs * 1000.0) as i64,
                    ),
                );
                let coalesced = self
                    .jobs
                    .find_one_and_update(
                        doc! {
                            "target": target.as_str(),
                            "project": &envelope.project,
                            "file": &envelope.file,
                            "status": {"$in": NON_TERMINAL.to_vec()},
                            "updated_at": {"$gte": cutoff},
                        },
                        doc! {"$set": {
                            "payload": serde_json::to_string(&envelope.payload)?,
                            "summary": &envelope.summary,
                            "topic_path": &envelope.topic_path,
                            "topic_tags": serde_json::to_string(&envelope.topic_tags)?,
                            "next_attempt_at": &now_iso,
                            "updated_at": &now_iso,
                        }},
                    )
                    .sort(doc! {"updated_at": -1})
                    .await?;
                if coalesced.is_some() {
                    outcome.coalesced += 1;
                    *outcome
                        .coalesced_by_target
                        .entry(target.as_str().to_string())
                        .or_insert(0) += 1;
                    continue;
                }
            }

            let id = self.next_id().await?;
            let document = job_document(id, envelope, target, opts.max_attempts, &now_iso)?;
            match self.jobs.insert_one(document).await {
                Ok(_) => outcome.inserted += 1,
                Err(err) if is_duplicate_key(&err) => {
                    if opts.force_requeue {
                        self.jobs
                            .update_one(
                                doc! {"dedupe_key": dedupe_key(&envelope.event_id, target)},
                                doc! {"$set": {
                                    "status": "pending",
                                    "attempts": 0i64,
                                    "next_attempt_at": &now_iso,
                                    "completed_at": Bson::Null,
                                    "last_error": Bson::Null,
                                    "updated_at": &now_iso,
                                }},
                            )
                            .await?;
                        outcome.requeued += 1;
                    } else {
                        outcome.existing += 1;
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(outcome)
    }

    async fn claim_batch(&self, limit: u32, filter: ClaimFilter) -> Result<Vec<OutboxJob>> {
        let now_iso = timestamp_iso(Utc::now());
        let mut base = doc! {
            "status": {"$in": ["pending", "retrying"]},
            "next_attempt_at": {"$lte": &now_iso},
        };
        match filter {
            ClaimFilter::Any => {}
            ClaimFilter::Only(target) => {
                base.insert("target", target.as_str());
            }
            ClaimFilter::Excluding(target) => {
                base.insert("target", doc! {"$ne": target.as_str()});
            }
        }

        let mut claimed = Vec::new();
        for _ in 0..limit {
            let job = self
                .jobs
                .find_one_and_update(
                    base.clone(),
                    doc! {
                        "$set": {
                            "status": "running",
                            "last_attempt_at": &now_iso,
                            "updated_at": &now_iso,
                        },
                        "$inc": {"attempts": 1i64},
                    },
                )
                .sort(doc! {"next_attempt_at": 1, "id": 1})
                .return_document(ReturnDocument::After)
                .await?;
            match job {
                Some(entry) => claimed.push(job_from_doc(&entry)?),
                None => break,
            }
        }
        Ok(claimed)
    }

    async fn mark_success(&self, id: i64) -> Result<()> {
        let now_iso = timestamp_iso(Utc::now());
        self.jobs
            .update_one(
                doc! {"id": id},
                doc! {"$set": {
                    "status": "succeeded",
                    "completed_at": &now_iso,
                    "updated_at": &now_iso,
                    "last_error": Bson::Null,
                }},
            )
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        let now_iso = timestamp_iso(Utc::now());
        self.jobs
            .update_one(
                doc! {"id": id},
                doc! {"$set": {
                    "status": "failed",
                    "completed_at": &now_iso,
                    "updated_at": &now_iso,
                    "last_error": truncate_error(error),
                }},
            )
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
        self.jobs
            .update_one(
                doc! {"id": job.id},
                doc! {"$set": {
                    "status": "retrying",
                    "next_attempt_at": next,
                    "updated_at": timestamp_iso(now),
                    "last_error": truncate_error(error),
                }},
            )
            .await?;
        Ok(())
    }

    async fn recover_stale_running(&self, max_age_secs: u64) -> Result<u64> {
        let now = Utc::now();
        let cutoff = timestamp_iso(now - ChronoDuration::seconds(max_age_secs as i64));
        let result = self
            .jobs
            .update_many(
                doc! {
                    "status": "running",
                    "last_attempt_at": {"$lte": cutoff},
                },
                doc! {"$set": {
                    "status": "retrying",
                    "next_attempt_at": timestamp_iso(now),
                    "updated_at": timestamp_iso(now),
                }},
            )
            .await?;
        Ok(result.modified_count)
    }

    async fn summary(&self) -> Result<OutboxSummary> {
        let by_status = self.status_counts().await?;
        let mut cursor = self
            .jobs
            .aggregate(vec![doc! {"$group": {
                "_id": {"target": "$target", "status": "$status"},
                "n": {"$sum": 1},
            }}])
            .await?;
        let mut by_target: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
        while let Some(entry) = cursor.try_next().await? {
            let Ok(key) = entry.get_document("_id") else {
                continue;
            };
            let target = key.get_str("target").unwrap_or("unknown").to_string();
            let status = key.get_str("status").unwrap_or("unknown").to_string();
            let count = match entry.get("n") {
                Some(Bson::Int32(n)) => *n as u64,
                Some(Bson::Int64(n)) => *n as u64,
                _ => 0,
            };
            by_target.entry(target).or_default().insert(status, count);
        }
        Ok(OutboxSummary {
            by_status,
            by_target,
            updated_at: Some(crate::event::now_iso()),
        })
    }

    async fn gc(&self, params: &GcParams) -> Result<GcResult> {
        let now = Utc::now();
        let before_total = self.jobs.count_documents(doc! {}).await?;
        let before_status = self.status_counts().await?;

        let succeeded_cutoff =
            timestamp_iso(now - ChronoDuration::hours(params.succeeded_hours as i64));
        let failed_cutoff = timestamp_iso(now - ChronoDuration::hours(params.failed_hours as i64));
        let pending_cutoff =
            timestamp_iso(now - ChronoDuration::hours(params.stale_pending_hours as i64));

        let terminal_filter = |status: &str, cutoff: &str| {
            doc! {
                "status": status,
                "$or": [
                    {"completed_at": {"$lt": cutoff, "$type": "string"}},
                    {"completed_at": Bson::Null, "updated_at": {"$lt": cutoff}},
                ],
            }
        };
        let succeeded_deleted = self
            .jobs
            .delete_many(terminal_filter("succeeded", &succeeded_cutoff))
            .await?
            .deleted_count;
        let failed_deleted = self
            .jobs
            .delete_many(terminal_filter("failed", &failed_cutoff))
            .await?
            .deleted_count;

        let mut stale_deleted = 0u64;
        for &target in &params.stale_targets {
            stale_deleted += self
                .jobs
                .delete_many(doc! {
                    "target": target.as_str(),
                    "status": {"$in": NON_TERMINAL.to_vec()},
                    "$or": [
                        {"last_attempt_at": {"$lt": &pending_cutoff, "$type": "string"}},
                        {"last_attempt_at": Bson::Null, "updated_at": {"$lt": &pending_cutoff}},
                    ],
                })
                .await?
                .deleted_count;
        }

        let deleted_total = succeeded_deleted + failed_deleted + stale_deleted;
        let after_total = self.jobs.count_documents(doc! {}).await?;
        let after_status = self.status_counts().await?;

        let mut retention_hours = BTreeMap::new();
        retention_hours.insert("succeeded".to_string(), params.succeeded_hours);
        retention_hours.insert("failed".to_string(), params.failed_hours);
        retention_hours.insert("stale_pending".to_string(), params.stale_pending_hours);

        Ok(GcResult {
            ok: true,
            backend: "mongo".to_string(),
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
            checkpoint: GcCheckpoint {
                ok: true,
                error: String::new(),
            },
            // Storage compaction is sqlite-only; the document store manages
            // its own space reclamation.
            vacuum: GcVacuum {
                requested: false,
                ran: false,
                min_deleted: params.vacuum_min_deleted,
                error: String::new(),
            },
            timestamp: crate::event::now_iso(),
        })
    }

    async fn list_jobs(
        &self,
        statuses: &[JobStatus],
        target: Option<FanoutTarget>,
        limit: u32,
    ) -> Result<Vec<OutboxJob>> {
        let status_list: Vec<&str> = statuses.iter().map(|status| status.as_str()).collect();
        let mut filter = doc! {"status": {"$in": status_list}};
        if let Some(target) = target {
            filter.insert("target", target.as_str());
        }
        let mut cursor = self
            .jobs
            .find(filter)
            .sort(doc! {"updated_at": -1})
            .limit(limit as i64)
            .await?;
        let mut jobs = Vec::new();
        while let Some(entry) = cursor.try_next().await? {
            jobs.push(job_from_doc(&entry)?);
        }
        Ok(jobs)
    }
}
