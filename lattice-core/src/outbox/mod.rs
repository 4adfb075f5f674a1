//! Durable fanout outbox: target-specific pending writes with at-least-once
//! delivery. Two interchangeable backends implement [`OutboxStore`]; the
//! [`OutboxSupervisor`] selects one at startup and may promote the embedded
//! backend to the document backend when disk integrity degrades.

pub mod mongo;
pub mod sqlite;
pub mod supervisor;

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LatticeError, Result};
use crate::event::MemoryEvent;

pub use mongo::MongoOutbox;
pub use sqlite::SqliteOutbox;
pub use supervisor::OutboxSupervisor;

/// A single fanout destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanoutTarget {
    Raw,
    Vector,
    Analytic,
    Archival,
    Observability,
}

impl FanoutTarget {
    pub const ALL: [FanoutTarget; 5] = [
        FanoutTarget::Raw,
        FanoutTarget::Vector,
        FanoutTarget::Analytic,
        FanoutTarget::Archival,
        FanoutTarget::Observability,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Vector => "vector",
            Self::Analytic => "analytic",
            Self::Archival => "archival",
            Self::Observability => "observability",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "raw" => Some(Self::Raw),
            "vector" => Some(Self::Vector),
            "analytic" => Some(Self::Analytic),
            "archival" => Some(Self::Archival),
            "observability" => Some(Self::Observability),
            _ => None,
        }
    }
}

impl std::fmt::Display for FanoutTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Retrying,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retrying => "retrying",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "retrying" => Some(Self::Retrying),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// The payload snapshot an outbox row carries to its target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: String,
    pub project: String,
    pub file: String,
    pub summary: String,
    pub payload: serde_json::Value,
    pub topic_path: String,
    pub topic_tags: Vec<String>,
}

impl From<&MemoryEvent> for EventEnvelope {
    fn from(event: &MemoryEvent) -> Self {
        let payload = serde_json::to_value(event)
            .unwrap_or_else(|_| serde_json::json!({"event_id": event.event_id}));
        Self {
            event_id: event.event_id.clone(),
            project: event.project.clone(),
            file: event.file.clone(),
            summary: event.summary.clone(),
            payload,
            topic_path: event.topic_path.clone(),
            topic_tags: event.topic_tags.clone(),
        }
    }
}

/// A claimed or listed outbox row.
#[derive(Debug, Clone, Serialize)]
pub struct OutboxJob {
    pub id: i64,
    pub event_id: String,
    pub target: FanoutTarget,
    pub project: String,
    pub file: String,
    pub summary: String,
    pub payload: serde_json::Value,
    pub topic_path: String,
    pub topic_tags: Vec<String>,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub dedupe_key: String,
}

pub fn dedupe_key(event_id: &str, target: FanoutTarget) -> String {
    format!("{event_id}:{target}")
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnqueueOutcome {
    pub inserted: u64,
    pub requeued: u64,
    pub existing: u64,
    pub coalesced: u64,
    pub coalesced_by_target: BTreeMap<String, u64>,
}

#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub force_requeue: bool,
    pub coalesce_window_secs: f64,
    pub coalesce_targets: HashSet<FanoutTarget>,
    pub max_attempts: u32,
}

impl EnqueueOptions {
    pub fn coalesce_enabled_for(&self, target: FanoutTarget) -> bool {
        self.coalesce_window_secs > 0.0 && self.coalesce_targets.contains(&target)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimFilter {
    Any,
    Only(FanoutTarget),
    Excluding(FanoutTarget),
}

/// Exponential backoff with a small uniform jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_secs: f64,
    pub cap_secs: f64,
}

impl RetryPolicy {
    pub fn backoff_secs(&self, attempts: u32) -> f64 {
        use rand::Rng;
        let exponent = attempts.saturating_sub(1).min(24);
        let bounded = (self.base_secs * 2f64.powi(exponent as i32)).min(self.cap_secs);
        let jitter_span = (bounded * 0.2).min(1.0);
        let jitter = if jitter_span > 0.0 {
            rand::rng().random_range(0.0..jitter_span)
        } else {
            0.0
        };
        bounded + jitter
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OutboxSummary {
    pub by_status: BTreeMap<String, u64>,
    pub by_target: BTreeMap<String, BTreeMap<String, u64>>,
    pub updated_at: Option<String>,
}

impl OutboxSummary {
    /// Pending + retrying + running across all targets.
    pub fn outstanding(&self) -> u64 {
        ["pending", "retrying", "running"]
            .iter()
            .filter_map(|status| self.by_status.get(*status))
            .sum()
    }

    pub fn outstanding_for(&self, target: FanoutTarget) -> u64 {
        self.by_target
            .get(target.as_str())
            .map(|statuses| {
                ["pending", "retrying", "running"]
                    .iter()
                    .filter_map(|status| statuses.get(*status))
                    .sum()
            })
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct GcParams {
    pub succeeded_hours: u32,
    pub failed_hours: u32,
    pub stale_pending_hours: u32,
    pub stale_targets: Vec<FanoutTarget>,
    pub vacuum: bool,
    pub vacuum_min_deleted: u64,
    pub min_vacuum_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GcDeleted {
    pub succeeded: u64,
    pub failed: u64,
    pub stale_pending_targets: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GcCheckpoint {
    pub ok: bool,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GcVacuum {
    pub requested: bool,
    pub ran: bool,
    pub min_deleted: u64,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GcResult {
    pub ok: bool,
    pub backend: String,
    pub before_total: u64,
    pub after_total: u64,
    pub before_status: BTreeMap<String, u64>,
    pub after_status: BTreeMap<String, u64>,
    pub deleted: GcDeleted,
    pub retention_hours: BTreeMap<String, u32>,
    pub stale_targets: Vec<String>,
    pub checkpoint: GcCheckpoint,
    pub vacuum: GcVacuum,
    pub timestamp: String,
}

/// Contract shared by the embedded and document outbox backends. Multi-step
/// updates are atomic within each backend (transaction or find-and-modify).
#[async_trait]
pub trait OutboxStore: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn enqueue(
        &self,
        envelope: &EventEnvelope,
        targets: &[FanoutTarget],
        opts: &EnqueueOptions,
    ) -> Result<EnqueueOutcome>;

    async fn claim_batch(&self, limit: u32, filter: ClaimFilter) -> Result<Vec<OutboxJob>>;

    async fn mark_success(&self, id: i64) -> Result<()>;

    async fn mark_failed(&self, id: i64, error: &str) -> Result<()>;

    /// Transition a claimed job to `retrying` (or terminal `failed` when the
    /// attempt budget is exhausted).
    async fn mark_retry(&self, job: &OutboxJob, error: &str, policy: &RetryPolicy) -> Result<()>;

    async fn recover_stale_running(&self, max_age_secs: u64) -> Result<u64>;

    async fn summary(&self) -> Result<OutboxSummary>;

    async fn gc(&self, params: &GcParams) -> Result<GcResult>;

    async fn list_jobs(
        &self,
        statuses: &[JobStatus],
        target: Option<FanoutTarget>,
        limit: u32,
    ) -> Result<Vec<OutboxJob>>;
}

pub(crate) fn parse_stored_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| LatticeError::Integrity(format!("bad stored timestamp '{raw}': {err}")))
}

pub(crate) fn truncate_error(error: &str) -> String {
    const MAX: usize = 500;
    if error.len() <= MAX {
        error.to_string()
    } else {
        let mut cut = MAX;
        while !error.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &error[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            base_secs: 2.0,
            cap_secs: 300.0,
        };
        let first = policy.backoff_secs(1);
        assert!((2.0..3.1).contains(&first));
        let fifth = policy.backoff_secs(5);
        assert!((32.0..33.1).contains(&fifth));
        let huge = policy.backoff_secs(20);
        assert!((300.0..301.1).contains(&huge));
    }

    #[test]
    fn summary_outstanding_counts_non_terminal() {
        let mut summary = OutboxSummary::default();
        summary.by_status.insert("pending".into(), 2);
        summary.by_status.insert("retrying".into(), 3);
        summary.by_status.insert("running".into(), 1);
        summary.by_status.insert("succeeded".into(), 9);
        assert_eq!(summary.outstanding(), 6);
    }

    #[test]
    fn dedupe_key_is_event_and_target() {
        assert_eq!(dedupe_key("evt-1", FanoutTarget::Vector), "evt-1:vector");
    }
}
