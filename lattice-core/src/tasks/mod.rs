//! Durable lease-based task queue for agent follow-up work.

pub mod actions;
pub mod store;
pub mod worker;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use actions::{ActionExecutor, ActionMeta, TaskActionPayload};
pub use store::TaskQueue;
pub use worker::{TaskWorkerHealth, spawn_task_workers};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Approved,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Approved => "approved",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Blocked => "blocked",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(Self::Queued),
            "approved" => Some(Self::Approved),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRow {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    pub project: Option<String>,
    pub agent: Option<String>,
    pub priority: i64,
    pub payload: serde_json::Value,
    pub run_after: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub approval_required: bool,
    pub approved: bool,
    pub risk_level: Option<String>,
    pub action_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskEvent {
    pub id: i64,
    pub task_id: String,
    pub status: String,
    pub message: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskCreate {
    pub title: String,
    pub project: Option<String>,
    pub agent: Option<String>,
    #[serde(default)]
    pub priority: i64,
    pub payload: serde_json::Value,
    pub run_after: Option<DateTime<Utc>>,
    pub max_attempts: Option<u32>,
}

/// The worker identity used for claim affinity. Internal workers are the
/// in-process action dispatchers; anything polling over HTTP is external.
#[derive(Debug, Clone)]
pub struct WorkerIdentity {
    pub name: String,
    pub internal: bool,
}

impl WorkerIdentity {
    pub fn internal(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            internal: true,
        }
    }

    pub fn external(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            internal: false,
        }
    }
}

/// Does a task's agent selector match this worker?
///
/// Unassigned/"any" tasks match everyone; "internal"/"external" match the
/// worker class; anything else is a case-insensitive exact name match.
pub fn agent_matches(selector: Option<&str>, worker: &WorkerIdentity) -> bool {
    let selector = selector.unwrap_or("").trim();
    if selector.is_empty() || selector.eq_ignore_ascii_case("any") {
        return true;
    }
    if selector.eq_ignore_ascii_case("internal") {
        return worker.internal;
    }
    if selector.eq_ignore_ascii_case("external") {
        return !worker.internal;
    }
    selector.eq_ignore_ascii_case(&worker.name)
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRuntimeSnapshot {
    pub queue_ready: u64,
    pub running: u64,
    pub deadletter: u64,
    pub by_status: BTreeMap<String, u64>,
    pub oldest_run_after: Option<String>,
    pub workers: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affinity_rules() {
        let internal = WorkerIdentity::internal("internal-worker-1");
        let external = WorkerIdentity::external("codex-subagent");

        assert!(agent_matches(None, &internal));
        assert!(agent_matches(Some(""), &external));
        assert!(agent_matches(Some("any"), &external));
        assert!(agent_matches(Some("internal"), &internal));
        assert!(!agent_matches(Some("internal"), &external));
        assert!(agent_matches(Some("external"), &external));
        assert!(!agent_matches(Some("external"), &internal));
        assert!(agent_matches(Some("Codex-Subagent"), &external));
        assert!(!agent_matches(Some("codex-subagent"), &internal));
    }
}
