//! Agent task endpoints, including the external worker protocol
//! (`/agents/tasks/next` + per-task status updates).

use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;
use serde_json::json;

use lattice_core::tasks::{TaskCreate, TaskStatus, WorkerIdentity, actions};

use crate::errors::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn create_task(
    State(state): State<AppState>,
    Json(body): Json<TaskCreate>,
) -> ApiResult<Json<serde_json::Value>> {
    let (_, meta) = actions::validate_payload(
        &body.payload,
        &state.config.tasks.allowed_actions,
        &state.config.tasks.callback_hosts,
    )?;
    let task = state.tasks.create(body, meta).await?;
    Ok(Json(json!({"ok": true, "task": task})))
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    pub project: Option<String>,
    pub agent: Option<String>,
    pub status: Option<String>,
    pub limit: Option<u32>,
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            TaskStatus::parse(raw)
                .ok_or_else(|| ApiError::unprocessable(format!("unknown status '{raw}'")))?,
        ),
        None => None,
    };
    let tasks = state
        .tasks
        .list(
            query.project.as_deref(),
            query.agent.as_deref(),
            status,
            query.limit.unwrap_or(50),
        )
        .await?;
    Ok(Json(json!({"tasks": tasks})))
}

#[derive(Debug, Deserialize)]
pub struct ClaimQuery {
    pub worker: Option<String>,
}

/// External worker claim. In-process workers claim directly; everything
/// arriving over HTTP is an external worker by definition.
pub async fn claim_next_task(
    State(state): State<AppState>,
    Query(query): Query<ClaimQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let worker = WorkerIdentity::external(
        query.worker.unwrap_or_else(|| "external-worker".to_string()),
    );
    let task = state.tasks.claim_next(&worker).await?;
    Ok(Json(json!({"task": task})))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let task = state
        .tasks
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("task {id} not found")))?;
    Ok(Json(json!({"task": task})))
}

pub async fn get_task_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let events = state.tasks.events(&id).await?;
    Ok(Json(json!({"events": events})))
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdateBody {
    pub status: String,
    pub message: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub result: Option<serde_json::Value>,
}

pub async fn update_task_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<StatusUpdateBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let status = TaskStatus::parse(&body.status)
        .ok_or_else(|| ApiError::unprocessable(format!("unknown status '{}'", body.status)))?;
    let task = state
        .tasks
        .update_status(&id, status, body.message.as_deref(), body.metadata, body.result)
        .await?;
    Ok(Json(json!({"ok": true, "task": task})))
}

#[derive(Debug, Default, Deserialize)]
pub struct ApproveBody {
    pub approver: Option<String>,
    pub note: Option<String>,
}

pub async fn approve_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ApproveBody>>,
) -> ApiResult<Json<serde_json::Value>> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let task = state
        .tasks
        .approve(&id, body.approver.as_deref(), body.note.as_deref())
        .await?;
    Ok(Json(json!({"ok": true, "task": task})))
}

fn default_reset_attempts() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct ReplayBody {
    pub actor: Option<String>,
    pub note: Option<String>,
    #[serde(default = "default_reset_attempts")]
    pub reset_attempts: bool,
}

impl Default for ReplayBody {
    fn default() -> Self {
        Self {
            actor: None,
            note: None,
            reset_attempts: true,
        }
    }
}

pub async fn replay_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ReplayBody>>,
) -> ApiResult<Json<serde_json::Value>> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let task = state
        .tasks
        .replay(
            &id,
            body.actor.as_deref(),
            body.note.as_deref(),
            body.reset_attempts,
        )
        .await?;
    Ok(Json(json!({"ok": true, "task": task})))
}

#[derive(Debug, Deserialize)]
pub struct DeadletterQuery {
    pub project: Option<String>,
    pub limit: Option<u32>,
}

pub async fn list_deadletter(
    State(state): State<AppState>,
    Query(query): Query<DeadletterQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let tasks = state
        .tasks
        .list_deadletter(query.project.as_deref(), query.limit.unwrap_or(50))
        .await?;
    Ok(Json(json!({"tasks": tasks})))
}

pub async fn runtime_snapshot(
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let snapshot = state
        .tasks
        .runtime_snapshot(state.task_worker_health.snapshot())
        .await?;
    Ok(Json(serde_json::to_value(snapshot).map_err(|err| {
        ApiError::internal(format!("snapshot serialization failed: {err}"))
    })?))
}
