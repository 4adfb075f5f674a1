//! Memory write/read/search/topics handlers.

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;

use lattice_core::ingest::WriteRequest;
use lattice_core::retrieval::SearchRequest;

use crate::errors::{ApiError, ApiResult};
use crate::middleware::request_id::RequestId;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct MemoryWriteBody {
    #[serde(alias = "projectName")]
    pub project: String,
    #[serde(alias = "fileName")]
    pub file: String,
    pub content: String,
    #[serde(alias = "topicPath")]
    pub topic_path: Option<String>,
}

pub async fn write_memory(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Json(body): Json<MemoryWriteBody>,
) -> ApiResult<Json<lattice_core::WriteOutcome>> {
    let outcome = state
        .ingest
        .write(WriteRequest {
            project: body.project,
            file: body.file,
            content: body.content,
            topic_path: body.topic_path,
            request_id: Some(request_id),
        })
        .await?;
    Ok(Json(outcome))
}

pub async fn search_memory(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> ApiResult<Json<lattice_core::SearchResponse>> {
    if request.query.trim().is_empty() {
        return Err(ApiError::unprocessable("query must not be empty"));
    }
    Ok(Json(state.retrieval.search(&request).await))
}

pub async fn read_memory_file(
    State(state): State<AppState>,
    Path((project, file_path)): Path<(String, String)>,
) -> ApiResult<Response> {
    let Some(canonical) = &state.canonical else {
        return Err(ApiError::unavailable("canonical store is not configured"));
    };
    let content = canonical
        .read_file(&project, &file_path, false, true)
        .await?;
    let content_type = if file_path.ends_with(".json") {
        "application/json"
    } else {
        "text/plain; charset=utf-8"
    };
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type)],
        content,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
    pub project: Option<String>,
}

pub async fn recent_writes(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> Json<serde_json::Value> {
    let items = state
        .recent
        .list(query.limit.unwrap_or(50).min(500), query.project.as_deref())
        .await;
    Json(json!({"items": items}))
}

#[derive(Debug, Deserialize)]
pub struct TopicsQuery {
    pub project: Option<String>,
    pub depth: Option<usize>,
}

pub async fn topic_tree(
    State(state): State<AppState>,
    Query(query): Query<TopicsQuery>,
) -> Json<serde_json::Value> {
    let topics = state
        .topics
        .snapshot(query.project.as_deref(), query.depth.unwrap_or(4).min(12))
        .await;
    Json(json!({"topics": topics}))
}

fn default_topics_limit() -> usize {
    50
}

fn default_topics_depth() -> usize {
    6
}

#[derive(Debug, Deserialize)]
pub struct TopicsListRequest {
    pub project: Option<String>,
    pub prefix: Option<String>,
    #[serde(default = "default_topics_limit")]
    pub limit: usize,
    #[serde(default)]
    pub min_count: u64,
    #[serde(default = "default_topics_depth")]
    pub depth: usize,
}

async fn run_topics_list(state: &AppState, request: TopicsListRequest) -> serde_json::Value {
    let result = state
        .topics
        .list(
            request.project.as_deref(),
            request.prefix.as_deref(),
            request.limit.min(500),
            request.min_count,
            request.depth.min(12),
        )
        .await;
    json!({
        "project": request.project,
        "prefix": request.prefix,
        "topics": result.topics,
        "total": result.total,
    })
}

pub async fn topics_list_get(
    State(state): State<AppState>,
    Query(request): Query<TopicsListRequest>,
) -> Json<serde_json::Value> {
    Json(run_topics_list(&state, request).await)
}

pub async fn topics_list_post(
    State(state): State<AppState>,
    Json(request): Json<TopicsListRequest>,
) -> Json<serde_json::Value> {
    Json(run_topics_list(&state, request).await)
}
