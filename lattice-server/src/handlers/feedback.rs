//! Feedback submission and preference context endpoints.

use axum::{
    Json,
    extract::{Query, State},
};
use serde::Deserialize;
use serde_json::json;

use lattice_core::feedback::{FeedbackCreate, FeedbackFilter};

use crate::errors::ApiResult;
use crate::state::AppState;

pub async fn create_feedback(
    State(state): State<AppState>,
    Json(body): Json<FeedbackCreate>,
) -> ApiResult<Json<serde_json::Value>> {
    let row = state.feedback.create(body).await?;
    Ok(Json(json!({"ok": true, "feedback": row})))
}

#[derive(Debug, Deserialize)]
pub struct ListFeedbackQuery {
    pub project: Option<String>,
    pub user_id: Option<String>,
    pub source: Option<String>,
    pub limit: Option<u32>,
}

pub async fn list_feedback(
    State(state): State<AppState>,
    Query(query): Query<ListFeedbackQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let rows = state
        .feedback
        .list(&FeedbackFilter {
            project: query.project,
            user_id: query.user_id,
            source: query.source,
            limit: query.limit.unwrap_or(100),
        })
        .await?;
    Ok(Json(json!({"feedback": rows})))
}

#[derive(Debug, Deserialize)]
pub struct PreferencesQuery {
    pub project: Option<String>,
    pub user_id: Option<String>,
    pub limit: Option<u32>,
}

pub async fn get_preferences(
    State(state): State<AppState>,
    Query(query): Query<PreferencesQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let enabled = state.config.retrieval.learning_enabled;
    let context = state
        .feedback
        .build_preference_context(
            query.project.as_deref(),
            query.user_id.as_deref(),
            query.limit.unwrap_or(100),
        )
        .await?;
    Ok(Json(json!({"enabled": enabled, "preferences": context})))
}
