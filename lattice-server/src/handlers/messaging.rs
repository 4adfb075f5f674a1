//! Messaging command endpoint. The handler decides channel strictness (it
//! owns the edge) and hands the interpreter a fully-classified request.

use axum::{Json, extract::State};
use serde::Deserialize;

use lattice_core::messaging::MessagingRequest;

use crate::errors::ApiResult;
use crate::state::AppState;

fn default_require_prefix() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct MessagingCommandIn {
    pub channel: String,
    pub source_id: String,
    pub text: String,
    pub project: Option<String>,
    #[serde(alias = "topicPath")]
    pub topic_path: Option<String>,
    pub user_id: Option<String>,
    #[serde(default = "default_require_prefix")]
    pub require_prefix: bool,
}

pub async fn messaging_command(
    State(state): State<AppState>,
    Json(body): Json<MessagingCommandIn>,
) -> ApiResult<Json<serde_json::Value>> {
    // The edge classifies the surface; the interpreter only honors the flag.
    let strict = state.messaging.is_strict_channel(&body.channel);
    let response = state
        .messaging
        .execute(MessagingRequest {
            channel: body.channel,
            source_id: body.source_id,
            text: body.text,
            project: body.project,
            topic_path: body.topic_path,
            user_id: body.user_id,
            require_prefix: body.require_prefix,
            strict,
        })
        .await?;
    Ok(Json(response))
}
