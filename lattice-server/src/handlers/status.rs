//! Coarse service health endpoints.

use axum::{Json, extract::State};
use serde_json::json;

use crate::errors::ApiResult;
use crate::state::AppState;

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({"ok": true, "service": "lattice-server"}))
}

pub async fn status(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let summary = state.outbox.summary_cached().await;
    let fanout = state.fanout_health.snapshot();
    let task_runtime = state
        .tasks
        .runtime_snapshot(state.task_worker_health.snapshot())
        .await?;

    let services = json!([
        {
            "name": "outbox",
            "backend": state.outbox.active_backend(),
            "outstanding": summary.outstanding(),
        },
        {
            "name": "archival_runtime",
            "disabled": fanout.archival_disabled,
            "reason": fanout.archival_disabled_reason,
            "transient_streak": fanout.archival_transient_streak,
        },
        {
            "name": "rollups",
            "state": state.ingest.rollup_health(),
        },
        {
            "name": "retention",
            "state": state.retention.status(),
        },
        {
            "name": "canonical",
            "configured": state.canonical.is_some(),
        },
    ]);

    Ok(Json(json!({
        "ok": true,
        "env": state.config.server.env,
        "services": services,
        "taskRuntime": task_runtime,
    })))
}
