//! Fanout, retention, and rollup telemetry endpoints.

use axum::{
    Json,
    extract::{Query, State},
};
use serde::Deserialize;
use serde_json::json;

use lattice_core::outbox::{FanoutTarget, JobStatus};

use crate::errors::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn fanout_summary(State(state): State<AppState>) -> Json<serde_json::Value> {
    let summary = state.outbox.summary_cached().await;
    let health = state.fanout_health.snapshot();
    Json(json!({
        "backend": state.outbox.active_backend(),
        "summary": summary,
        "outstanding": summary.outstanding(),
        "signal": {
            "depth_ratio": state.signal.depth_ratio(),
            "dropped": state.signal.dropped_signals(),
        },
        "runtime": health,
        "rate_limits": state.config.fanout.rate_limits,
        "coalesce": {
            "window_secs": state.config.fanout.coalesce_window_secs,
            "targets": state.config.fanout.coalesce_targets,
            "total": health.coalesced_total,
        },
        "backpressure": {
            "watermark": state.config.fanout.backpressure_watermark,
            "targets": state.config.fanout.backpressure_targets,
            "sleeps": health.backpressure_sleeps,
        },
        "admission": {
            "config": state.config.admission,
            "dropped": health.admission_dropped,
        },
        "rollups": state.ingest.rollup_health(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct DeadletterQuery {
    pub limit: Option<u32>,
    pub target: Option<String>,
}

pub async fn fanout_deadletters(
    State(state): State<AppState>,
    Query(query): Query<DeadletterQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let target = match query.target.as_deref() {
        Some(raw) => Some(
            FanoutTarget::parse(raw)
                .ok_or_else(|| ApiError::unprocessable(format!("unknown target '{raw}'")))?,
        ),
        None => None,
    };
    let items = state
        .outbox
        .list_jobs(
            &[JobStatus::Failed],
            target,
            query.limit.unwrap_or(50).min(500),
        )
        .await?;
    Ok(Json(json!({"items": items})))
}

pub async fn trigger_outbox_gc(
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let result = state.retention.run_outbox_gc_once().await?;
    state.outbox.invalidate_summary();
    Ok(Json(json!({"ok": true, "result": result})))
}

pub async fn retention_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.retention.status())
}

pub async fn run_sink_retention(State(state): State<AppState>) -> Json<serde_json::Value> {
    let result = state.retention.run_sink_retention_once().await;
    let ok = result["ok"].as_bool().unwrap_or(false);
    Json(json!({"ok": ok, "result": result}))
}

#[derive(Debug, Default, Deserialize)]
pub struct RollupFlushBody {
    #[serde(default)]
    pub force: bool,
}

pub async fn flush_rollups(
    State(state): State<AppState>,
    body: Option<Json<RollupFlushBody>>,
) -> Json<serde_json::Value> {
    let force = body.map(|Json(body)| body.force).unwrap_or(false);
    let result = state.ingest.flush_rollups(force).await;
    Json(json!({"ok": true, "result": result}))
}
