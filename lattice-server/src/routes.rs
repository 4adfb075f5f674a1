//! The full HTTP route table. Paths are stable compatibility points.

use axum::{
    Router, middleware,
    routing::{get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::handlers::{feedback, memory, messaging, status, tasks, telemetry};
use crate::middleware::{auth_middleware, request_id_middleware};
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // memory
        .route("/memory/write", post(memory::write_memory))
        .route("/memory/search", post(memory::search_memory))
        .route(
            "/memory/files/{project}/{*file_path}",
            get(memory::read_memory_file),
        )
        .route("/memory/recent", get(memory::recent_writes))
        .route("/memory/topics", get(memory::topic_tree))
        .route(
            "/memory/topics/list",
            get(memory::topics_list_get).post(memory::topics_list_post),
        )
        .route("/tools/topics_list", post(memory::topics_list_post))
        // telemetry
        .route("/telemetry/fanout", get(telemetry::fanout_summary))
        .route(
            "/telemetry/fanout/deadletters",
            get(telemetry::fanout_deadletters),
        )
        .route("/telemetry/fanout/gc", post(telemetry::trigger_outbox_gc))
        .route("/telemetry/retention", get(telemetry::retention_status))
        .route(
            "/telemetry/retention/run",
            post(telemetry::run_sink_retention),
        )
        .route(
            "/telemetry/memory/rollups/flush",
            post(telemetry::flush_rollups),
        )
        // agent tasks
        .route(
            "/agents/tasks",
            post(tasks::create_task).get(tasks::list_tasks),
        )
        .route("/agents/tasks/next", post(tasks::claim_next_task))
        .route("/agents/tasks/deadletter", get(tasks::list_deadletter))
        .route("/agents/tasks/runtime", get(tasks::runtime_snapshot))
        .route("/agents/tasks/{id}", get(tasks::get_task))
        .route("/agents/tasks/{id}/events", get(tasks::get_task_events))
        .route("/agents/tasks/{id}/status", post(tasks::update_task_status))
        .route("/agents/tasks/{id}/approve", post(tasks::approve_task))
        .route("/agents/tasks/{id}/replay", post(tasks::replay_task))
        // feedback + preferences
        .route(
            "/feedback",
            post(feedback::create_feedback).get(feedback::list_feedback),
        )
        .route("/preferences", get(feedback::get_preferences))
        // messaging
        .route("/messaging/command", post(messaging::messaging_command))
        // health
        .route("/health", get(status::health))
        .route("/status", get(status::status))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
