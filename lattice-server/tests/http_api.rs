//! HTTP surface tests: auth, ingest, search, topics, tasks, feedback, and
//! the strict messaging surface. No external backends are configured, so
//! these exercise the degraded-but-correct paths.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::util::ServiceExt;

use lattice_config::LatticeConfig;
use lattice_server::routes::create_router;
use lattice_server::state::{AppState, BackgroundWorkers, build_state};

struct TestApp {
    _dir: tempfile::TempDir,
    _workers: BackgroundWorkers,
    state: AppState,
    router: Router,
    api_key: Option<String>,
}

async fn spawn_app(api_key: Option<&str>) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let (mut config, _) = LatticeConfig::load();
    config.storage.task_db_path = dir.path().join("tasks.db");
    config.storage.topic_tree_path = dir.path().join("topics.json");
    config.storage.mongo_uri = None;
    config.storage.canonical_url = None;
    config.storage.vector_url = None;
    config.storage.analytic_url = None;
    config.storage.archival_url = None;
    config.storage.observability_url = None;
    config.auth.api_key = api_key.map(str::to_string);
    config.fanout.workers = 0;
    config.fanout.archival_workers = 0;
    config.tasks.workers = 0;

    let (state, workers) = build_state(config).await.unwrap();
    let router = create_router(state.clone());
    TestApp {
        _dir: dir,
        _workers: workers,
        state,
        router,
        api_key: api_key.map(str::to_string),
    }
}

impl TestApp {
    async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<Value>,
        with_key: bool,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(path);
        if with_key && let Some(key) = &self.api_key {
            builder = builder.header("x-api-key", key);
        }
        let request = match body {
            Some(value) => builder
                .header("content-type", "application/json")
                .body(Body::from(value.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let parsed = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::String(
                String::from_utf8_lossy(&bytes).to_string(),
            ))
        };
        (status, parsed)
    }
}

#[tokio::test]
async fn health_is_public_while_everything_else_requires_the_key() {
    let app = spawn_app(Some("test-secret")).await;

    let (status, body) = app.request("GET", "/health", None, false).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    let (status, body) = app.request("GET", "/memory/recent", None, false).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"]["message"].as_str().unwrap().contains("API key"));

    let (status, _) = app.request("GET", "/memory/recent", None, true).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn bearer_token_is_an_accepted_key_carrier() {
    let app = spawn_app(Some("test-secret")).await;
    let request = Request::builder()
        .method("GET")
        .uri("/memory/recent")
        .header("authorization", "Bearer test-secret")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn write_dedups_within_the_window_and_feeds_recent_and_topics() {
    let app = spawn_app(None).await;
    let body = json!({
        "projectName": "alpha",
        "fileName": "notes/a.md",
        "content": "hello",
    });

    let (status, first) = app
        .request("POST", "/memory/write", Some(body.clone()), false)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["ok"], true);
    assert_eq!(first["deduped"], false);
    let event_id = first["event_id"].as_str().unwrap().to_string();

    let (_, second) = app
        .request("POST", "/memory/write", Some(body), false)
        .await;
    assert_eq!(second["deduped"], true);
    assert_eq!(second["event_id"], event_id.as_str());

    let (status, recent) = app
        .request("GET", "/memory/recent?project=alpha", None, false)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(recent["items"].as_array().unwrap().len(), 2);

    let (status, topics) = app
        .request("GET", "/memory/topics?project=alpha", None, false)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(topics["topics"]["count"], 1);
    assert_eq!(topics["topics"]["children"]["notes"]["count"], 1);

    let (status, listed) = app
        .request(
            "POST",
            "/memory/topics/list",
            Some(json!({"project": "alpha", "min_count": 1})),
            false,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["total"], 1);
    assert_eq!(listed["topics"][0]["path"], "notes");
}

#[tokio::test]
async fn traversal_file_names_are_unprocessable() {
    let app = spawn_app(None).await;
    let (status, body) = app
        .request(
            "POST",
            "/memory/write",
            Some(json!({
                "projectName": "alpha",
                "fileName": "notes/../secrets.md",
                "content": "x",
            })),
            false,
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"]["message"].as_str().unwrap().contains(".."));
}

#[tokio::test]
async fn search_with_no_backends_degrades_with_warnings() {
    let app = spawn_app(None).await;
    let (status, body) = app
        .request(
            "POST",
            "/memory/search",
            Some(json!({"query": "alpha", "include_retrieval_debug": true})),
            false,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"].as_array().unwrap().len(), 0);
    assert!(!body["warnings"].as_array().unwrap().is_empty());
    assert!(body["retrieval"]["resolved_sources"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn task_lifecycle_over_http() {
    let app = spawn_app(None).await;

    let (status, created) = app
        .request(
            "POST",
            "/agents/tasks",
            Some(json!({
                "title": "search the memory",
                "project": "alpha",
                "payload": {"action": "memory_search", "query": "release notes"},
            })),
            false,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["task"]["status"], "queued");
    assert_eq!(created["task"]["action_type"], "memory_search");
    let id = created["task"]["id"].as_str().unwrap().to_string();

    let (status, claimed) = app
        .request(
            "POST",
            "/agents/tasks/next?worker=codex-subagent",
            Some(json!({})),
            false,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(claimed["task"]["id"], id.as_str());
    assert_eq!(claimed["task"]["status"], "running");
    assert_eq!(claimed["task"]["claimed_by"], "codex-subagent");

    let (status, updated) = app
        .request(
            "POST",
            &format!("/agents/tasks/{id}/status"),
            Some(json!({"status": "succeeded", "message": "done"})),
            false,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["task"]["status"], "succeeded");

    let (status, events) = app
        .request("GET", &format!("/agents/tasks/{id}/events"), None, false)
        .await;
    assert_eq!(status, StatusCode::OK);
    let statuses: Vec<&str> = events["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|event| event["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, vec!["queued", "running", "succeeded"]);

    let (status, runtime) = app.request("GET", "/agents/tasks/runtime", None, false).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(runtime["byStatus"]["succeeded"], 1);
    assert_eq!(runtime["queueReady"], 0);
}

#[tokio::test]
async fn disallowed_task_actions_are_rejected() {
    let app = spawn_app(None).await;
    let (status, body) = app
        .request(
            "POST",
            "/agents/tasks",
            Some(json!({
                "title": "sneaky callback",
                "payload": {"action": "http_callback", "url": "https://evil.example/x"},
            })),
            false,
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"]["message"].as_str().unwrap().contains("allowlist"));
}

#[tokio::test]
async fn strict_messaging_surface_blocks_secret_content() {
    let app = spawn_app(None).await;
    let (status, body) = app
        .request(
            "POST",
            "/messaging/command",
            Some(json!({
                "channel": "openclaw",
                "source_id": "session-1",
                "text": "remember api_key=sk-abcdef0123456789",
                "require_prefix": false,
            })),
            false,
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"]["message"].as_str().unwrap().contains("secret"));
}

#[tokio::test]
async fn relaxed_channels_store_and_report_status() {
    let app = spawn_app(None).await;
    let (status, stored) = app
        .request(
            "POST",
            "/messaging/command",
            Some(json!({
                "channel": "custom",
                "source_id": "chat-1",
                "text": "@lattice remember deployment complete",
            })),
            false,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored["ok"], true);
    assert_eq!(stored["action"], "remember");

    let (status, state) = app
        .request(
            "POST",
            "/messaging/command",
            Some(json!({
                "channel": "custom",
                "source_id": "chat-1",
                "text": "@lattice status",
            })),
            false,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(state["action"], "status");
    assert!(state["result"]["tasks"]["byStatus"].is_object());
}

#[tokio::test]
async fn feedback_feeds_the_preference_context() {
    let app = spawn_app(None).await;
    let (status, created) = app
        .request(
            "POST",
            "/feedback",
            Some(json!({
                "project": "alpha",
                "user_id": "u1",
                "rating": 5,
                "content": "prefer structured retrieval output",
            })),
            false,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["ok"], true);

    let (status, preferences) = app
        .request("GET", "/preferences?project=alpha&user_id=u1", None, false)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(preferences["enabled"], true);
    assert_eq!(preferences["preferences"]["total"], 1);
    assert!(
        preferences["preferences"]["rendered"]
            .as_str()
            .unwrap()
            .contains("Prefers")
    );
}

#[tokio::test]
async fn telemetry_surfaces_backend_and_gc() {
    let app = spawn_app(None).await;
    app.request(
        "POST",
        "/memory/write",
        Some(json!({
            "projectName": "alpha",
            "fileName": "notes/a.md",
            "content": "hello",
        })),
        false,
    )
    .await;

    let (status, fanout) = app.request("GET", "/telemetry/fanout", None, false).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fanout["backend"], "sqlite");

    let (status, gc) = app
        .request("POST", "/telemetry/fanout/gc", None, false)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(gc["ok"], true);
    assert_eq!(gc["result"]["deleted"]["total"], 0);

    let (status, retention) = app
        .request("GET", "/telemetry/retention", None, false)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(retention["thresholds"]["succeeded_hours"].is_u64());

    let (status, health) = app.request("GET", "/status", None, false).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["ok"], true);
    assert!(health["taskRuntime"]["byStatus"].is_object());

    // With no sinks configured nothing was enqueued for fanout.
    let summary = app.state.outbox.summary_cached().await;
    assert_eq!(summary.outstanding(), 0);
}
