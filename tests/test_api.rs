//! Tests for REST API endpoints, driven through the router without a socket.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

use conductor::agents::AgentRegistry;
use conductor::agents::builtin::ScriptedInvoker;
use conductor::api::{AppState, router};
use conductor::bus::EventBus;
use conductor::engine::types::{SessionStatus, StepSpec};
use conductor::engine::{Orchestrator, OrchestratorConfig, RuntimeContext};
use conductor::planner::StaticPlanner;
use conductor::storage::MemorySessionStore;
use conductor::workspace::DirWorkspaceProvider;

fn app(steps: Vec<StepSpec>) -> (Router, Orchestrator, TempDir) {
    let workspace = TempDir::new().unwrap();
    let ctx = RuntimeContext::new(
        EventBus::default(),
        Arc::new(MemorySessionStore::new()),
        Arc::new(StaticPlanner::new("api", steps)),
        Arc::new(AgentRegistry::with_defaults(Arc::new(ScriptedInvoker::echo()))),
        Arc::new(DirWorkspaceProvider::new(workspace.path())),
    );
    let orchestrator = Orchestrator::new(ctx, OrchestratorConfig::default());
    let state = Arc::new(AppState {
        orchestrator: orchestrator.clone(),
    });
    (router(state), orchestrator, workspace)
}

fn default_steps() -> Vec<StepSpec> {
    vec![
        StepSpec::new("research", "researcher", "Research {{goal}}"),
        StepSpec::new("write", "writer", "Write it up").depends_on(["research"]),
    ]
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(v) => builder
            .header("content-type", "application/json")
            .body(Body::from(v.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn settled(orchestrator: &Orchestrator, id: &str) {
    tokio::time::timeout(Duration::from_secs(10), orchestrator.wait(id))
        .await
        .unwrap()
        .unwrap();
}

// --- Meta endpoints ---

#[tokio::test]
async fn health_reports_ok() {
    let (app, _, _ws) = app(default_steps());
    let (status, body) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn agents_are_listed() {
    let (app, _, _ws) = app(default_steps());
    let (status, body) = call(&app, "GET", "/agents", None).await;
    assert_eq!(status, StatusCode::OK);
    let kinds: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["agent_kind"].as_str().unwrap())
        .collect();
    assert!(kinds.contains(&"researcher"));
    assert!(kinds.contains(&"writer"));
}

// --- Session lifecycle ---

#[tokio::test]
async fn create_then_fetch_session() {
    let (app, orchestrator, _ws) = app(default_steps());

    let (status, body) = call(&app, "POST", "/sessions", Some(json!({ "goal": "wind farms" }))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = body["session_id"].as_str().unwrap().to_string();
    settled(&orchestrator, &id).await;

    let (status, body) = call(&app, "GET", &format!("/sessions/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session"]["status"], "completed");
    assert_eq!(body["session"]["goal"], "wind farms");
    assert_eq!(body["results"]["research"]["status"], "completed");

    let (status, body) = call(&app, "GET", "/sessions?status=completed", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, body) = call(&app, "GET", &format!("/sessions/{}/versions", id), None).await;
    assert_eq!(status, StatusCode::OK);
    let versions = body["versions"].as_array().unwrap();
    assert!(versions.len() >= 2);

    let from = versions[0].as_str().unwrap();
    let to = versions[versions.len() - 1].as_str().unwrap();
    let (status, body) = call(
        &app,
        "GET",
        &format!("/sessions/{}/diff?from={}&to={}", id, from, to),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["workflow_diff"]["status"]["to"], "completed");
}

#[tokio::test]
async fn empty_goal_is_rejected() {
    let (app, _, _ws) = app(default_steps());
    let (status, body) = call(&app, "POST", "/sessions", Some(json!({ "goal": "  " }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("goal"));
}

#[tokio::test]
async fn invalid_plan_is_a_bad_request() {
    let (app, _, _ws) = app(vec![StepSpec::new("x", "astrologer", "Read the stars")]);
    let (status, body) = call(&app, "POST", "/sessions", Some(json!({ "goal": "fate" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("astrologer"));
}

#[tokio::test]
async fn invalid_status_filter_is_rejected() {
    let (app, _, _ws) = app(default_steps());
    let (status, _) = call(&app, "GET", "/sessions?status=sleeping", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let (app, _, _ws) = app(default_steps());
    let (status, _) = call(&app, "GET", "/sessions/session_missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = call(&app, "POST", "/sessions/session_missing/pause", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn illegal_transition_is_a_conflict() {
    let (app, orchestrator, _ws) = app(default_steps());
    let id = orchestrator.execute("done fast").await.unwrap();
    settled(&orchestrator, &id).await;
    assert_eq!(
        orchestrator.get_session(&id).await.unwrap().status,
        SessionStatus::Completed
    );

    let (status, body) = call(&app, "POST", &format!("/sessions/{}/pause", id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("cannot move"));

    let (status, _) = call(&app, "POST", &format!("/sessions/{}/abandon", id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn modify_validates_its_body() {
    let (app, orchestrator, _ws) = app(default_steps());
    let id = orchestrator.execute("edit me").await.unwrap();
    settled(&orchestrator, &id).await;

    let uri = format!("/sessions/{}/modify", id);
    let (status, _) = call(&app, "POST", &uri, Some(json!({ "edits": [] }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let edit = json!({ "edits": [{ "op": "remove", "step_id": "write" }] });
    let (status, _) = call(&app, "POST", &uri, Some(edit)).await;
    assert_eq!(status, StatusCode::CONFLICT);
}
