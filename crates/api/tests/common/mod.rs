#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use evidence_api::config::ServerConfig;
use evidence_api::router::build_app_router;
use evidence_api::setup;
use evidence_api::state::AppState;

/// 32 zero bytes, base64.
pub const TEST_SECRETS_KEY: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

/// Build a test `ServerConfig` with safe defaults.
///
/// Scripts are stored under `root/scripts`, runs execute in-process with a
/// 300 ms budget, and infrastructure failures are not retried. `extra`
/// overrides or adds environment variables.
pub fn test_config(root: &Path, extra: &[(&str, &str)]) -> ServerConfig {
    let mut vars: HashMap<String, String> = HashMap::from([
        ("HOST".into(), "127.0.0.1".into()),
        ("PORT".into(), "0".into()),
        ("CORS_ORIGINS".into(), "http://localhost:5173".into()),
        (
            "SCRIPT_STORE_DIR".into(),
            root.join("scripts").to_string_lossy().into_owned(),
        ),
        ("EXECUTION_MODE".into(), "in-process".into()),
        ("AUTOMATION_TIMEOUT_MS".into(), "300".into()),
        ("DISPATCH_MAX_ATTEMPTS".into(), "1".into()),
    ]);
    for (k, v) in extra {
        vars.insert(k.to_string(), v.to_string());
    }
    ServerConfig::from_lookup(|name| vars.get(name).cloned()).expect("test config")
}

/// Build the full application router with all middleware layers.
///
/// Uses [`build_app_router`] so integration tests exercise the same
/// middleware stack that production uses, over an in-memory run store.
pub async fn build_test_app(config: ServerConfig) -> Router {
    let scripts = setup::script_store(&config).await;
    let tracker = setup::run_tracker(&config, &scripts, setup::memory_run_store());
    let state = AppState {
        config: Arc::new(config.clone()),
        scripts,
        tracker,
        pool: None,
    };
    build_app_router(state, &config)
}

pub async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> Response {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("request");
    app.clone().oneshot(request).await.expect("response")
}

pub async fn get(app: &Router, uri: &str) -> Response {
    send(app, Method::GET, uri, None).await
}

pub async fn post_json(app: &Router, uri: &str, body: Value) -> Response {
    send(app, Method::POST, uri, Some(body)).await
}

pub async fn put_json(app: &Router, uri: &str, body: Value) -> Response {
    send(app, Method::PUT, uri, Some(body)).await
}

pub async fn body_json(response: Response) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}

/// Store `source` as the published script of `org/task`.
pub async fn save_script(app: &Router, org: &str, task: &str, source: &str) {
    let response = put_json(
        app,
        &format!("/api/v1/organizations/{org}/tasks/{task}/automation"),
        serde_json::json!({ "source": source }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

/// Dispatch a run and return its id.
pub async fn dispatch(app: &Router, org: &str, task: &str, body: Value) -> String {
    let response = post_json(
        app,
        &format!("/api/v1/organizations/{org}/tasks/{task}/runs"),
        body,
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_json(response).await;
    json["data"]["runId"]
        .as_str()
        .expect("runId")
        .to_string()
}

/// Poll the run until it reaches a terminal status and return its view.
pub async fn wait_for_run(app: &Router, org: &str, run_id: &str) -> Value {
    for _ in 0..200 {
        let response = get(app, &format!("/api/v1/organizations/{org}/runs/{run_id}")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let status = json["data"]["status"].as_str().expect("status").to_string();
        if !matches!(status.as_str(), "PENDING" | "EXECUTING") {
            return json["data"].clone();
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("run {run_id} did not finish");
}
