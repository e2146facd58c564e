use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use sync_stress::coordinator::api::{router, ControlState};
use sync_stress::coordinator::Coordinator;
use sync_stress::metrics::CoordinatorMetrics;
use sync_stress::sync::MemoryBackend;
use sync_stress::worker::storage::MemoryStorage;
use sync_stress::worker::WorkerSettings;
use tower::ServiceExt;

const TOKEN: &str = "control-token";

fn app() -> (Router, MemoryBackend) {
    let backend = MemoryBackend::new(Some("secret".into()));
    let coordinator = Coordinator::new(
        Arc::new(MemoryStorage::new()),
        Arc::new(backend.clone()),
        WorkerSettings {
            operation_timeout: Duration::from_secs(10),
            access_secret: Some("secret".into()),
        },
        CoordinatorMetrics::new(),
        "http://localhost:4000",
        50,
    );
    let state = ControlState::new(Arc::new(coordinator), TOKEN);
    (router(state), backend)
}

fn request(method: &str, uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

#[tokio::test]
async fn control_routes_require_token() {
    let (app, _) = app();
    let req = Request::builder().uri("/state").body(Body::empty()).unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());

    let req = Request::builder()
        .uri("/metrics")
        .header(header::AUTHORIZATION, "Bearer wrong")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, req).await.0, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn health_is_public() {
    let (app, _) = app();
    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["tests"], 0);
}

#[tokio::test(start_paused = true)]
async fn start_run_then_stop() {
    let (app, backend) = app();

    // No content type, as the control client sends it
    let body = r#"{"workers":2,"files":1,"startWithin":0}"#;
    let (status, report) = send(&app, request("POST", "/load-1/start", body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["requested"], 2);
    assert_eq!(report["provisioned"], 2);
    assert_eq!(report["failed"], 0);

    let (status, _) = send(&app, request("POST", "/load-1/start", body)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.file_count(), 2);

    let (status, state) = send(&app, request("GET", "/state", "")).await;
    assert_eq!(status, StatusCode::OK);
    let run = &state["tests"]["load-1"];
    assert_eq!(run["status"], "running");
    assert_eq!(run["config"]["targetUri"], "http://localhost:4000");
    let events = run["events"].as_array().unwrap();
    assert!(events.len() >= 8);
    assert!(events.iter().all(|e| e.get("error").is_none()));

    let (status, summary) = send(&app, request("GET", "/load-1/summary", "")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["workersReporting"], 2);
    assert_eq!(summary["operations"]["create file"]["count"], 2);

    let (status, stopped) = send(&app, request("POST", "/load-1/stop", r#"{"workers":2}"#)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stopped["stopped"], 2);

    let (_, state) = send(&app, request("GET", "/state", "")).await;
    assert_eq!(state["tests"]["load-1"]["status"], "stopped");
}

#[tokio::test]
async fn bad_bodies_are_rejected() {
    let (app, _) = app();
    let (status, body) = send(&app, request("POST", "/t1/start", "not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().starts_with("Invalid body"));

    let (status, _) = send(&app, request("POST", "/t1/start", r#"{"workers":51,"files":1,"startWithin":0}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, state) = send(&app, request("GET", "/state", "")).await;
    assert!(state["tests"].as_object().unwrap().is_empty());
}

#[tokio::test]
async fn reset_clears_state_and_summary_is_gone() {
    let (app, _) = app();
    let body = r#"{"uri":"http://sync.test","workers":1,"files":1,"startWithin":60000}"#;
    assert_eq!(send(&app, request("POST", "/t1/start", body)).await.0, StatusCode::OK);

    let (status, _) = send(&app, request("GET", "/reset", "")).await;
    assert_eq!(status, StatusCode::OK);

    let (_, state) = send(&app, request("GET", "/state", "")).await;
    assert!(state["tests"].as_object().unwrap().is_empty());

    let (status, body) = send(&app, request("GET", "/t1/summary", "")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Test t1 not found");
}

#[tokio::test]
async fn metrics_are_prometheus_text() {
    let (app, _) = app();
    let response = app.clone().oneshot(request("GET", "/metrics", "")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("# TYPE syncstress_tests_started_total counter"));
    assert!(text.contains("syncstress_workers_live 0"));
}
