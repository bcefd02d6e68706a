//! Dispatch-order and cancellation behavior, driven through stub backends
//! registered in place of the configured ones.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tower::util::ServiceExt;

use switchyard::backend::{Backend, BackendResult, ExecContext, HealthProbe};
use switchyard::types::{now_millis, BackendKind, RequestRecord, TokenUsage};
use switchyard::{Gateway, GatewayConfig};

fn config(dir: &std::path::Path, concurrency: usize) -> GatewayConfig {
    serde_json::from_value(json!({
        "providers": [{
            "name": "P",
            "backend_type": "cli",
            "command": "true",
            "concurrency": concurrency,
            "timeout_s": 30,
        }],
        "retry": {"enabled": false},
        "cache": {"enabled": false},
        "rate_limit": {"default_rpm": 60000, "burst": 10000, "global_rpm": 600000},
        "queue": {"max_depth": 100, "skip_ahead": 8},
        "storage": {"path": dir.join("gateway.sqlite")},
        "workers": 2
    }))
    .expect("config json")
}

async fn launch_with(
    config: GatewayConfig,
    backend: Arc<dyn Backend>,
) -> (Arc<Gateway>, axum::Router) {
    let mut gateway = Gateway::new(config).await.expect("gateway");
    assert!(gateway.register_backend("P", backend));
    let gateway = Arc::new(gateway);
    gateway.start().await.expect("start");
    let app = switchyard::http::router(Arc::clone(&gateway));
    (gateway, app)
}

async fn post_json(app: &axum::Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    (status, serde_json::from_slice(&bytes).expect("json"))
}

async fn delete(app: &axum::Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    (status, serde_json::from_slice(&bytes).expect("json"))
}

async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

async fn wait_for_status(
    gateway: &Arc<Gateway>,
    id: &str,
    timeout: Duration,
    predicate: impl Fn(switchyard::RequestStatus) -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Ok(Some(request)) = gateway.store.get_request(id).await {
            if predicate(request.status) {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Records dispatch order; the first call blocks until released so the
/// queue can fill behind it.
struct GatedBackend {
    order: Mutex<Vec<String>>,
    gate: Notify,
}

impl GatedBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            order: Mutex::new(Vec::new()),
            gate: Notify::new(),
        })
    }

    fn order(&self) -> Vec<String> {
        self.order.lock().expect("order lock").clone()
    }
}

#[async_trait]
impl Backend for GatedBackend {
    async fn execute(&self, request: &RequestRecord, _ctx: &ExecContext) -> BackendResult {
        let first = {
            let mut order = self.order.lock().expect("order lock");
            order.push(request.prompt.clone());
            order.len() == 1
        };
        if first {
            self.gate.notified().await;
        }
        BackendResult::Success {
            text: "done".to_string(),
            thinking: None,
            tokens: TokenUsage::new(1, 1),
            cost_usd: 0.0,
        }
    }

    async fn health_check(&self, _ctx: &ExecContext) -> HealthProbe {
        HealthProbe::Ok
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Cli
    }
}

#[tokio::test]
async fn high_priority_requests_jump_the_queue() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = GatedBackend::new();
    let (_gateway, app) = launch_with(config(dir.path(), 1), backend.clone()).await;

    // Occupy the single provider slot.
    let (status, _) = post_json(
        &app,
        "/api/submit",
        json!({"provider": "P", "message": "blocker", "priority": 1}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(
        wait_until(Duration::from_secs(2), || backend.order().len() == 1).await,
        "first request was never dispatched"
    );

    for i in 0..9 {
        let (status, _) = post_json(
            &app,
            "/api/submit",
            json!({"provider": "P", "message": format!("low-{i}"), "priority": 1}),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }
    let (status, _) = post_json(
        &app,
        "/api/submit",
        json!({"provider": "P", "message": "urgent", "priority": 100}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    tokio::time::sleep(Duration::from_millis(50)).await;
    backend.gate.notify_one();

    assert!(
        wait_until(Duration::from_secs(2), || backend.order().len() >= 2).await,
        "no second dispatch happened"
    );
    assert_eq!(backend.order()[1], "urgent");
}

/// Sleeps well past any test deadline and deliberately ignores the cancel
/// signal, exercising the forced-termination path.
struct StubbornBackend;

#[async_trait]
impl Backend for StubbornBackend {
    async fn execute(&self, _request: &RequestRecord, _ctx: &ExecContext) -> BackendResult {
        tokio::time::sleep(Duration::from_secs(10)).await;
        BackendResult::Success {
            text: "too late".to_string(),
            thinking: None,
            tokens: TokenUsage::new(1, 1),
            cost_usd: 0.0,
        }
    }

    async fn health_check(&self, _ctx: &ExecContext) -> HealthProbe {
        HealthProbe::Ok
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Cli
    }
}

#[tokio::test]
async fn cancelling_a_processing_request_lands_within_the_grace_window() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (gateway, app) = launch_with(config(dir.path(), 1), Arc::new(StubbornBackend)).await;

    let (status, body) = post_json(
        &app,
        "/api/submit",
        json!({"provider": "P", "message": "slow"}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = body["data"]["request_id"].as_str().expect("id").to_string();

    let processing = wait_for_status(&gateway, &id, Duration::from_secs(2), |status| {
        status == switchyard::RequestStatus::Processing
    })
    .await;
    assert!(processing, "request never reached processing");

    let cancelled_at = Instant::now();
    let (status, _) = delete(&app, &format!("/api/request/{id}")).await;
    assert_eq!(status, StatusCode::OK);

    let mut final_status = None;
    while Instant::now() < cancelled_at + Duration::from_millis(2500) {
        let request = gateway
            .store
            .get_request(&id)
            .await
            .expect("get")
            .expect("request");
        if request.status.is_terminal() {
            final_status = Some(request.status);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(final_status, Some(switchyard::RequestStatus::Cancelled));

    // Cancelling an already-terminal request conflicts.
    let (status, body) = delete(&app, &format!("/api/request/{id}")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "conflict");

    let response = gateway
        .store
        .get_response(&id)
        .await
        .expect("get")
        .expect("response");
    assert_eq!(response.error_kind, Some(switchyard::ErrorKind::Cancelled));
}

#[tokio::test]
async fn immediate_cancel_lands_within_the_grace_window() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (gateway, app) = launch_with(config(dir.path(), 1), Arc::new(StubbornBackend)).await;

    // No polling between submit and cancel: this lands in whatever moment
    // of the pickup handoff the scheduler produces, and must still win.
    let (status, body) = post_json(
        &app,
        "/api/submit",
        json!({"provider": "P", "message": "doomed"}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = body["data"]["request_id"].as_str().expect("id").to_string();

    let (status, _) = delete(&app, &format!("/api/request/{id}")).await;
    assert_eq!(status, StatusCode::OK);

    let cancelled = wait_for_status(&gateway, &id, Duration::from_millis(2500), |status| {
        status == switchyard::RequestStatus::Cancelled
    })
    .await;
    assert!(cancelled, "cancel was acknowledged but never took effect");
}

#[tokio::test]
async fn cancel_settles_a_processing_request_with_no_live_worker() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (gateway, _app) = launch_with(config(dir.path(), 1), Arc::new(StubbornBackend)).await;

    // A processing row with no worker token, as a crashed worker task
    // would leave behind. It is never enqueued, so nothing picks it up.
    let now = now_millis();
    let orphan = RequestRecord {
        id: "req-orphan".to_string(),
        provider: "P".to_string(),
        model: None,
        agent: None,
        prompt: "stranded".to_string(),
        priority: 0,
        status: switchyard::RequestStatus::Queued,
        attempts: 1,
        fingerprint: "fp-orphan".to_string(),
        bypass_cache: false,
        api_key_id: None,
        parent_id: None,
        worker: None,
        submitted_at_ms: now,
        deadline_ms: now + 60_000,
        updated_at_ms: now,
    };
    gateway.store.put_request(&orphan).await.expect("put");
    gateway
        .store
        .mark_processing("req-orphan", 9)
        .await
        .expect("processing");

    let outcome = gateway.cancel("req-orphan").await.expect("cancel");
    assert_eq!(outcome, switchyard::CancelOutcome::Removed);

    let stored = gateway
        .store
        .get_request("req-orphan")
        .await
        .expect("get")
        .expect("request");
    assert_eq!(stored.status, switchyard::RequestStatus::Cancelled);
    let response = gateway
        .store
        .get_response("req-orphan")
        .await
        .expect("get")
        .expect("response");
    assert_eq!(response.error_kind, Some(switchyard::ErrorKind::Cancelled));

    assert!(matches!(
        gateway.cancel("req-orphan").await,
        Err(switchyard::GatewayError::TerminalConflict { .. })
    ));
}

#[tokio::test]
async fn cancelling_a_queued_request_removes_it_before_dispatch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = GatedBackend::new();
    let (gateway, app) = launch_with(config(dir.path(), 1), backend.clone()).await;

    let (_, first) = post_json(
        &app,
        "/api/submit",
        json!({"provider": "P", "message": "blocker"}),
    )
    .await;
    let blocker = first["data"]["request_id"].as_str().expect("id").to_string();
    assert!(wait_until(Duration::from_secs(2), || backend.order().len() == 1).await);

    let (_, second) = post_json(
        &app,
        "/api/submit",
        json!({"provider": "P", "message": "victim"}),
    )
    .await;
    let victim = second["data"]["request_id"].as_str().expect("id").to_string();

    let (status, _) = delete(&app, &format!("/api/request/{victim}")).await;
    assert_eq!(status, StatusCode::OK);
    let stored = gateway
        .store
        .get_request(&victim)
        .await
        .expect("get")
        .expect("request");
    assert_eq!(stored.status, switchyard::RequestStatus::Cancelled);

    backend.gate.notify_one();
    assert!(
        wait_for_status(&gateway, &blocker, Duration::from_secs(2), |status| status
            .is_terminal())
        .await
    );
    // The cancelled request was never handed to the backend.
    assert!(!backend.order().contains(&"victim".to_string()));
}

#[tokio::test]
async fn provider_concurrency_cap_bounds_in_flight_work() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = GatedBackend::new();
    let (gateway, app) = launch_with(config(dir.path(), 1), backend.clone()).await;

    for i in 0..3 {
        post_json(
            &app,
            "/api/submit",
            json!({"provider": "P", "message": format!("m-{i}")}),
        )
        .await;
    }
    assert!(wait_until(Duration::from_secs(2), || backend.order().len() == 1).await);
    // With a cap of one and the first call blocked, nothing else dispatches.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(backend.order().len(), 1);
    let handle = gateway.provider_handle("P").expect("handle");
    assert_eq!(handle.in_flight(), 1);

    backend.gate.notify_one();
    assert!(wait_until(Duration::from_secs(3), || backend.order().len() == 3).await);
}
