//! Restart behavior: no request survives a process boundary in a
//! non-terminal state.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::util::ServiceExt;

use switchyard::store::SqliteStore;
use switchyard::types::{now_millis, RequestRecord, RequestStatus};
use switchyard::{Gateway, GatewayConfig};

fn config(dir: &std::path::Path) -> GatewayConfig {
    serde_json::from_value(json!({
        "providers": [{
            "name": "P",
            "backend_type": "cli",
            "command": "true",
        }],
        "cache": {"enabled": false},
        "storage": {"path": dir.join("gateway.sqlite")},
        "workers": 1
    }))
    .expect("config json")
}

fn stranded_request(id: &str) -> RequestRecord {
    let now = now_millis();
    RequestRecord {
        id: id.to_string(),
        provider: "P".to_string(),
        model: None,
        agent: None,
        prompt: "left behind".to_string(),
        priority: 0,
        status: RequestStatus::Queued,
        attempts: 1,
        fingerprint: "fp".to_string(),
        bypass_cache: false,
        api_key_id: None,
        parent_id: None,
        worker: None,
        submitted_at_ms: now,
        deadline_ms: now + 60_000,
        updated_at_ms: now,
    }
}

#[tokio::test]
async fn restart_marks_stranded_requests_interrupted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("gateway.sqlite");

    // A previous process left one queued and one processing request behind.
    {
        let store = SqliteStore::new(&db_path);
        store.init().await.expect("init");
        store
            .put_request(&stranded_request("req-queued"))
            .await
            .expect("put");
        store
            .put_request(&stranded_request("req-processing"))
            .await
            .expect("put");
        store
            .mark_processing("req-processing", 3)
            .await
            .expect("processing");
    }

    let gateway = Arc::new(Gateway::new(config(dir.path())).await.expect("gateway"));
    gateway.start().await.expect("start");
    let app = switchyard::http::router(Arc::clone(&gateway));

    for id in ["req-queued", "req-processing"] {
        let request = Request::builder()
            .method("GET")
            .uri(format!("/api/query/{id}"))
            .body(Body::empty())
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let body: Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(body["data"]["status"], "failed", "request {id}");
        assert_eq!(body["data"]["error"]["code"], "interrupted");
    }

    // The recovered rows are terminal, so no queued or processing request
    // remains anywhere in the store.
    for status in [RequestStatus::Queued, RequestStatus::Processing] {
        let remaining = gateway
            .store
            .list_requests(switchyard::store::RequestFilter {
                status: Some(status),
                ..Default::default()
            })
            .await
            .expect("list");
        assert!(remaining.is_empty(), "stranded rows left in {status:?}");
    }
}

#[tokio::test]
async fn recovered_requests_have_exactly_one_response_row() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("gateway.sqlite");
    {
        let store = SqliteStore::new(&db_path);
        store.init().await.expect("init");
        store
            .put_request(&stranded_request("req-a"))
            .await
            .expect("put");
    }

    let gateway = Arc::new(Gateway::new(config(dir.path())).await.expect("gateway"));
    gateway.start().await.expect("start");

    let response = gateway
        .store
        .get_response("req-a")
        .await
        .expect("get")
        .expect("response row");
    assert_eq!(
        response.error_kind,
        Some(switchyard::ErrorKind::Interrupted)
    );

    let transitions = gateway
        .store
        .list_transitions("req-a")
        .await
        .expect("transitions");
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].from_status, RequestStatus::Queued);
    assert_eq!(transitions[0].to_status, RequestStatus::Failed);
}
