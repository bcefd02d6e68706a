use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::{accepted, ok, ApiErrorBody};
use crate::error::GatewayError;
use crate::server::{Gateway, ProviderStatusView, SubmitOutcome, SubmitParams};
use crate::store::RequestFilter;
use crate::types::{RequestRecord, RequestStatus, ResponseRecord, TokenUsage};

#[derive(Debug, Deserialize)]
pub struct AskBody {
    pub provider: String,
    pub message: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub timeout_s: Option<f64>,
    #[serde(default)]
    pub bypass_cache: bool,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub parent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AskQuery {
    #[serde(default)]
    pub wait: Option<bool>,
    #[serde(default)]
    pub timeout: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct RequestDetail {
    pub request_id: String,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub status: RequestStatus,
    pub priority: i64,
    pub attempts: u32,
    pub submitted_at_ms: u64,
    pub deadline_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<u64>,
}

pub fn detail(request: RequestRecord, response: Option<ResponseRecord>) -> RequestDetail {
    let mut view = RequestDetail {
        request_id: request.id,
        provider: request.provider,
        model: request.model,
        agent: request.agent,
        parent_id: request.parent_id,
        status: request.status,
        priority: request.priority,
        attempts: request.attempts,
        submitted_at_ms: request.submitted_at_ms,
        deadline_ms: request.deadline_ms,
        response: None,
        thinking: None,
        tokens: None,
        latency_ms: None,
        provider_used: None,
        cached: None,
        error: None,
        completed_at_ms: None,
    };
    if let Some(response) = response {
        view.response = Some(response.text);
        view.thinking = response.thinking;
        view.tokens = Some(response.tokens);
        view.latency_ms = Some(response.latency_ms);
        view.provider_used = response.provider_used;
        view.cached = Some(response.cached);
        view.completed_at_ms = Some(response.completed_at_ms);
        if let Some(kind) = response.error_kind {
            view.error = Some(ApiErrorBody {
                code: kind.as_str().to_string(),
                message: response.error_message.unwrap_or_default(),
            });
        }
    }
    view
}

async fn authenticate(
    gateway: &Gateway,
    headers: &HeaderMap,
) -> Result<(Option<String>, Option<u32>), GatewayError> {
    let Some(value) = headers.get("x-api-key") else {
        return Ok((None, None));
    };
    let secret = value.to_str().map_err(|_| GatewayError::Unauthorized)?;
    match gateway.store.api_key_verify(secret).await? {
        Some(record) => Ok((Some(record.id), record.rpm)),
        None => Err(GatewayError::Unauthorized),
    }
}

fn submit_params(
    body: AskBody,
    api_key_id: Option<String>,
    api_key_rpm: Option<u32>,
) -> SubmitParams {
    SubmitParams {
        provider: body.provider,
        message: body.message,
        model: body.model,
        agent: body.agent,
        priority: body.priority,
        timeout_s: body.timeout_s,
        bypass_cache: body.bypass_cache,
        stream: body.stream,
        api_key_id,
        api_key_rpm,
        parent_id: body.parent_id,
    }
}

/// `POST /api/ask?wait=&timeout=` — submit, optionally blocking until the
/// request reaches a terminal state.
pub async fn ask(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<AskQuery>,
    headers: HeaderMap,
    Json(body): Json<AskBody>,
) -> Result<Response, GatewayError> {
    let (api_key_id, api_key_rpm) = authenticate(&gateway, &headers).await?;
    let outcome = gateway
        .submit(submit_params(body, api_key_id, api_key_rpm))
        .await?;
    match outcome {
        SubmitOutcome::Cached { request, response } => {
            Ok(ok(detail(request, Some(response))).into_response())
        }
        SubmitOutcome::Queued(request) => {
            if query.wait.unwrap_or(false) {
                let timeout =
                    Duration::from_secs_f64(query.timeout.unwrap_or(30.0).clamp(0.1, 600.0));
                let (request, response) = gateway.wait_for_terminal(&request.id, timeout).await?;
                Ok(ok(detail(request, response)).into_response())
            } else {
                Ok(accepted(detail(request, None)).into_response())
            }
        }
    }
}

/// `POST /api/submit` — always asynchronous.
pub async fn submit(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(body): Json<AskBody>,
) -> Result<Response, GatewayError> {
    let (api_key_id, api_key_rpm) = authenticate(&gateway, &headers).await?;
    let outcome = gateway
        .submit(submit_params(body, api_key_id, api_key_rpm))
        .await?;
    let (request, status) = match outcome {
        SubmitOutcome::Cached { request, .. } => (request, RequestStatus::Completed),
        SubmitOutcome::Queued(request) => (request, RequestStatus::Queued),
    };
    Ok(accepted(serde_json::json!({
        "request_id": request.id,
        "status": status,
    }))
    .into_response())
}

pub async fn query(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<String>,
) -> Result<Response, GatewayError> {
    let request = gateway
        .store
        .get_request(&id)
        .await?
        .ok_or_else(|| GatewayError::NotFound { id: id.clone() })?;
    let response = gateway.store.get_response(&id).await?;
    Ok(ok(detail(request, response)).into_response())
}

pub async fn cancel(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<String>,
) -> Result<Response, GatewayError> {
    gateway.cancel(&id).await?;
    Ok(ok(serde_json::json!({"request_id": id, "cancelled": true})).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

pub async fn list_requests(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<ListQuery>,
) -> Result<Response, GatewayError> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(RequestStatus::parse(raw).ok_or_else(|| GatewayError::Validation {
            reason: format!("unknown status filter: {raw}"),
        })?),
    };
    let requests = gateway
        .store
        .list_requests(RequestFilter {
            status,
            provider: query.provider.clone(),
            limit: query.limit.unwrap_or(50).min(100),
            offset: query.offset.unwrap_or(0),
        })
        .await?;
    let views: Vec<RequestDetail> = requests
        .into_iter()
        .map(|request| detail(request, None))
        .collect();
    Ok(ok(views).into_response())
}

#[derive(Debug, Serialize)]
pub struct GatewayStatus {
    pub uptime_s: u64,
    pub queue_depth: usize,
    pub queue_max_depth: usize,
    pub requests_by_status: HashMap<String, u64>,
    pub ws_clients: usize,
}

#[derive(Debug, Serialize)]
pub struct StatusData {
    pub gateway: GatewayStatus,
    pub providers: Vec<ProviderStatusView>,
}

pub async fn status(State(gateway): State<Arc<Gateway>>) -> Result<Response, GatewayError> {
    let counts = gateway.store.counts_by_status().await?;
    let data = StatusData {
        gateway: GatewayStatus {
            uptime_s: gateway.uptime_s(),
            queue_depth: gateway.queue.depth(),
            queue_max_depth: gateway.queue.max_depth(),
            requests_by_status: counts.into_iter().collect(),
            ws_clients: gateway.events.subscriber_count(),
        },
        providers: gateway.provider_views(),
    };
    Ok(ok(data).into_response())
}

pub async fn providers(State(gateway): State<Arc<Gateway>>) -> Response {
    ok(gateway.provider_views()).into_response()
}

pub async fn queue_status(State(gateway): State<Arc<Gateway>>) -> Response {
    let by_provider: HashMap<String, usize> = gateway
        .providers
        .keys()
        .map(|name| (name.clone(), gateway.queue.depth_for(name)))
        .collect();
    ok(serde_json::json!({
        "depth": gateway.queue.depth(),
        "max_depth": gateway.queue.max_depth(),
        "by_provider": by_provider,
    }))
    .into_response()
}

pub async fn health() -> Response {
    ok(serde_json::json!({"status": "ok"})).into_response()
}

pub async fn metrics(State(gateway): State<Arc<Gateway>>) -> Response {
    let rendered = gateway.metrics.render(&gateway.gauges());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        rendered,
    )
        .into_response()
}
