//! HTTP surface: REST intake/admin plus the WebSocket event stream.
//! Handlers are thin; they validate, call into the gateway, and translate
//! internal errors to the wire status mapping.

pub mod admin;
pub mod api;
pub mod ws;

use std::sync::Arc;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::error::GatewayError;
use crate::server::Gateway;

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/api/ask", post(api::ask))
        .route("/api/submit", post(api::submit))
        .route("/api/query/:id", get(api::query))
        .route("/api/request/:id", delete(api::cancel))
        .route("/api/requests", get(api::list_requests))
        .route("/api/status", get(api::status))
        .route("/api/providers", get(api::providers))
        .route("/api/queue", get(api::queue_status))
        .route("/api/health", get(api::health))
        .route("/api/metrics", get(api::metrics))
        .route("/api/provider/:name/toggle", post(admin::toggle_provider))
        .route("/api/cache/stats", get(admin::cache_stats))
        .route("/api/cache/clear", post(admin::cache_clear))
        .route("/api/cache/cleanup", post(admin::cache_cleanup))
        .route("/api/keys", get(admin::list_keys).post(admin::create_key))
        .route("/api/keys/:id", delete(admin::delete_key))
        .route("/api/costs/summary", get(admin::costs_summary))
        .route("/api/costs/by-provider", get(admin::costs_by_provider))
        .route("/api/costs/by-day", get(admin::costs_by_day))
        .route("/api/ws", get(ws::upgrade))
        .with_state(gateway)
}

#[derive(Clone, Debug, Serialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorBody>,
}

pub fn ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        data: Some(data),
        error: None,
    })
}

pub fn accepted<T: Serialize>(data: T) -> (StatusCode, Json<ApiResponse<T>>) {
    (StatusCode::ACCEPTED, ok(data))
}

fn envelope(status: StatusCode, code: &str, message: String) -> Response {
    let body = Json(ApiResponse::<()> {
        success: false,
        data: None,
        error: Some(ApiErrorBody {
            code: code.to_string(),
            message,
        }),
    });
    (status, body).into_response()
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            GatewayError::Validation { .. } | GatewayError::Config(_) => {
                envelope(StatusCode::BAD_REQUEST, "validation", self.to_string())
            }
            GatewayError::UnknownProvider { .. } => {
                envelope(StatusCode::BAD_REQUEST, "validation", self.to_string())
            }
            GatewayError::NotFound { .. } => {
                envelope(StatusCode::NOT_FOUND, "not_found", self.to_string())
            }
            GatewayError::TerminalConflict { .. } => {
                envelope(StatusCode::CONFLICT, "conflict", self.to_string())
            }
            GatewayError::RateLimited { retry_after_s } => {
                let mut response = envelope(
                    StatusCode::TOO_MANY_REQUESTS,
                    "rate_limited",
                    self.to_string(),
                );
                if let Ok(value) = header::HeaderValue::from_str(&retry_after_s.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                response
            }
            GatewayError::QueueFull => {
                envelope(StatusCode::SERVICE_UNAVAILABLE, "queue_full", self.to_string())
            }
            GatewayError::Unauthorized => {
                envelope(StatusCode::UNAUTHORIZED, "unauthorized", self.to_string())
            }
            GatewayError::WaitTimeout => {
                envelope(StatusCode::GATEWAY_TIMEOUT, "wait_timeout", self.to_string())
            }
            GatewayError::Storage(err) => {
                tracing::error!(error = %err, "storage failure surfaced to a handler");
                envelope(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "storage_unavailable",
                    "the state store is unavailable".to_string(),
                )
            }
        }
    }
}
