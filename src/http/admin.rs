use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use super::ok;
use crate::error::GatewayError;
use crate::server::Gateway;
use crate::types::ApiKeyRecord;

pub async fn toggle_provider(
    State(gateway): State<Arc<Gateway>>,
    Path(name): Path<String>,
) -> Result<Response, GatewayError> {
    let enabled = gateway
        .toggle_provider(&name)
        .ok_or(GatewayError::UnknownProvider { name: name.clone() })?;
    Ok(ok(serde_json::json!({"provider": name, "enabled": enabled})).into_response())
}

pub async fn cache_stats(State(gateway): State<Arc<Gateway>>) -> Result<Response, GatewayError> {
    let stats = gateway.cache.stats().await?;
    Ok(ok(stats).into_response())
}

pub async fn cache_clear(State(gateway): State<Arc<Gateway>>) -> Result<Response, GatewayError> {
    let removed = gateway.cache.clear().await?;
    Ok(ok(serde_json::json!({"removed": removed})).into_response())
}

pub async fn cache_cleanup(State(gateway): State<Arc<Gateway>>) -> Result<Response, GatewayError> {
    let removed = gateway.cache.cleanup().await?;
    Ok(ok(serde_json::json!({"removed": removed})).into_response())
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyBody {
    pub name: String,
    #[serde(default)]
    pub rpm: Option<u32>,
}

#[derive(Debug, serde::Serialize)]
pub struct CreatedKey {
    #[serde(flatten)]
    pub record: ApiKeyRecord,
    /// Plaintext secret, returned exactly once at creation time.
    pub secret: String,
}

pub async fn create_key(
    State(gateway): State<Arc<Gateway>>,
    Json(body): Json<CreateKeyBody>,
) -> Result<Response, GatewayError> {
    if body.name.trim().is_empty() {
        return Err(GatewayError::Validation {
            reason: "key name must not be empty".to_string(),
        });
    }
    let (record, secret) = gateway.store.api_key_create(&body.name, body.rpm).await?;
    Ok(ok(CreatedKey { record, secret }).into_response())
}

pub async fn list_keys(State(gateway): State<Arc<Gateway>>) -> Result<Response, GatewayError> {
    let keys = gateway.store.api_key_list().await?;
    Ok(ok(keys).into_response())
}

pub async fn delete_key(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<String>,
) -> Result<Response, GatewayError> {
    if !gateway.store.api_key_delete(&id).await? {
        return Err(GatewayError::NotFound { id });
    }
    Ok(ok(serde_json::json!({"deleted": id})).into_response())
}

#[derive(Debug, Deserialize)]
pub struct CostQuery {
    #[serde(default)]
    pub days: Option<u64>,
}

pub async fn costs_summary(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<CostQuery>,
) -> Result<Response, GatewayError> {
    let summary = gateway
        .store
        .cost_summary(query.days.unwrap_or(30).clamp(1, 365))
        .await?;
    Ok(ok(summary).into_response())
}

pub async fn costs_by_provider(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<CostQuery>,
) -> Result<Response, GatewayError> {
    let costs = gateway
        .store
        .cost_by_provider(query.days.unwrap_or(30).clamp(1, 365))
        .await?;
    Ok(ok(costs).into_response())
}

pub async fn costs_by_day(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<CostQuery>,
) -> Result<Response, GatewayError> {
    let costs = gateway
        .store
        .cost_by_day(query.days.unwrap_or(7).clamp(1, 365))
        .await?;
    Ok(ok(costs).into_response())
}
