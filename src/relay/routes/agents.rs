use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use serde_json::{Value, json};

use crate::relay::auth::authenticate;
use crate::relay::errors::ApiError;
use crate::relay::models::{PublicKeyResponse, WebhookInfoResponse, WebhookSetRequest};
use crate::relay::server::RelayState;
use crate::relay::webhook::validate_webhook_url;

/// `GET /api/v1/agents/{address}/public-key` — the Tier-1 resolution
/// surface. Public: key material is not a secret.
pub async fn public_key(
    State(state): State<Arc<RelayState>>,
    Path(address): Path<String>,
) -> Result<Json<PublicKeyResponse>, ApiError> {
    let Some(agent) = state.storage.get_agent_by_address(&address).await? else {
        return Err(ApiError::not_found(format!("no agent at {address}")));
    };
    let verified_domain = state.storage.get_verified_domain(&address).await?;
    Ok(Json(PublicKeyResponse {
        address: agent.address,
        public_key: agent.public_key,
        tier: 1,
        verified_domain,
    }))
}

async fn authenticate_owner(
    state: &RelayState,
    headers: &HeaderMap,
    address: &str,
) -> Result<(), ApiError> {
    let agent = authenticate(state, headers).await?;
    if agent.address != address {
        return Err(ApiError::forbidden(format!(
            "token does not own agent {address}"
        )));
    }
    Ok(())
}

/// `PUT /api/v1/agents/{address}/webhook` — set the webhook URL after
/// validation (https, public host).
pub async fn set_webhook(
    State(state): State<Arc<RelayState>>,
    Path(address): Path<String>,
    headers: HeaderMap,
    Json(body): Json<WebhookSetRequest>,
) -> Result<Json<WebhookInfoResponse>, ApiError> {
    authenticate_owner(&state, &headers, &address).await?;
    if let Err(reason) = validate_webhook_url(&body.webhook_url).await {
        return Err(ApiError::bad_request(format!("invalid webhook_url: {reason}")));
    }
    state
        .storage
        .update_agent_webhook_url(&address, Some(&body.webhook_url))
        .await?;
    Ok(Json(WebhookInfoResponse {
        address,
        webhook_url: Some(body.webhook_url),
    }))
}

pub async fn get_webhook(
    State(state): State<Arc<RelayState>>,
    Path(address): Path<String>,
    headers: HeaderMap,
) -> Result<Json<WebhookInfoResponse>, ApiError> {
    authenticate_owner(&state, &headers, &address).await?;
    let agent = state
        .storage
        .get_agent_by_address(&address)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no agent at {address}")))?;
    Ok(Json(WebhookInfoResponse {
        address,
        webhook_url: agent.webhook_url,
    }))
}

pub async fn delete_webhook(
    State(state): State<Arc<RelayState>>,
    Path(address): Path<String>,
    headers: HeaderMap,
) -> Result<Json<WebhookInfoResponse>, ApiError> {
    authenticate_owner(&state, &headers, &address).await?;
    state.storage.update_agent_webhook_url(&address, None).await?;
    Ok(Json(WebhookInfoResponse {
        address,
        webhook_url: None,
    }))
}

/// `GET /api/v1/agents/{address}/webhook/deliveries` — recent delivery
/// attempts, newest first.
pub async fn webhook_deliveries(
    State(state): State<Arc<RelayState>>,
    Path(address): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authenticate_owner(&state, &headers, &address).await?;
    let deliveries = state.storage.get_webhook_deliveries(&address, 50).await?;
    let items: Vec<Value> = deliveries
        .into_iter()
        .map(|d| {
            json!({
                "id": d.id,
                "message_id": d.message_id,
                "status": d.status,
                "attempt_count": d.attempt_count,
                "last_status_code": d.last_status_code,
                "last_error": d.last_error,
            })
        })
        .collect();
    Ok(Json(json!({"deliveries": items})))
}
