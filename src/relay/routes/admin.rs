//! Admin CRUD for allow/block lists and reputation, guarded by the
//! `X-Admin-Key` header. 503 when no admin key is configured.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use serde_json::{Value, json};

use crate::relay::auth::require_admin;
use crate::relay::errors::ApiError;
use crate::relay::models::{ListPatternRequest, ReputationSetRequest};
use crate::relay::server::RelayState;
use crate::relay::storage::ListTable;

pub async fn list_blocklist(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers)?;
    let patterns = state.storage.list_patterns(ListTable::Blocklist).await?;
    Ok(Json(json!({"patterns": patterns})))
}

pub async fn add_blocklist(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Json(body): Json<ListPatternRequest>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers)?;
    let added = state
        .spam_filter
        .add_blocked(&state.storage, &body.pattern)
        .await
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    Ok(Json(json!({"pattern": body.pattern, "added": added})))
}

pub async fn remove_blocklist(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Json(body): Json<ListPatternRequest>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers)?;
    let removed = state
        .spam_filter
        .remove_blocked(&state.storage, &body.pattern)
        .await?;
    if !removed {
        return Err(ApiError::not_found(format!(
            "pattern not on blocklist: {}",
            body.pattern
        )));
    }
    Ok(Json(json!({"pattern": body.pattern, "removed": true})))
}

pub async fn list_allowlist(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers)?;
    let patterns = state.storage.list_patterns(ListTable::Allowlist).await?;
    Ok(Json(json!({"patterns": patterns})))
}

pub async fn add_allowlist(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Json(body): Json<ListPatternRequest>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers)?;
    let added = state
        .spam_filter
        .add_allowed(&state.storage, &body.pattern)
        .await
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    Ok(Json(json!({"pattern": body.pattern, "added": added})))
}

pub async fn remove_allowlist(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Json(body): Json<ListPatternRequest>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers)?;
    let removed = state
        .spam_filter
        .remove_allowed(&state.storage, &body.pattern)
        .await?;
    if !removed {
        return Err(ApiError::not_found(format!(
            "pattern not on allowlist: {}",
            body.pattern
        )));
    }
    Ok(Json(json!({"pattern": body.pattern, "removed": true})))
}

pub async fn get_reputation(
    State(state): State<Arc<RelayState>>,
    Path(address): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers)?;
    let Some(row) = state.reputation.get_info(&address).await? else {
        return Err(ApiError::not_found(format!("no reputation for {address}")));
    };
    Ok(Json(json!({
        "address": row.address,
        "score": row.score,
        "messages_sent": row.messages_sent,
        "messages_rejected": row.messages_rejected,
    })))
}

pub async fn set_reputation(
    State(state): State<Arc<RelayState>>,
    Path(address): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ReputationSetRequest>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers)?;
    let score = state.reputation.set_score(&address, body.score).await?;
    Ok(Json(json!({"address": address, "score": score})))
}
