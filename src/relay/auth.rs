//! Bearer-token authentication for REST and WebSocket surfaces.

use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

use super::errors::ApiError;
use super::server::RelayState;
use super::storage::AgentRecord;

/// Extract the bearer token from an `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Authenticate a REST request. 401 when the header is missing or the
/// token matches no agent.
pub async fn authenticate(state: &RelayState, headers: &HeaderMap) -> Result<AgentRecord, ApiError> {
    let Some(token) = bearer_token(headers) else {
        return Err(ApiError::unauthorized("missing bearer token"));
    };
    authenticate_token(state, token).await
}

/// Authenticate a raw token (the WebSocket query parameter path).
pub async fn authenticate_token(
    state: &RelayState,
    token: &str,
) -> Result<AgentRecord, ApiError> {
    match state.storage.get_agent_by_token(token).await {
        Ok(Some(agent)) => Ok(agent),
        Ok(None) => Err(ApiError::unauthorized("invalid token")),
        Err(err) => Err(err.into()),
    }
}

/// Check the `X-Admin-Key` header against the configured admin key.
/// 503 when no key is configured, 401 on mismatch. Constant-time compare.
pub fn require_admin(state: &RelayState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.settings.admin_key.as_deref() else {
        return Err(ApiError::service_unavailable("admin API is not configured"));
    };
    let provided = headers
        .get("X-Admin-Key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if provided.as_bytes().ct_eq(expected.as_bytes()).into() {
        Ok(())
    } else {
        Err(ApiError::unauthorized("invalid admin key"))
    }
}
