use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use tracing::info;

use crate::protocol::crypto::deserialize_verify_key;
use crate::relay::errors::ApiError;
use crate::relay::models::{RegisterRequest, RegisterResponse};
use crate::relay::reputation::DEFAULT_SCORE;
use crate::relay::server::RelayState;
use crate::relay::storage::generate_token;
use crate::relay::webhook::validate_webhook_url;

/// `POST /api/v1/register` — claim `name::<relay_domain>` with a public
/// key. Re-registering with the same key rotates the token; a different
/// key conflicts.
pub async fn register(
    State(state): State<Arc<RelayState>>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let name = body.agent_name.trim().to_lowercase();
    let address = format!("{name}::{}", state.settings.relay_domain);
    crate::protocol::parse_address(&address)
        .map_err(|err| ApiError::bad_request(err.to_string()))?;

    if !state.register_limiter.check(&name) {
        return Err(ApiError::rate_limited("Registration rate limit exceeded"));
    }

    deserialize_verify_key(&body.public_key)
        .map_err(|err| ApiError::bad_request(err.to_string()))?;

    if let Some(webhook_url) = &body.webhook_url
        && let Err(reason) = validate_webhook_url(webhook_url).await
    {
        return Err(ApiError::bad_request(format!("invalid webhook_url: {reason}")));
    }

    let token = generate_token();
    match state.storage.get_agent_by_address(&address).await? {
        Some(existing) if existing.public_key == body.public_key => {
            // Same owner returning without a stored token: rotate it.
            state.storage.rotate_agent_token(&address, &token).await?;
        }
        Some(_) => {
            return Err(ApiError::conflict(format!(
                "address already registered with a different key: {address}"
            )));
        }
        None => {
            state
                .storage
                .register_agent(&address, &body.public_key, &token)
                .await?;
            state.reputation.init_score(&address, DEFAULT_SCORE).await?;
            info!(agent = %address, "registered new agent");
        }
    }

    if let Some(webhook_url) = &body.webhook_url {
        state
            .storage
            .update_agent_webhook_url(&address, Some(webhook_url))
            .await?;
    }

    Ok(Json(RegisterResponse { address, token }))
}
