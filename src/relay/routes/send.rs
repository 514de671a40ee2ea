use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;

use crate::relay::auth::authenticate;
use crate::relay::errors::ApiError;
use crate::relay::ingress::process_envelope;
use crate::relay::models::{SendRequest, SendResponse};
use crate::relay::server::RelayState;

/// `POST /api/v1/send` — the REST entry into the ingress pipeline.
pub async fn send_message(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Json(body): Json<SendRequest>,
) -> Result<Json<SendResponse>, ApiError> {
    let agent = authenticate(&state, &headers).await?;
    let outcome = process_envelope(&state, &agent, &body.envelope).await?;
    Ok(Json(SendResponse {
        message_id: outcome.message_id,
        delivered: outcome.delivered,
    }))
}
