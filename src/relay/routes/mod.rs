mod admin;
mod agents;
mod federation;
pub(crate) mod inbox;
mod register;
mod send;
pub(crate) mod verify_domain;

use std::sync::Arc;

use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde_json::json;

use super::models::WellKnownRelay;
use super::server::RelayState;
use super::ws;

pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/api/v1/register", post(register::register))
        .route("/api/v1/send", post(send::send_message))
        .route("/api/v1/inbox/{address}", get(inbox::inbox))
        .route(
            "/api/v1/agents/{address}/public-key",
            get(agents::public_key),
        )
        .route(
            "/api/v1/agents/{address}/webhook",
            put(agents::set_webhook)
                .get(agents::get_webhook)
                .delete(agents::delete_webhook),
        )
        .route(
            "/api/v1/agents/{address}/webhook/deliveries",
            get(agents::webhook_deliveries),
        )
        .route("/api/v1/verify-domain", post(verify_domain::verify_domain))
        .route(
            "/api/v1/federation/deliver",
            post(federation::federation_deliver),
        )
        .route(
            "/api/v1/admin/blocklist",
            get(admin::list_blocklist)
                .post(admin::add_blocklist)
                .delete(admin::remove_blocklist),
        )
        .route(
            "/api/v1/admin/allowlist",
            get(admin::list_allowlist)
                .post(admin::add_allowlist)
                .delete(admin::remove_allowlist),
        )
        .route(
            "/api/v1/admin/reputation/{address}",
            get(admin::get_reputation).put(admin::set_reputation),
        )
        .route("/.well-known/uam-relay.json", get(well_known))
        .route("/health", get(health))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

async fn well_known(
    axum::extract::State(state): axum::extract::State<Arc<RelayState>>,
) -> Json<WellKnownRelay> {
    Json(WellKnownRelay {
        federation_endpoint: format!(
            "https://{}/api/v1/federation/deliver",
            state.settings.relay_domain
        ),
        public_key: state.relay_public_key.clone(),
    })
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}
