//! Domain-control verification: the agent proves it owns a DNS domain by
//! publishing its public key at `_uam.<domain>` (TXT) or
//! `https://<domain>/.well-known/uam.json` (fallback). Verified agents
//! get the DNS-verified reputation floor.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use hickory_resolver::TokioResolver;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::dns::lookup_txt_identity;
use crate::relay::auth::authenticate;
use crate::relay::errors::ApiError;
use crate::relay::models::VerifyDomainRequest;
use crate::relay::reputation::DNS_VERIFIED_SCORE;
use crate::relay::server::RelayState;

const VERIFICATION_TTL_HOURS: i64 = 24;

/// `POST /api/v1/verify-domain` — run one verification attempt now.
/// Agents poll until the response status is `verified`.
pub async fn verify_domain(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Json(body): Json<VerifyDomainRequest>,
) -> Result<Json<Value>, ApiError> {
    let agent = authenticate(&state, &headers).await?;
    let domain = body.domain.trim().to_lowercase();
    if domain.is_empty() || domain.chars().any(char::is_whitespace) {
        return Err(ApiError::bad_request("invalid domain"));
    }

    let method = match check_domain_key(&domain, &agent.public_key).await {
        Some(method) => method,
        None => {
            return Ok(Json(json!({"status": "failed", "domain": domain})));
        }
    };

    state
        .storage
        .upsert_domain_verification(
            &agent.address,
            &domain,
            &agent.public_key,
            method,
            VERIFICATION_TTL_HOURS,
        )
        .await?;
    if state.reputation.get_score(&agent.address) < DNS_VERIFIED_SCORE {
        state
            .reputation
            .set_score(&agent.address, DNS_VERIFIED_SCORE)
            .await?;
    }
    info!(agent = %agent.address, %domain, method, "domain verified");

    Ok(Json(json!({
        "status": "verified",
        "domain": domain,
        "method": method,
    })))
}

/// Check whether `domain` currently advertises `public_key`, first via
/// DNS TXT, then via the HTTPS well-known fallback. Returns the method
/// that matched.
pub(crate) async fn check_domain_key(domain: &str, public_key: &str) -> Option<&'static str> {
    match TokioResolver::builder_tokio() {
        Ok(builder) => {
            let resolver = builder.build();
            if let Some(identity) = lookup_txt_identity(&resolver, domain).await
                && identity.public_key == public_key
            {
                return Some("dns");
            }
        }
        Err(err) => warn!("system DNS config unavailable for verification: {err}"),
    }

    // HTTPS fallback: /.well-known/uam.json with {"public_key": ...}.
    let url = format!("https://{domain}/.well-known/uam.json");
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .ok()?;
    let doc: Value = client
        .get(&url)
        .send()
        .await
        .ok()?
        .error_for_status()
        .ok()?
        .json()
        .await
        .ok()?;
    if doc.get("public_key").and_then(Value::as_str) == Some(public_key) {
        return Some("https");
    }
    None
}
