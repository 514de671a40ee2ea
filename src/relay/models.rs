//! Request/response bodies for the REST surface.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub agent_name: String,
    pub public_key: String,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub address: String,
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub envelope: Value,
}

#[derive(Debug, Serialize)]
pub struct SendResponse {
    pub message_id: String,
    pub delivered: bool,
}

#[derive(Debug, Serialize)]
pub struct InboxResponse {
    pub messages: Vec<Value>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct PublicKeyResponse {
    pub address: String,
    pub public_key: String,
    pub tier: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_domain: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookSetRequest {
    pub webhook_url: String,
}

#[derive(Debug, Serialize)]
pub struct WebhookInfoResponse {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyDomainRequest {
    pub domain: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FederationDeliverRequest {
    pub envelope: Value,
    #[serde(default)]
    pub via: Vec<String>,
    #[serde(default)]
    pub hop_count: u32,
    pub timestamp: String,
    pub from_relay: String,
}

#[derive(Debug, Serialize)]
pub struct FederationDeliverResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct WellKnownRelay {
    pub federation_endpoint: String,
    pub public_key: String,
}

#[derive(Debug, Deserialize)]
pub struct ListPatternRequest {
    pub pattern: String,
}

#[derive(Debug, Deserialize)]
pub struct ReputationSetRequest {
    pub score: i64,
}
