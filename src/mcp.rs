//! Tool surface for agent runtimes: thin request/response glue around one
//! process-wide [`Agent`] handle.
//!
//! Three tools: `uam_send`, `uam_inbox`, `uam_contact_card`. Errors pass
//! through a whitelist — recognized domain error kinds keep their
//! message, everything else collapses to a generic "internal error" so
//! secrets and URLs never leak into tool output.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::protocol::errors::ProtocolError;
use crate::sdk::agent::Agent;

/// The tool handle, initialized once at server start and shared by
/// reference — no process-global state.
#[derive(Clone)]
pub struct UamTools {
    agent: Arc<Mutex<Agent>>,
}

/// Tool output: either text for the runtime or a sanitized error string.
pub type ToolResult = std::result::Result<String, String>;

impl UamTools {
    pub fn new(agent: Agent) -> Self {
        Self {
            agent: Arc::new(Mutex::new(agent)),
        }
    }

    pub fn from_shared(agent: Arc<Mutex<Agent>>) -> Self {
        Self { agent }
    }

    /// `uam_send(to, message)` → confirmation text with the message id.
    pub async fn uam_send(&self, to: &str, message: &str) -> ToolResult {
        let mut agent = self.agent.lock().await;
        match agent.send(to, message).await {
            Ok(message_id) => Ok(format!("Message sent to {to} (id: {message_id})")),
            Err(err) => Err(sanitize_error(&err)),
        }
    }

    /// `uam_inbox(limit)` → human-readable listing of pending messages.
    pub async fn uam_inbox(&self, limit: usize) -> ToolResult {
        let mut agent = self.agent.lock().await;
        match agent.inbox(limit).await {
            Ok(messages) if messages.is_empty() => Ok("No new messages.".to_string()),
            Ok(messages) => {
                let mut out = format!("{} message(s):\n", messages.len());
                for msg in &messages {
                    out.push_str(&format!(
                        "- [{}] from {}: {}\n",
                        msg.timestamp, msg.from_address, msg.content
                    ));
                }
                Ok(out)
            }
            Err(err) => Err(sanitize_error(&err)),
        }
    }

    /// `uam_contact_card()` → the agent's signed card as JSON text.
    pub async fn uam_contact_card(&self) -> ToolResult {
        let mut agent = self.agent.lock().await;
        if let Err(err) = agent.connect().await {
            return Err(sanitize_error(&err));
        }
        match agent.contact_card() {
            Ok(card) => Ok(serde_json::to_string_pretty(&card).unwrap_or_else(|_| card.to_string())),
            Err(err) => Err(sanitize_error(&err)),
        }
    }
}

/// The error whitelist: domain error kinds surface their message, plus a
/// small set of safe operational phrasings; everything else is generic.
pub(crate) fn sanitize_error(err: &anyhow::Error) -> String {
    if let Some(protocol_err) = err.downcast_ref::<ProtocolError>() {
        return protocol_err.to_string();
    }
    let text = err.to_string();
    const SAFE_PREFIXES: [&str; 4] = [
        "no pending handshake",
        "trust policy",
        "agent not connected",
        "address already registered",
    ];
    if SAFE_PREFIXES
        .iter()
        .any(|prefix| text.starts_with(prefix))
    {
        return text;
    }
    "internal error".to_string()
}

/// Dispatch a tool call by name with JSON arguments — the shape MCP-style
/// runtimes speak.
pub async fn handle_tool_call(tools: &UamTools, name: &str, args: &Value) -> ToolResult {
    match name {
        "uam_send" => {
            let to = args.get("to").and_then(Value::as_str).unwrap_or_default();
            let message = args
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if to.is_empty() || message.is_empty() {
                return Err("uam_send requires 'to' and 'message'".to_string());
            }
            tools.uam_send(to, message).await
        }
        "uam_inbox" => {
            let limit = args
                .get("limit")
                .and_then(Value::as_u64)
                .unwrap_or(50)
                .min(200) as usize;
            tools.uam_inbox(limit).await
        }
        "uam_contact_card" => tools.uam_contact_card().await,
        other => Err(format!("unknown tool: {other}")),
    }
}

#[cfg(test)]
#[path = "mcp_tests.rs"]
mod tests;
