//! Webhook ingestion endpoint.
//!
//! `POST <server.webhook_path>` accepts one event per call:
//!
//! ```json
//! {"userId": "U123", "displayName": "Alice", "replyToken": "...",
//!  "event": {"message": {"type": "text", "text": "hello"}}}
//! ```
//!
//! | Outcome                         | Status | Body                                              |
//! |---------------------------------|--------|---------------------------------------------------|
//! | agent replied                   | 200    | `{"success":true,"response":{"text","raw"}}`      |
//! | agent replied with no text      | 200    | `{"success":true,"response":null}`                |
//! | agent call failed               | 200    | `{"success":true,"response":null,"error","code"}` |
//! | non-text message                | 200    | `{"success":true,"reason":"unsupported"}`         |
//! | body not JSON / missing `userId`| 400    | `{"error"}`                                       |
//!
//! Agent failures are the agent's problem, not the caller's: the relay still
//! answers 200 so the upstream webhook source does not retry.

use axum::{body::Bytes, extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::agent::InvokeMetadata;
use crate::state::RelayState;
use crate::util::truncate_str;

/// Inbound webhook body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub user_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Upstream event; only the message type and text are read.
    #[serde(default)]
    pub event: Value,
}

impl WebhookEvent {
    /// `event.message.type`, if present.
    pub fn message_type(&self) -> Option<&str> {
        self.event.pointer("/message/type").and_then(Value::as_str)
    }

    /// `event.message.text`, empty when absent.
    pub fn text(&self) -> &str {
        self.event
            .pointer("/message/text")
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    /// Sender name for logs and the agent prefix: `displayName`, else the
    /// first 8 characters of `userId`.
    pub fn sender_name(&self) -> String {
        match self.display_name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.user_id.chars().take(8).collect(),
        }
    }
}

/// `POST <webhook_path>` — relay one event to the agent.
///
/// # Errors
///
/// - `400 Bad Request` with `{"error"}` — body is not a JSON object with `userId`
pub async fn webhook(
    State(state): State<RelayState>,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let event: WebhookEvent = serde_json::from_slice(&body).map_err(|e| {
        warn!("Relay: rejected webhook body: {e}");
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("Invalid JSON: {e}") })),
        )
    })?;

    let count = state.record_message();
    let sender = event.sender_name();
    let message_type = event.message_type().unwrap_or("unknown");
    info!("Relay: event #{count}: {message_type} from {sender}");

    if message_type != "text" {
        return Ok(Json(json!({ "success": true, "reason": "unsupported" })));
    }

    let metadata = InvokeMetadata {
        display_name: Some(sender),
    };

    match state
        .invoker
        .invoke(event.text(), &event.user_id, &metadata)
        .await
    {
        Ok(response) => {
            let text = response.reply_text();
            if text.is_empty() {
                info!("Relay: agent returned no text for event #{count}");
                Ok(Json(json!({ "success": true, "response": null })))
            } else {
                info!("Relay: agent replied: {}", truncate_str(&text, 50));
                Ok(Json(json!({
                    "success": true,
                    "response": { "text": text, "raw": response.raw },
                })))
            }
        }
        Err(e) => Ok(Json(json!({
            "success": true,
            "response": null,
            "error": e.to_string(),
            "code": e.kind(),
        }))),
    }
}
