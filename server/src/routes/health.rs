//! Unauthenticated diagnostic endpoints.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::RelayState;

/// Service name reported by the diagnostic endpoints.
pub const SERVICE_NAME: &str = "line-bridge";

/// Agent access mode; the relay only ever talks to the agent through its CLI.
const MODE: &str = "cli-wrapper";

/// `GET /` — service identity.
pub async fn index() -> Json<Value> {
    Json(json!({
        "service": SERVICE_NAME,
        "status": "running",
        "mode": MODE,
    }))
}

/// `GET /health` — liveness probe.
///
/// Also used by the `status` subcommand through the public endpoint to check
/// that the tunnel actually reaches this process.
pub async fn health(State(state): State<RelayState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message_count": state.message_count(),
    }))
}

/// `GET /status` — version and counters.
pub async fn status(State(state): State<RelayState>) -> Json<Value> {
    Json(json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "mode": MODE,
        "stats": {
            "message_count": state.message_count(),
            "uptime_secs": state.start_time.elapsed().as_secs(),
        },
    }))
}
