//! HTTP route handlers for the webhook relay.
//!
//! - [`webhook`] — `POST <server.webhook_path>` event ingestion
//! - [`health`] — `GET /`, `GET /health`, `GET /status` diagnostics
//!
//! No handler touches tunnel state, and the diagnostic handlers read only
//! atomics, so they never wait on an in-flight agent call.

pub mod health;
pub mod webhook;

use std::any::Any;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::state::RelayState;

/// Build the relay router with all routes and middleware.
pub fn router(state: RelayState) -> Router {
    let webhook_path = state.config.server.webhook_path.clone();
    let routes = Router::new()
        .route("/", get(health::index))
        .route("/health", get(health::health))
        .route("/status", get(health::status))
        .route(&webhook_path, post(webhook::webhook))
        .with_state(state);
    with_middleware(routes)
}

/// Request tracing, plus panic recovery: a panicking handler becomes a
/// `500 {"error": ...}` response and the server keeps serving.
pub fn with_middleware(router: Router) -> Router {
    router
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic".to_string()
    };
    error!("Relay: handler panicked: {detail}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("Internal error: {detail}") })),
    )
        .into_response()
}
