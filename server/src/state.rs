//! Shared relay state passed to every handler via Axum's `State` extractor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::agent::AgentInvoker;
use crate::config::Config;

/// Shared application state for the webhook relay.
///
/// Holds no tunnel state: the relay and the tunnel supervisor are wired
/// together only by the orchestrator.
#[derive(Clone)]
pub struct RelayState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the relay started (for uptime calculation).
    pub start_time: Instant,
    /// Agent CLI runner shared by all in-flight webhook requests.
    pub invoker: Arc<AgentInvoker>,
    /// Webhook events received since startup. Diagnostic only.
    pub message_count: Arc<AtomicU64>,
}

impl RelayState {
    pub fn new(config: Arc<Config>, invoker: AgentInvoker) -> Self {
        Self {
            config,
            start_time: Instant::now(),
            invoker: Arc::new(invoker),
            message_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Count one inbound event, returning the new total.
    pub fn record_message(&self) -> u64 {
        self.message_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }
}
