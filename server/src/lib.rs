#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! line-bridge library: the building blocks behind the `line-bridge` binary.
//!
//! - `routes` — webhook relay (axum router, handlers)
//! - `agent` — agent CLI invocation and response parsing
//! - `tunnel` — tunnel subprocess supervision, reconnect policy, events
//! - `locate` — executable discovery for the agent and tunnel binaries
//! - `process` — subprocess capture and graceful termination
//! - `coordinator` — coordination-service HTTP client
//! - `store` — on-disk status record
//! - `service` — orchestration of all of the above
//! - `config` — configuration loading

pub mod agent;
pub mod config;
pub mod coordinator;
pub mod locate;
pub mod process;
pub mod routes;
pub mod service;
pub mod state;
pub mod store;
pub mod tunnel;
pub mod util;

// Re-export key types at crate root for convenience.
pub use agent::{AgentError, AgentInvoker, AgentResponse};
pub use config::Config;
pub use locate::ExecutableLocator;
pub use service::Bridge;
pub use state::RelayState;
pub use tunnel::{TunnelEvent, TunnelSupervisor};
