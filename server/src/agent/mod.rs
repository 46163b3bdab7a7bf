//! Agent CLI invocation.
//!
//! The local agent is reached only through its command-line client: each
//! inbound message becomes one `gateway call agent` subprocess carrying a JSON
//! parameter document, and the JSON the CLI prints is parsed back into an
//! [`AgentResponse`].
//!
//! - [`invoker`] — [`AgentInvoker`], locating, spawning, and parsing
//! - this module — the request/response/error types shared with the relay

pub mod invoker;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use invoker::AgentInvoker;

/// Parameter document passed to the agent CLI via `--params`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    /// Message text, prefixed with the sender's display context.
    pub message: String,
    /// Per-user conversation namespace, `<source>:<userId>`.
    #[serde(rename = "sessionId")]
    pub session_key: String,
    /// Fresh per invocation so the agent never treats two calls as one.
    pub idempotency_key: String,
}

impl AgentRequest {
    /// Build a request for `user_id`, generating a new idempotency key.
    pub fn new(source: &str, user_id: &str, display_name: &str, message: &str) -> Self {
        Self {
            message: format!("[LINE User: {display_name}] {message}"),
            session_key: session_key(source, user_id),
            idempotency_key: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Session key for `user_id` under the `source` namespace.
pub fn session_key(source: &str, user_id: &str) -> String {
    format!("{source}:{user_id}")
}

/// Optional sender context supplied alongside the message text.
#[derive(Debug, Clone, Default)]
pub struct InvokeMetadata {
    /// Shown to the agent in the message prefix; `User` when absent.
    pub display_name: Option<String>,
}

/// One text fragment of the agent's final result.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Payload {
    #[serde(default)]
    pub text: Option<String>,
}

/// Parsed agent CLI output.
#[derive(Debug, Clone)]
pub struct AgentResponse {
    /// The document's `ok` flag (absent counts as success).
    pub ok: bool,
    /// `result.payloads[]`, in order.
    pub payloads: Vec<Payload>,
    /// The full document as printed by the CLI.
    pub raw: Value,
}

impl AgentResponse {
    /// Parse CLI stdout. Anything that is not a JSON document is
    /// [`AgentError::InvalidOutput`]; a document without payloads is an empty
    /// reply, not an error.
    pub fn parse(stdout: &str) -> Result<Self, AgentError> {
        let raw: Value = serde_json::from_str(stdout.trim()).map_err(|e| {
            AgentError::InvalidOutput(format!(
                "{e}: {}",
                crate::util::truncate_str(stdout, 100)
            ))
        })?;
        if !raw.is_object() {
            return Err(AgentError::InvalidOutput(format!(
                "expected a JSON object, got {}",
                crate::util::truncate_str(stdout, 100)
            )));
        }

        let payloads = raw
            .pointer("/result/payloads")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|p| serde_json::from_value(p.clone()).unwrap_or_default())
                    .collect()
            })
            .unwrap_or_default();
        let ok = raw.get("ok").and_then(Value::as_bool).unwrap_or(true);

        Ok(Self { ok, payloads, raw })
    }

    /// All non-empty payload texts joined with `\n`, in order.
    pub fn reply_text(&self) -> String {
        self.payloads
            .iter()
            .filter_map(|p| p.text.as_deref())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Why an invocation produced no [`AgentResponse`].
#[derive(Debug)]
pub enum AgentError {
    /// No agent executable on any candidate location.
    ExecutableNotFound(String),
    /// The CLI could not be started.
    Spawn(std::io::Error),
    /// The CLI exited non-zero; carries its stderr.
    CliError { code: Option<i32>, stderr: String },
    /// The CLI's stdout was not a JSON document.
    InvalidOutput(String),
    /// The CLI outlived the local guard and was killed.
    Timeout(std::time::Duration),
    /// The request could not be serialized or the child not awaited.
    Internal(String),
}

impl AgentError {
    /// Stable machine-readable kind, used in relay responses and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::ExecutableNotFound(_) => "executable_not_found",
            AgentError::Spawn(_) => "spawn_failed",
            AgentError::CliError { .. } => "cli_error",
            AgentError::InvalidOutput(_) => "invalid_output",
            AgentError::Timeout(_) => "timeout",
            AgentError::Internal(_) => "internal",
        }
    }
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentError::ExecutableNotFound(e) => write!(f, "{e}"),
            AgentError::Spawn(e) => write!(f, "failed to start agent CLI: {e}"),
            AgentError::CliError { code, stderr } => match code {
                Some(c) => write!(f, "agent CLI exited with code {c}: {stderr}"),
                None => write!(f, "agent CLI killed by signal: {stderr}"),
            },
            AgentError::InvalidOutput(e) => write!(f, "invalid agent CLI output: {e}"),
            AgentError::Timeout(d) => write!(f, "agent CLI timed out after {}s", d.as_secs()),
            AgentError::Internal(e) => write!(f, "agent invocation error: {e}"),
        }
    }
}

impl std::error::Error for AgentError {}
