//! [`AgentInvoker`] — one agent CLI subprocess per message.
//!
//! The argv is fixed:
//!
//! ```text
//! <agent> gateway call agent --params <json> --expect-final --timeout 120000 --json
//! ```
//!
//! Invocations share nothing but the memoized executable path, so any number
//! may be in flight at once.

use std::time::Duration;

use tracing::{info, warn};

use super::{AgentError, AgentRequest, AgentResponse, InvokeMetadata};
use crate::config::AgentConfig;
use crate::locate::ExecutableLocator;
use crate::process::{self, RunError};
use crate::util::truncate_str;

/// Timeout handed to the agent CLI itself, in milliseconds.
pub const AGENT_TIMEOUT_MS: u64 = 120_000;

/// Extra time the CLI gets to honor its own timeout before it is killed.
const GUARD_GRACE: Duration = Duration::from_secs(10);

const SUBCOMMAND: [&str; 3] = ["gateway", "call", "agent"];

/// Runs the agent CLI for inbound messages.
#[derive(Debug)]
pub struct AgentInvoker {
    locator: ExecutableLocator,
    source: String,
    guard: Duration,
}

impl AgentInvoker {
    /// Invoker that namespaces session keys with `source`.
    pub fn new(locator: ExecutableLocator, source: impl Into<String>) -> Self {
        Self {
            locator,
            source: source.into(),
            guard: Duration::from_millis(AGENT_TIMEOUT_MS) + GUARD_GRACE,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(
            ExecutableLocator::for_agent(config),
            config.session_prefix.clone(),
        )
    }

    /// Override the local kill deadline (the CLI still gets `--timeout 120000`).
    #[must_use]
    pub fn with_guard(mut self, guard: Duration) -> Self {
        self.guard = guard;
        self
    }

    /// Send `message` from `user_id` to the agent and wait for its final result.
    pub async fn invoke(
        &self,
        message: &str,
        user_id: &str,
        metadata: &InvokeMetadata,
    ) -> Result<AgentResponse, AgentError> {
        let display_name = metadata.display_name.as_deref().unwrap_or("User");
        let request = AgentRequest::new(&self.source, user_id, display_name, message);

        let executable = self
            .locator
            .resolve()
            .map_err(|e| AgentError::ExecutableNotFound(e.to_string()))?;
        let args = build_args(&request)?;

        info!(
            "Agent: invoking (session {}, key {}): {}",
            request.session_key,
            request.idempotency_key,
            truncate_str(message, 30)
        );

        let output = process::run_captured(executable.as_os_str(), &args, self.guard)
            .await
            .map_err(|e| match e {
                RunError::Spawn(io) => AgentError::Spawn(io),
                RunError::Timeout(d) => AgentError::Timeout(d),
                other => AgentError::Internal(other.to_string()),
            })
            .inspect_err(|e| warn!("Agent: {e}"))?;

        if !output.status.success() {
            let err = AgentError::CliError {
                code: output.status.code(),
                stderr: output.stderr.trim().to_string(),
            };
            warn!("Agent: {err}");
            return Err(err);
        }

        let response = AgentResponse::parse(&output.stdout).inspect_err(|e| warn!("Agent: {e}"))?;
        info!(
            "Agent: completed in {}ms ({} payloads, session {})",
            output.duration.as_millis(),
            response.payloads.len(),
            request.session_key
        );
        Ok(response)
    }
}

/// Full argument list after the executable.
pub fn build_args(request: &AgentRequest) -> Result<Vec<String>, AgentError> {
    let params =
        serde_json::to_string(request).map_err(|e| AgentError::Internal(e.to_string()))?;
    let mut args: Vec<String> = SUBCOMMAND.iter().map(|s| (*s).to_string()).collect();
    args.extend([
        "--params".to_string(),
        params,
        "--expect-final".to_string(),
        "--timeout".to_string(),
        AGENT_TIMEOUT_MS.to_string(),
        "--json".to_string(),
    ]);
    Ok(args)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::locate::Candidate;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("openclaw");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn invoker(exe: PathBuf) -> AgentInvoker {
        AgentInvoker::new(
            ExecutableLocator::new("agent", vec![Candidate::Explicit(exe)]),
            "line",
        )
    }

    #[test]
    fn test_build_args_shape() {
        let req = AgentRequest::new("line", "U1", "Bob", "hello");
        let args = build_args(&req).unwrap();
        assert_eq!(&args[..4], ["gateway", "call", "agent", "--params"]);
        assert_eq!(&args[5..], ["--expect-final", "--timeout", "120000", "--json"]);
        let params: serde_json::Value = serde_json::from_str(&args[4]).unwrap();
        assert_eq!(params["sessionId"], "line:U1");
    }

    #[tokio::test]
    async fn test_invoke_echo_agent() {
        let dir = tempfile::tempdir().unwrap();
        // $5 is the --params document.
        let exe = script(
            dir.path(),
            r#"printf '{"ok":true,"result":{"payloads":[{"text":"pong"}]},"params":%s}' "$5""#,
        );
        let meta = InvokeMetadata {
            display_name: Some("Alice".into()),
        };

        let resp = invoker(exe).invoke("ping", "U42", &meta).await.unwrap();
        assert_eq!(resp.reply_text(), "pong");
        assert_eq!(resp.raw["params"]["sessionId"], "line:U42");
        assert_eq!(resp.raw["params"]["message"], "[LINE User: Alice] ping");
        assert!(resp.raw["params"]["idempotencyKey"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_invoke_default_display_name() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), r#"printf '{"params":%s}' "$5""#);
        let resp = invoker(exe)
            .invoke("hi", "U1", &InvokeMetadata::default())
            .await
            .unwrap();
        assert_eq!(resp.raw["params"]["message"], "[LINE User: User] hi");
        assert_eq!(resp.reply_text(), "");
    }

    #[tokio::test]
    async fn test_invoke_cli_error() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "echo 'gateway closed' >&2; exit 2");
        let err = invoker(exe)
            .invoke("hi", "U1", &InvokeMetadata::default())
            .await
            .unwrap_err();
        match err {
            AgentError::CliError { code, stderr } => {
                assert_eq!(code, Some(2));
                assert_eq!(stderr, "gateway closed");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invoke_invalid_output() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "echo 'not json'");
        let err = invoker(exe)
            .invoke("hi", "U1", &InvokeMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidOutput(_)));
    }

    #[tokio::test]
    async fn test_invoke_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = invoker(dir.path().join("missing"))
            .invoke("hi", "U1", &InvokeMetadata::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "executable_not_found");
    }

    #[tokio::test]
    async fn test_invoke_guard_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "exec sleep 10");
        let err = invoker(exe)
            .with_guard(Duration::from_millis(200))
            .invoke("hi", "U1", &InvokeMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_concurrent_invocations_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(
            dir.path(),
            r#"sleep 0.2; printf '{"result":{"payloads":[]},"params":%s}' "$5""#,
        );
        let inv = invoker(exe);
        let meta = InvokeMetadata::default();

        let (a, b) = tokio::join!(
            inv.invoke("one", "Ualice", &meta),
            inv.invoke("two", "Ubob", &meta)
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.raw["params"]["sessionId"], "line:Ualice");
        assert_eq!(b.raw["params"]["sessionId"], "line:Ubob");
        assert_ne!(
            a.raw["params"]["idempotencyKey"],
            b.raw["params"]["idempotencyKey"]
        );
    }
}
