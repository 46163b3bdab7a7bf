//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `LINE_BRIDGE_LISTEN`, `LINE_BRIDGE_AGENT`,
//!    `LINE_BRIDGE_TUNNEL_BINARY`, `LINE_BRIDGE_COORDINATOR_URL`,
//!    `LINE_BRIDGE_DATA_DIR`
//! 2. **Config file** — path via `--config <path>`, or `line-bridge.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:8787"
//! webhook_path = "/line/webhook"
//!
//! [agent]
//! executable = "/opt/agent/bin/openclaw"   # optional, tried before candidates
//! candidates = ["clawdbot", "openclaw", "moltbot"]
//! session_prefix = "line"
//!
//! [tunnel]
//! binary = "/usr/local/bin/cloudflared"    # optional
//! endpoint_suffix = "trycloudflare.com"
//! max_retries = 10
//! retry_delay_secs = 5
//! startup_timeout_secs = 30
//! poll_interval_secs = 5
//! terminate_grace_secs = 5
//!
//! [coordinator]
//! base_url = "https://moltbot-line.nocory.ai/api/client"
//! timeout_secs = 10
//! heartbeat_interval_secs = 60
//!
//! [storage]
//! data_dir = "~/.moltbot/line"
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::util::expand_tilde;

/// Config file looked up in the current directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "line-bridge.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local webhook relay settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `127.0.0.1:8787`). The tunnel forwards here.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Path of the webhook ingestion endpoint (default `/line/webhook`).
    #[serde(default = "default_webhook_path")]
    pub webhook_path: String,
}

/// Agent CLI discovery and session naming.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Explicit path to the agent executable. Checked before `candidates`.
    pub executable: Option<String>,
    /// Binary names searched on `PATH` and in well-known install directories.
    #[serde(default = "default_agent_candidates")]
    pub candidates: Vec<String>,
    /// Namespace prepended to user ids to form agent session keys.
    #[serde(default = "default_session_prefix")]
    pub session_prefix: String,
}

/// Tunnel binary and supervision policy.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Explicit path to the tunnel binary. Checked before the `PATH` search.
    pub binary: Option<String>,
    /// Domain suffix of the ephemeral hostnames the tunnel binary prints.
    #[serde(default = "default_endpoint_suffix")]
    pub endpoint_suffix: String,
    /// Reconnect attempts per disconnect before giving up (default 10).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds to wait before each reconnect attempt (default 5).
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    /// Seconds to wait for the public endpoint to appear (default 30).
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    /// Seconds between liveness checks of the tunnel process (default 5).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Seconds between SIGTERM and SIGKILL when stopping the process (default 5).
    #[serde(default = "default_terminate_grace")]
    pub terminate_grace_secs: u64,
}

/// Remote coordination service (binding, gateway registry, offline notices).
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    /// Base URL of the client API, without trailing slash.
    #[serde(default = "default_coordinator_url")]
    pub base_url: String,
    /// Total request timeout in seconds (default 10).
    #[serde(default = "default_coordinator_timeout")]
    pub timeout_secs: u64,
    /// Seconds between gateway heartbeats while connected (default 60).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

/// Where the status record and service log live.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Data directory (default `~/.moltbot/line`). `~` is expanded.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "127.0.0.1:8787".to_string()
}
fn default_webhook_path() -> String {
    "/line/webhook".to_string()
}
fn default_agent_candidates() -> Vec<String> {
    ["clawdbot", "openclaw", "moltbot"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}
fn default_session_prefix() -> String {
    "line".to_string()
}
fn default_endpoint_suffix() -> String {
    "trycloudflare.com".to_string()
}
fn default_max_retries() -> u32 {
    10
}
fn default_retry_delay() -> u64 {
    5
}
fn default_startup_timeout() -> u64 {
    30
}
fn default_poll_interval() -> u64 {
    5
}
fn default_terminate_grace() -> u64 {
    5
}
fn default_coordinator_url() -> String {
    "https://moltbot-line.nocory.ai/api/client".to_string()
}
fn default_coordinator_timeout() -> u64 {
    10
}
fn default_heartbeat_interval() -> u64 {
    60
}
fn default_data_dir() -> String {
    "~/.moltbot/line".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            webhook_path: default_webhook_path(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            executable: None,
            candidates: default_agent_candidates(),
            session_prefix: default_session_prefix(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            binary: None,
            endpoint_suffix: default_endpoint_suffix(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
            startup_timeout_secs: default_startup_timeout(),
            poll_interval_secs: default_poll_interval(),
            terminate_grace_secs: default_terminate_grace(),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            base_url: default_coordinator_url(),
            timeout_secs: default_coordinator_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl StorageConfig {
    /// Data directory with `~` expanded.
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(expand_tilde(&self.data_dir).as_ref())
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist and parse. Otherwise
    /// `line-bridge.toml` in the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, String> {
        let mut config = if let Some(p) = path {
            Self::from_file(Path::new(expand_tilde(p).as_ref()))?
        } else if Path::new(DEFAULT_CONFIG_FILE).exists() {
            Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
        } else {
            Config::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;
        toml::from_str(&content)
            .map_err(|e| format!("Failed to parse config file {}: {e}", path.display()))
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = var("LINE_BRIDGE_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(agent) = var("LINE_BRIDGE_AGENT") {
            self.agent.executable = Some(agent);
        }
        if let Some(binary) = var("LINE_BRIDGE_TUNNEL_BINARY") {
            self.tunnel.binary = Some(binary);
        }
        if let Some(url) = var("LINE_BRIDGE_COORDINATOR_URL") {
            self.coordinator.base_url = url;
        }
        if let Some(dir) = var("LINE_BRIDGE_DATA_DIR") {
            self.storage.data_dir = dir;
        }
    }

    fn validate(&self) -> Result<(), String> {
        if !self.server.webhook_path.starts_with('/') {
            return Err(format!(
                "server.webhook_path must start with '/': {}",
                self.server.webhook_path
            ));
        }
        if self.tunnel.max_retries == 0 {
            return Err("tunnel.max_retries must be at least 1".to_string());
        }
        if self.tunnel.poll_interval_secs == 0 {
            return Err("tunnel.poll_interval_secs must be at least 1".to_string());
        }
        if self.coordinator.heartbeat_interval_secs == 0 {
            return Err("coordinator.heartbeat_interval_secs must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen, "127.0.0.1:8787");
        assert_eq!(config.server.webhook_path, "/line/webhook");
        assert_eq!(config.agent.candidates, ["clawdbot", "openclaw", "moltbot"]);
        assert_eq!(config.tunnel.max_retries, 10);
        assert_eq!(config.tunnel.retry_delay_secs, 5);
        assert_eq!(config.tunnel.startup_timeout_secs, 30);
        assert_eq!(config.tunnel.poll_interval_secs, 5);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [tunnel]
            max_retries = 3

            [agent]
            executable = "/opt/agent"
            "#,
        )
        .unwrap();
        assert_eq!(config.tunnel.max_retries, 3);
        assert_eq!(config.tunnel.endpoint_suffix, "trycloudflare.com");
        assert_eq!(config.agent.executable.as_deref(), Some("/opt/agent"));
        assert_eq!(config.agent.session_prefix, "line");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(|key| match key {
            "LINE_BRIDGE_LISTEN" => Some("127.0.0.1:9000".to_string()),
            "LINE_BRIDGE_TUNNEL_BINARY" => Some("/tmp/cloudflared".to_string()),
            _ => None,
        });
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.tunnel.binary.as_deref(), Some("/tmp/cloudflared"));
        assert_eq!(config.coordinator.base_url, default_coordinator_url());
    }

    #[test]
    fn test_validate_rejects_zero_retries() {
        let mut config = Config::default();
        config.tunnel.max_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_relative_webhook_path() {
        let mut config = Config::default();
        config.server.webhook_path = "line/webhook".to_string();
        assert!(config.validate().unwrap_err().contains("webhook_path"));
    }
}
