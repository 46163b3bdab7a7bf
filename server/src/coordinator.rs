//! HTTP client for the remote coordination service.
//!
//! The coordination service maps chat users to gateways. The bridge uses it
//! to register a freshly acquired public endpoint, keep the gateway's URL
//! current after reconnects, announce when it goes offline, and read back
//! binding state for the `status` subcommand.
//!
//! ## Error handling
//!
//! Non-2xx responses are parsed for an `error` field in the JSON body. If
//! parsing fails, the raw response body is returned as the error message.

use std::fmt::Write;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::CoordinatorConfig;

/// Response to `POST /register`.
#[derive(Debug, Clone, Deserialize)]
pub struct Registration {
    pub token: String,
    #[serde(default)]
    pub gateway_id: Option<String>,
    pub deep_link: String,
    /// Seconds until `token` can no longer be used to bind.
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// A chat user bound to a gateway or tunnel.
#[derive(Debug, Clone, Deserialize)]
pub struct BoundUser {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub is_active: bool,
}

#[derive(Debug, Deserialize)]
struct UserList {
    #[serde(default)]
    users: Vec<BoundUser>,
}

#[derive(Debug, Deserialize)]
struct GatewayInfo {
    #[serde(default)]
    is_online: bool,
}

pub struct CoordinatorClient {
    http: reqwest::Client,
    base_url: String,
}

impl CoordinatorClient {
    pub fn new(config: &CoordinatorConfig) -> Result<Self, CoordinatorError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let http = reqwest::Client::builder()
            .user_agent(concat!("line-bridge/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(CoordinatorError::Request)?;
        // Strip trailing slash for consistent URL construction
        let base_url = config.base_url.trim_end_matches('/').to_string();
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `POST /register` — announce a new endpoint and get a binding token.
    pub async fn register(&self, tunnel_url: &str) -> Result<Registration, CoordinatorError> {
        self.post("/register", &json!({ "tunnel_domain": tunnel_url }))
            .await
    }

    /// `POST /gateway/update` — point an existing gateway at a new endpoint.
    /// Also serves as the heartbeat that keeps the gateway marked online.
    pub async fn update_gateway(
        &self,
        gateway_id: &str,
        tunnel_url: &str,
    ) -> Result<(), CoordinatorError> {
        self.post::<Value>(
            "/gateway/update",
            &json!({ "gateway_id": gateway_id, "tunnel_url": tunnel_url }),
        )
        .await
        .map(drop)
    }

    /// `POST /notify-offline` — tell users bound to `tunnel_url` it went away.
    pub async fn notify_offline(&self, tunnel_url: &str) -> Result<(), CoordinatorError> {
        self.post::<Value>("/notify-offline", &json!({ "tunnel_domain": tunnel_url }))
            .await
            .map(drop)
    }

    /// `POST /update-tunnel` — move bindings from `old_tunnel` to `new_tunnel`.
    pub async fn update_tunnel(
        &self,
        old_tunnel: &str,
        new_tunnel: &str,
    ) -> Result<(), CoordinatorError> {
        self.post::<Value>(
            "/update-tunnel",
            &json!({ "old_tunnel": old_tunnel, "new_tunnel": new_tunnel }),
        )
        .await
        .map(drop)
    }

    /// `GET /status/<encoded tunnel url>` — users bound to a tunnel URL.
    pub async fn tunnel_users(&self, tunnel_url: &str) -> Result<Vec<BoundUser>, CoordinatorError> {
        let list: UserList = self
            .get(&format!("/status/{}", encode_component(tunnel_url)))
            .await?;
        Ok(list.users)
    }

    /// `GET /gateway/<id>` — whether the service currently sees the gateway.
    pub async fn gateway_online(&self, gateway_id: &str) -> Result<bool, CoordinatorError> {
        let info: GatewayInfo = self
            .get(&format!("/gateway/{}", encode_component(gateway_id)))
            .await?;
        Ok(info.is_online)
    }

    /// `GET /gateway/<id>/users` — users bound to a gateway.
    pub async fn gateway_users(&self, gateway_id: &str) -> Result<Vec<BoundUser>, CoordinatorError> {
        let list: UserList = self
            .get(&format!("/gateway/{}/users", encode_component(gateway_id)))
            .await?;
        Ok(list.users)
    }

    /// `GET <base>/health` on an arbitrary host (the relay, directly or
    /// through its public endpoint).
    pub async fn probe_health(
        &self,
        base: &str,
        timeout: Duration,
    ) -> Result<Value, CoordinatorError> {
        let resp = self
            .http
            .get(format!("{}/health", base.trim_end_matches('/')))
            .timeout(timeout)
            .send()
            .await
            .map_err(CoordinatorError::Request)?;
        Self::handle_response(resp).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, CoordinatorError> {
        let resp = self
            .http
            .get(format!("{}{path}", self.base_url))
            .send()
            .await
            .map_err(CoordinatorError::Request)?;
        Self::decode(Self::handle_response(resp).await?)
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<T, CoordinatorError> {
        let resp = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await
            .map_err(CoordinatorError::Request)?;
        Self::decode(Self::handle_response(resp).await?)
    }

    fn decode<T: DeserializeOwned>(value: Value) -> Result<T, CoordinatorError> {
        serde_json::from_value(value)
            .map_err(|e| CoordinatorError::Protocol(format!("unexpected response shape: {e}")))
    }

    async fn handle_response(resp: reqwest::Response) -> Result<Value, CoordinatorError> {
        let status = resp.status();
        let body = resp.text().await.map_err(CoordinatorError::Request)?;

        if status.is_success() {
            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            serde_json::from_str(&body)
                .map_err(|e| CoordinatorError::Protocol(format!("invalid JSON: {e}")))
        } else {
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v["error"].as_str().map(String::from))
                .unwrap_or(body);
            Err(CoordinatorError::Service {
                status: status.as_u16(),
                message,
            })
        }
    }
}

/// Percent-encode everything outside the URL "unreserved" set.
fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len() * 3);
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(char::from(b));
        } else {
            let _ = write!(out, "%{b:02X}");
        }
    }
    out
}

#[derive(Debug)]
pub enum CoordinatorError {
    /// HTTP transport error (connection refused, timeout, DNS failure, etc.).
    Request(reqwest::Error),
    /// The service returned a non-2xx HTTP status.
    Service { status: u16, message: String },
    /// The response body was not what the endpoint promises.
    Protocol(String),
}

impl CoordinatorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Service { status: 404, .. })
    }
}

impl std::fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Request(e) => write!(f, "HTTP request failed: {e}"),
            Self::Service { status, message } => {
                write!(f, "coordinator error (HTTP {status}): {message}")
            }
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for CoordinatorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Request(e) => Some(e),
            _ => None,
        }
    }
}
