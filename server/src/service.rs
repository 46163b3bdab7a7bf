//! Orchestration.
//!
//! [`Bridge`] wires the pieces together for the long-running modes:
//!
//! 1. bind the webhook relay
//! 2. locate the tunnel binary and start the supervisor on the relay's port
//! 3. reuse an existing binding, or register and print a binding link
//! 4. persist every tunnel event to the status record and forward the
//!    interesting ones to the coordination service
//! 5. heartbeat the gateway URL until shutdown
//!
//! Coordination-service failures are logged and dropped; they never reach the
//! supervisor or the relay.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::AgentInvoker;
use crate::config::Config;
use crate::coordinator::{CoordinatorClient, CoordinatorError, Registration};
use crate::locate::{ExecutableLocator, LocateError};
use crate::routes;
use crate::state::RelayState;
use crate::store::{ServiceStatus, StatusRecord, StatusStore, StoreError};
use crate::tunnel::{
    TunnelError, TunnelEvent, TunnelEvents, TunnelSettings, TunnelSnapshot, TunnelState,
    TunnelSupervisor,
};

/// Plain-text log written by the long-running modes, under the data dir.
pub const LOG_FILE: &str = "service.log";

/// How long `stop()` waits for in-flight webhook requests.
const RELAY_DRAIN: Duration = Duration::from_secs(5);

/// Log lines shown by `status`.
const STATUS_LOG_LINES: usize = 5;

pub fn log_path(config: &Config) -> PathBuf {
    config.storage.data_dir().join(LOG_FILE)
}

/// The webhook relay running on its own task.
pub struct RelayServer {
    addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<std::io::Result<()>>,
}

impl RelayServer {
    /// Bind `server.listen` and start serving.
    pub async fn bind(config: Arc<Config>) -> Result<Self, ServiceError> {
        let invoker = AgentInvoker::from_config(&config.agent);
        let listen = config.server.listen.clone();
        let webhook_path = config.server.webhook_path.clone();
        let app = routes::router(RelayState::new(config, invoker));

        let listener = TcpListener::bind(&listen)
            .await
            .map_err(|source| ServiceError::Bind {
                addr: listen.clone(),
                source,
            })?;
        let addr = listener.local_addr().map_err(ServiceError::Serve)?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
        });
        info!("Relay: listening on http://{addr}{webhook_path}");
        Ok(Self { addr, cancel, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting requests, give in-flight ones a moment, then drop them.
    pub async fn stop(self) {
        self.cancel.cancel();
        let mut task = self.task;
        match tokio::time::timeout(RELAY_DRAIN, &mut task).await {
            Ok(Ok(Ok(()))) => info!("Relay: stopped"),
            Ok(Ok(Err(e))) => error!("Relay: server error: {e}"),
            Ok(Err(e)) => error!("Relay: server task failed: {e}"),
            Err(_) => {
                warn!("Relay: in-flight requests still running, aborting");
                task.abort();
            }
        }
    }
}

/// Relay only, until `shutdown` is cancelled.
pub async fn serve(config: Arc<Config>, shutdown: CancellationToken) -> Result<(), ServiceError> {
    let relay = RelayServer::bind(config).await?;
    shutdown.cancelled().await;
    relay.stop().await;
    Ok(())
}

/// Relay + tunnel + coordination, for `connect` and `daemon`.
#[derive(Clone)]
pub struct Bridge {
    config: Arc<Config>,
    store: Arc<StatusStore>,
    coordinator: Arc<CoordinatorClient>,
}

impl Bridge {
    pub fn new(config: Arc<Config>) -> Result<Self, ServiceError> {
        let store = StatusStore::new(&config.storage.data_dir());
        let coordinator = CoordinatorClient::new(&config.coordinator)?;
        Ok(Self {
            config,
            store: Arc::new(store),
            coordinator: Arc::new(coordinator),
        })
    }

    pub fn store(&self) -> &StatusStore {
        &self.store
    }

    /// Run until `shutdown` is cancelled, then stop everything and record it.
    /// Cancellation is honoured during startup too.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ServiceError> {
        println!("[1/3] Starting webhook relay...");
        let relay = RelayServer::bind(Arc::clone(&self.config)).await?;
        println!("      Relay running on http://{}", relay.local_addr());

        let result = self.run_tunnel(relay.local_addr().port(), &shutdown).await;

        relay.stop().await;
        let stopped = self
            .store
            .update(|r| {
                r.status = Some(ServiceStatus::Stopped);
                r.stopped_at = Some(Utc::now());
            })
            .await;
        if let Err(e) = stopped {
            warn!("Bridge: failed to record shutdown: {e}");
        }
        println!("All services stopped");
        result
    }

    async fn run_tunnel(
        &self,
        local_port: u16,
        shutdown: &CancellationToken,
    ) -> Result<(), ServiceError> {
        println!("[2/3] Opening public endpoint...");
        let binary = ExecutableLocator::for_tunnel(&self.config.tunnel).resolve()?;
        let mut supervisor =
            TunnelSupervisor::new(TunnelSettings::from_config(&self.config.tunnel, binary))?;

        // Read before the Connected handler overwrites the stored URL.
        let previous = self.load_record().await;

        let snapshots = supervisor.subscribe_snapshot();
        let events = tokio::spawn(self.clone().event_loop(
            supervisor.subscribe(),
            snapshots.clone(),
            local_port,
        ));

        let started = tokio::select! {
            result = supervisor.start(local_port) => Some(result),
            () = shutdown.cancelled() => None,
        };
        let url = match started {
            Some(Ok(url)) => url,
            Some(Err(e)) => {
                events.abort();
                return Err(e.into());
            }
            None => {
                info!("Bridge: shutdown requested while the tunnel was starting");
                supervisor.stop().await;
                events.abort();
                return Ok(());
            }
        };
        println!("      Connected");

        println!("[3/3] Checking binding status...");
        let bound = tokio::select! {
            bound = self.bind_endpoint(previous.as_ref(), &url) => Some(bound),
            () = shutdown.cancelled() => None,
        };
        match bound {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                error!("Bridge: registration failed: {e}");
                supervisor.stop().await;
                events.abort();
                return Err(e.into());
            }
            None => {
                info!("Bridge: shutdown requested during registration");
                supervisor.stop().await;
                events.abort();
                return Ok(());
            }
        }

        println!("{}", "-".repeat(50));
        println!("Service running (Ctrl+C to stop)");
        println!("{}", "-".repeat(50));

        let period = Duration::from_secs(self.config.coordinator.heartbeat_interval_secs);
        let heartbeat = tokio::spawn(self.clone().heartbeat_loop(snapshots, period));

        shutdown.cancelled().await;
        info!("Bridge: shutting down");

        heartbeat.abort();
        supervisor.stop().await;
        drop(supervisor);
        // Closed once the supervisor is gone; pending events are still handled.
        if tokio::time::timeout(Duration::from_secs(2), events)
            .await
            .is_err()
        {
            warn!("Bridge: event handler did not finish");
        }
        Ok(())
    }

    /// Reuse the stored binding when possible, otherwise register and print
    /// the binding link.
    async fn bind_endpoint(
        &self,
        previous: Option<&StatusRecord>,
        url: &str,
    ) -> Result<(), CoordinatorError> {
        if self.check_existing_binding(previous, url).await {
            println!("      Reconnected to existing binding");
        } else {
            print_registration(&self.register_new(url).await?);
        }
        Ok(())
    }

    async fn event_loop(
        self,
        mut events: TunnelEvents,
        snapshots: watch::Receiver<TunnelSnapshot>,
        local_port: u16,
    ) {
        while let Some(event) = events.recv().await {
            let snapshot = snapshots.borrow().clone();
            self.handle_event(&event, &snapshot, local_port).await;
        }
    }

    /// Persist one tunnel event and kick off the matching coordinator call.
    pub async fn handle_event(
        &self,
        event: &TunnelEvent,
        snapshot: &TunnelSnapshot,
        local_port: u16,
    ) {
        let now = Utc::now();
        let result = match event {
            TunnelEvent::Connected { url } => {
                info!("Bridge: connected to cloud");
                self.store
                    .update(|r| {
                        r.tunnel_url = Some(url.clone());
                        r.local_port = Some(local_port);
                        r.connected_at = Some(now);
                        r.status = Some(ServiceStatus::Connected);
                    })
                    .await
            }
            TunnelEvent::Disconnected { reason } => {
                warn!("Bridge: tunnel disconnected: {reason}");
                let result = self
                    .store
                    .update(|r| {
                        r.status = Some(ServiceStatus::Disconnected);
                        r.last_disconnect = Some(now);
                    })
                    .await;
                if let Ok(StatusRecord {
                    tunnel_url: Some(old),
                    ..
                }) = &result
                {
                    self.spawn_notify_offline(old.clone());
                }
                result
            }
            TunnelEvent::Reconnected { url, attempt } => {
                let count = snapshot.stats.reconnect_count;
                let result = self
                    .store
                    .update(|r| {
                        r.tunnel_url = Some(url.clone());
                        r.connected_at = Some(now);
                        r.status = Some(ServiceStatus::Connected);
                        r.reconnect_count = Some(count);
                    })
                    .await;
                let gateway_id = result.as_ref().ok().and_then(|r| r.gateway_id.clone());
                info!(
                    "Bridge: reconnected (attempt {attempt}), gateway {}",
                    gateway_id.as_deref().unwrap_or("unknown")
                );
                if let Some(gateway_id) = gateway_id {
                    self.spawn_gateway_update(gateway_id, url.clone());
                }
                result
            }
            TunnelEvent::Error { message } => {
                error!("Bridge: tunnel error: {message}");
                self.store
                    .update(|r| {
                        r.last_error = Some(message.clone());
                        r.error_at = Some(now);
                    })
                    .await
            }
            TunnelEvent::Failed { attempts } => {
                error!(
                    "Bridge: tunnel gave up after {attempts} reconnect attempts; restart required"
                );
                self.store
                    .update(|r| {
                        r.status = Some(ServiceStatus::Failed);
                        r.error_at = Some(now);
                        if let Some(e) = &snapshot.stats.last_error {
                            r.last_error = Some(e.clone());
                        }
                    })
                    .await
            }
        };
        if let Err(e) = result {
            warn!("Bridge: failed to persist status: {e}");
        }
    }

    fn spawn_notify_offline(&self, tunnel_url: String) -> JoinHandle<()> {
        let coordinator = Arc::clone(&self.coordinator);
        tokio::spawn(async move {
            match coordinator.notify_offline(&tunnel_url).await {
                Ok(()) => info!("Bridge: notified users about offline status"),
                Err(e) => warn!("Bridge: failed to notify users: {e}"),
            }
        })
    }

    fn spawn_gateway_update(&self, gateway_id: String, tunnel_url: String) -> JoinHandle<()> {
        let coordinator = Arc::clone(&self.coordinator);
        tokio::spawn(async move {
            match coordinator.update_gateway(&gateway_id, &tunnel_url).await {
                Ok(()) => debug!("Bridge: updated gateway {gateway_id}"),
                Err(e) => warn!("Bridge: failed to update gateway: {e}"),
            }
        })
    }

    /// Whether a binding from an earlier run can be carried over to `url`.
    ///
    /// With a stored gateway id the gateway is simply pointed at the new URL.
    /// Without one, users bound to the old URL (if any) are moved over after
    /// registering for a gateway id.
    pub async fn check_existing_binding(
        &self,
        previous: Option<&StatusRecord>,
        url: &str,
    ) -> bool {
        let Some(previous) = previous else {
            return false;
        };
        let Some(old_url) = previous.tunnel_url.as_deref() else {
            return false;
        };

        if let Some(gateway_id) = previous.gateway_id.as_deref() {
            if old_url != url {
                match self.coordinator.update_gateway(gateway_id, url).await {
                    Ok(()) => info!("Bridge: gateway {gateway_id} moved to new endpoint"),
                    Err(e) => warn!("Bridge: failed to update gateway: {e}"),
                }
            }
            println!("      Gateway: {gateway_id}");
            return true;
        }

        let users = match self.coordinator.tunnel_users(old_url).await {
            Ok(users) => users,
            Err(e) => {
                warn!("Bridge: failed to check existing binding: {e}");
                return false;
            }
        };
        if users.is_empty() {
            return false;
        }

        println!("      Found {} existing binding(s), upgrading to a gateway", users.len());
        match self.coordinator.register(url).await {
            Ok(Registration {
                gateway_id: Some(gateway_id),
                ..
            }) => {
                let saved = self
                    .store
                    .update(|r| {
                        r.gateway_id = Some(gateway_id.clone());
                        r.tunnel_url = Some(url.to_string());
                    })
                    .await;
                if let Err(e) = saved {
                    warn!("Bridge: failed to persist gateway id: {e}");
                }
                println!("      Gateway: {gateway_id}");
            }
            Ok(_) => warn!("Bridge: registration returned no gateway id"),
            Err(e) => warn!("Bridge: registration failed: {e}"),
        }
        if let Err(e) = self.coordinator.update_tunnel(old_url, url).await {
            warn!("Bridge: failed to move bindings to new endpoint: {e}");
        }
        true
    }

    /// Register `url` as a new gateway and remember its id.
    pub async fn register_new(&self, url: &str) -> Result<Registration, CoordinatorError> {
        let registration = self.coordinator.register(url).await?;
        let gateway_id = registration
            .gateway_id
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        if let Err(e) = self
            .store
            .update(|r| r.gateway_id = Some(gateway_id.clone()))
            .await
        {
            warn!("Bridge: failed to persist gateway id: {e}");
        }
        info!("Bridge: registered as gateway {gateway_id}");
        Ok(registration)
    }

    async fn heartbeat_loop(self, snapshots: watch::Receiver<TunnelSnapshot>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let snapshot = snapshots.borrow().clone();
            self.heartbeat(&snapshot).await;
        }
    }

    /// Re-announce the current endpoint so the gateway stays marked online.
    /// Returns whether an update was sent successfully.
    pub async fn heartbeat(&self, snapshot: &TunnelSnapshot) -> bool {
        if snapshot.state != TunnelState::Connected {
            return false;
        }
        let Some(url) = snapshot.public_endpoint.as_deref() else {
            return false;
        };
        if snapshot.stats.reconnect_count > 0 {
            info!(
                "Bridge: health check: up {} min, {} reconnects",
                snapshot.stats.uptime_secs / 60,
                snapshot.stats.reconnect_count
            );
        }
        let Some(gateway_id) = self.load_record().await.and_then(|r| r.gateway_id) else {
            return false;
        };
        match self.coordinator.update_gateway(&gateway_id, url).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Bridge: heartbeat failed: {e}");
                false
            }
        }
    }

    /// Human-readable report for the `status` subcommand.
    pub async fn status_report(&self) -> Vec<String> {
        let Some(record) = self.load_record().await else {
            return vec!["Not configured. Run: line-bridge connect".to_string()];
        };
        let mut lines = vec![
            format!(
                "Gateway: {}",
                record.gateway_id.as_deref().unwrap_or("N/A")
            ),
            format!(
                "Status: {}",
                record.status.map_or("unknown", ServiceStatus::as_str)
            ),
        ];
        if let Some(at) = record.connected_at {
            lines.push(format!("Connected at: {}", at.to_rfc3339()));
        }
        if let Some(n) = record.reconnect_count.filter(|n| *n > 0) {
            lines.push(format!("Reconnect count: {n}"));
        }
        if let Some(e) = &record.last_error {
            lines.push(format!("Last error: {e}"));
        }

        if let Some(gateway_id) = record.gateway_id.as_deref() {
            lines.push(match self.coordinator.gateway_online(gateway_id).await {
                Ok(true) => "Cloud status: online".to_string(),
                Ok(false) => "Cloud status: offline".to_string(),
                Err(CoordinatorError::Request(_)) => "Cloud status: unreachable".to_string(),
                Err(_) => "Cloud status: unknown".to_string(),
            });
        }

        if let Some(url) = record.tunnel_url.as_deref() {
            lines.push(self.reachability(url, record.local_port).await);
        }

        if let Some(gateway_id) = record.gateway_id.as_deref() {
            match self.coordinator.gateway_users(gateway_id).await {
                Ok(users) => {
                    lines.push(format!("Bound users: {}", users.len()));
                    if users.is_empty() {
                        lines.push("  (open the binding link to bind an account)".to_string());
                    }
                    for user in users {
                        lines.push(format!(
                            "  [{}] {}",
                            if user.is_active { "active" } else { "inactive" },
                            user.display_name.as_deref().unwrap_or("Unknown")
                        ));
                    }
                }
                Err(_) => lines.push("Bound users: unknown".to_string()),
            }
        }

        if let Ok(log) = tail_lines(&log_path(&self.config), STATUS_LOG_LINES).await {
            let suffix = &self.config.tunnel.endpoint_suffix;
            let recent: Vec<String> = log
                .into_iter()
                .filter(|line| !line.contains(suffix.as_str()))
                .map(|line| format!("  {line}"))
                .collect();
            if !recent.is_empty() {
                lines.push("Recent logs:".to_string());
                lines.extend(recent);
            }
        }
        lines
    }

    /// Probe the relay through its public endpoint, falling back to localhost.
    async fn reachability(&self, tunnel_url: &str, local_port: Option<u16>) -> String {
        match self
            .coordinator
            .probe_health(tunnel_url, Duration::from_secs(5))
            .await
        {
            Ok(body) => {
                let state = if let Some(gateway) = body["gateway"].as_str() {
                    gateway.to_string()
                } else if body["status"] == "ok" {
                    "connected".to_string()
                } else {
                    "unknown".to_string()
                };
                format!("Agent gateway: {state}")
            }
            Err(CoordinatorError::Service { status, .. }) => {
                format!("Agent gateway: error (HTTP {status})")
            }
            Err(_) => {
                let port = local_port.or_else(|| {
                    self.config
                        .server
                        .listen
                        .parse::<SocketAddr>()
                        .ok()
                        .map(|a| a.port())
                });
                let Some(port) = port else {
                    return "Agent gateway: unreachable".to_string();
                };
                let local = format!("http://127.0.0.1:{port}");
                match self
                    .coordinator
                    .probe_health(&local, Duration::from_secs(2))
                    .await
                {
                    Ok(_) => "Agent gateway: connected (via localhost)".to_string(),
                    Err(_) => "Agent gateway: unreachable".to_string(),
                }
            }
        }
    }

    /// Forget the local binding. The coordination service keeps its side.
    pub async fn disconnect(&self) -> Result<bool, StoreError> {
        self.store.clear().await
    }

    async fn load_record(&self) -> Option<StatusRecord> {
        match self.store.load().await {
            Ok(record) => record,
            Err(e) => {
                warn!("Bridge: ignoring unreadable status record: {e}");
                None
            }
        }
    }
}

fn print_registration(registration: &Registration) {
    println!(
        "      Gateway: {}",
        registration.gateway_id.as_deref().unwrap_or("unknown")
    );
    println!();
    println!("Open this link to complete binding:");
    println!("  {}", registration.deep_link);
    if let Some(secs) = registration.expires_in {
        println!("Link expires in {secs} seconds");
    }
    println!();
}

/// Last `n` lines of a text file.
pub async fn tail_lines(path: &Path, n: usize) -> std::io::Result<Vec<String>> {
    let content = tokio::fs::read_to_string(path).await?;
    let lines: Vec<&str> = content.trim_end().lines().collect();
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].iter().map(|l| (*l).to_string()).collect())
}

#[derive(Debug)]
pub enum ServiceError {
    Bind { addr: String, source: std::io::Error },
    Serve(std::io::Error),
    Locate(LocateError),
    Tunnel(TunnelError),
    Coordinator(CoordinatorError),
    Store(StoreError),
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind { addr, source } => write!(f, "failed to bind {addr}: {source}"),
            Self::Serve(e) => write!(f, "relay server error: {e}"),
            Self::Locate(e) => write!(f, "{e}"),
            Self::Tunnel(e) => write!(f, "{e}"),
            Self::Coordinator(e) => write!(f, "{e}"),
            Self::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<LocateError> for ServiceError {
    fn from(e: LocateError) -> Self {
        Self::Locate(e)
    }
}

impl From<TunnelError> for ServiceError {
    fn from(e: TunnelError) -> Self {
        Self::Tunnel(e)
    }
}

impl From<CoordinatorError> for ServiceError {
    fn from(e: CoordinatorError) -> Self {
        Self::Coordinator(e)
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}
