//! Tunnel process supervision.
//!
//! [`TunnelSupervisor`] owns at most one tunnel process at a time. `start()`
//! acquires the first endpoint, then a monitor task polls the child every
//! `poll_interval`. When the child dies the monitor runs a bounded series of
//! reconnect attempts; if all of them fail the supervisor parks in
//! [`TunnelState::Failed`] and stays there until it is stopped and started
//! again.
//!
//! State is published two ways: a [`watch`] channel carrying the latest
//! [`TunnelSnapshot`], and [`TunnelEvent`]s for each transition.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::endpoint::{acquire, EndpointMatcher, TunnelLaunch, TunnelProcess};
use super::events::{EventNotifier, TunnelEvent, TunnelEvents};
use super::reconnect::ReconnectPolicy;
use super::TunnelError;
use crate::config::TunnelConfig;
use crate::process::terminate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl TunnelState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TunnelStats {
    /// Start of the current connection, `None` while not connected.
    pub connected_at: Option<DateTime<Utc>>,
    pub disconnect_count: u64,
    pub reconnect_count: u64,
    /// Age of the current connection as of the last liveness check.
    pub uptime_secs: u64,
    pub last_error: Option<String>,
}

/// Point-in-time view of the supervisor.
///
/// `public_endpoint` and `pid` are set exactly when `state` is `Connected`.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelSnapshot {
    pub state: TunnelState,
    pub public_endpoint: Option<String>,
    pub pid: Option<u32>,
    /// Current reconnect attempt, 0 when not reconnecting.
    pub retry_count: u32,
    pub stats: TunnelStats,
}

impl Default for TunnelSnapshot {
    fn default() -> Self {
        Self {
            state: TunnelState::Disconnected,
            public_endpoint: None,
            pid: None,
            retry_count: 0,
            stats: TunnelStats::default(),
        }
    }
}

impl TunnelSnapshot {
    fn connected(&mut self, url: String, pid: Option<u32>) {
        self.state = TunnelState::Connected;
        self.public_endpoint = Some(url);
        self.pid = pid;
        self.retry_count = 0;
        self.stats.connected_at = Some(Utc::now());
        self.stats.uptime_secs = 0;
    }

    fn lost(&mut self, state: TunnelState) {
        self.state = state;
        self.public_endpoint = None;
        self.pid = None;
        self.stats.connected_at = None;
        self.stats.uptime_secs = 0;
    }
}

/// Resolved tunnel settings: a located binary plus the policy from config.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub binary: PathBuf,
    pub endpoint_suffix: String,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    pub terminate_grace: Duration,
}

impl TunnelSettings {
    #[must_use]
    pub fn from_config(config: &TunnelConfig, binary: PathBuf) -> Self {
        Self {
            binary,
            endpoint_suffix: config.endpoint_suffix.clone(),
            max_retries: config.max_retries,
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            startup_timeout: Duration::from_secs(config.startup_timeout_secs),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            terminate_grace: Duration::from_secs(config.terminate_grace_secs),
        }
    }
}

pub struct TunnelSupervisor {
    settings: TunnelSettings,
    matcher: EndpointMatcher,
    notifier: EventNotifier,
    snapshot: Arc<watch::Sender<TunnelSnapshot>>,
    cancel: CancellationToken,
    monitor: Option<JoinHandle<()>>,
}

impl TunnelSupervisor {
    pub fn new(settings: TunnelSettings) -> Result<Self, TunnelError> {
        let matcher = EndpointMatcher::new(&settings.endpoint_suffix)?;
        let (snapshot, _) = watch::channel(TunnelSnapshot::default());
        Ok(Self {
            settings,
            matcher,
            notifier: EventNotifier::new(),
            snapshot: Arc::new(snapshot),
            cancel: CancellationToken::new(),
            monitor: None,
        })
    }

    /// Launch the tunnel for `local_port` and return its public endpoint.
    ///
    /// Fails with [`TunnelError::AlreadyRunning`] while a previous start is
    /// still being supervised; call [`stop`](Self::stop) first.
    pub async fn start(&mut self, local_port: u16) -> Result<String, TunnelError> {
        if self.is_monitoring() {
            return Err(TunnelError::AlreadyRunning);
        }
        self.monitor = None;
        self.cancel = CancellationToken::new();

        let launch = TunnelLaunch {
            binary: self.settings.binary.clone(),
            local_port,
            matcher: self.matcher.clone(),
            startup_timeout: self.settings.startup_timeout,
            terminate_grace: self.settings.terminate_grace,
        };
        info!(
            "Tunnel: starting {} for 127.0.0.1:{local_port}",
            launch.binary.display()
        );
        self.snapshot.send_replace(TunnelSnapshot {
            state: TunnelState::Connecting,
            ..TunnelSnapshot::default()
        });

        let process = match acquire(&launch).await {
            Ok(process) => process,
            Err(e) => {
                error!("Tunnel: failed to start: {e}");
                let message = e.to_string();
                self.snapshot.send_modify(|s| {
                    s.lost(TunnelState::Disconnected);
                    s.stats.last_error = Some(message);
                });
                return Err(e);
            }
        };

        let url = process.url.clone();
        self.snapshot
            .send_modify(|s| s.connected(url.clone(), process.pid()));
        self.notifier
            .emit(TunnelEvent::Connected { url: url.clone() });

        let monitor = Monitor {
            launch,
            policy: ReconnectPolicy::new(self.settings.max_retries, self.settings.retry_delay),
            poll_interval: self.settings.poll_interval,
            snapshot: Arc::clone(&self.snapshot),
            notifier: self.notifier.clone(),
            cancel: self.cancel.clone(),
            connected_since: Instant::now(),
        };
        self.monitor = Some(tokio::spawn(monitor.run(process)));
        Ok(url)
    }

    /// Stop supervision and the tunnel process. Safe to call in any state,
    /// any number of times.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(monitor) = self.monitor.take() {
            if let Err(e) = monitor.await {
                warn!("Tunnel: monitor task ended abnormally: {e}");
            }
            info!("Tunnel: stopped");
        }
        self.snapshot.send_modify(|s| {
            s.lost(TunnelState::Disconnected);
            s.retry_count = 0;
        });
    }

    #[must_use]
    pub fn snapshot(&self) -> TunnelSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that always holds the latest snapshot.
    #[must_use]
    pub fn subscribe_snapshot(&self) -> watch::Receiver<TunnelSnapshot> {
        self.snapshot.subscribe()
    }

    /// Events emitted after this call.
    #[must_use]
    pub fn subscribe(&self) -> TunnelEvents {
        self.notifier.subscribe()
    }

    #[must_use]
    pub fn public_endpoint(&self) -> Option<String> {
        self.snapshot.borrow().public_endpoint.clone()
    }

    /// Whether a monitor task is still alive (connected or reconnecting).
    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.monitor.as_ref().is_some_and(|m| !m.is_finished())
    }
}

impl Drop for TunnelSupervisor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Background task owning the live tunnel process.
struct Monitor {
    launch: TunnelLaunch,
    policy: ReconnectPolicy,
    poll_interval: Duration,
    snapshot: Arc<watch::Sender<TunnelSnapshot>>,
    notifier: EventNotifier,
    cancel: CancellationToken,
    connected_since: Instant,
}

impl Monitor {
    async fn run(mut self, mut process: TunnelProcess) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match process.child.try_wait() {
                Ok(None) => {
                    let uptime = self.connected_since.elapsed().as_secs();
                    self.snapshot.send_modify(|s| s.stats.uptime_secs = uptime);
                }
                Ok(Some(status)) => {
                    let reason = TunnelError::ProcessExit(status.to_string()).to_string();
                    warn!("Tunnel: {reason}");
                    self.snapshot.send_modify(|s| {
                        s.lost(TunnelState::Reconnecting);
                        s.stats.disconnect_count += 1;
                    });
                    self.notifier.emit(TunnelEvent::Disconnected { reason });

                    match self.reconnect(process).await {
                        Some(next) => {
                            process = next;
                            ticker.reset();
                        }
                        None => return,
                    }
                }
                Err(e) => {
                    let message = format!("liveness check failed: {e}");
                    warn!("Tunnel: {message}");
                    self.snapshot
                        .send_modify(|s| s.stats.last_error = Some(message.clone()));
                    self.notifier.emit(TunnelEvent::Error { message });
                }
            }
        }

        terminate(&mut process.child, self.launch.terminate_grace).await;
    }

    /// Replace a dead process. `None` when cancelled or out of attempts.
    async fn reconnect(&mut self, stale: TunnelProcess) -> Option<TunnelProcess> {
        let mut stale = Some(stale);
        let max = self.policy.max_retries();
        self.policy.reset();

        while let Some(attempt) = self.policy.next_attempt() {
            info!(
                "Tunnel: reconnect attempt {attempt}/{max} in {:.1}s",
                self.policy.delay().as_secs_f64()
            );
            self.snapshot.send_modify(|s| {
                s.state = TunnelState::Reconnecting;
                s.retry_count = attempt;
            });
            if let Some(mut old) = stale.take() {
                terminate(&mut old.child, self.launch.terminate_grace).await;
            }

            tokio::select! {
                () = self.cancel.cancelled() => return None,
                () = tokio::time::sleep(self.policy.delay()) => {}
            }

            self.snapshot
                .send_modify(|s| s.state = TunnelState::Connecting);
            let result = tokio::select! {
                () = self.cancel.cancelled() => return None,
                result = acquire(&self.launch) => result,
            };

            match result {
                Ok(process) => {
                    info!("Tunnel: reconnected as {} on attempt {attempt}", process.url);
                    let url = process.url.clone();
                    self.snapshot.send_modify(|s| {
                        s.connected(url.clone(), process.pid());
                        s.stats.reconnect_count += 1;
                    });
                    self.connected_since = Instant::now();
                    self.notifier.emit(TunnelEvent::Reconnected { url, attempt });
                    return Some(process);
                }
                Err(e) => {
                    warn!("Tunnel: reconnect attempt {attempt}/{max} failed: {e}");
                    let message = e.to_string();
                    self.snapshot
                        .send_modify(|s| s.stats.last_error = Some(message.clone()));
                    self.notifier.emit(TunnelEvent::Error { message });
                }
            }
        }

        let attempts = self.policy.attempt();
        let failure = TunnelError::MaxRetriesExceeded(attempts);
        error!("Tunnel: {failure}");
        self.snapshot.send_modify(|s| {
            s.state = TunnelState::Failed;
            s.stats.last_error = Some(failure.to_string());
        });
        self.notifier.emit(TunnelEvent::Failed { attempts });
        None
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::routes::test_support::script;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    use std::path::Path;

    const WAIT: Duration = Duration::from_secs(10);

    fn settings(binary: PathBuf) -> TunnelSettings {
        TunnelSettings {
            binary,
            endpoint_suffix: "trycloudflare.com".into(),
            max_retries: 3,
            retry_delay: Duration::from_millis(50),
            startup_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
            terminate_grace: Duration::from_millis(500),
        }
    }

    /// Fake tunnel binary. `$n` is the 1-based run number, persisted in
    /// `<dir>/count` so tests can tell how many times it was launched.
    fn fake_tunnel(dir: &Path, body: &str) -> PathBuf {
        let count = dir.join("count");
        script(
            dir,
            "cloudflared",
            &format!(
                "n=$(cat '{c}' 2>/dev/null || echo 0)\nn=$((n + 1))\necho $n > '{c}'\n{body}",
                c = count.display()
            ),
        )
    }

    fn runs(dir: &Path) -> u32 {
        std::fs::read_to_string(dir.join("count"))
            .map(|s| s.trim().parse().unwrap())
            .unwrap_or(0)
    }

    const ANNOUNCE: &str = r#"echo "INF |  https://run-$n.trycloudflare.com  |" >&2"#;

    async fn wait_until(
        rx: &mut watch::Receiver<TunnelSnapshot>,
        pred: impl FnMut(&TunnelSnapshot) -> bool,
    ) -> TunnelSnapshot {
        let snap = tokio::time::timeout(WAIT, rx.wait_for(pred))
            .await
            .expect("timed out waiting for snapshot")
            .expect("snapshot channel closed");
        (*snap).clone()
    }

    async fn next_event(events: &mut TunnelEvents) -> TunnelEvent {
        tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_tunnel(dir.path(), &format!("{ANNOUNCE}\nexec sleep 30"));
        let mut sup = TunnelSupervisor::new(settings(bin)).unwrap();
        let mut events = sup.subscribe();

        let url = sup.start(8787).await.unwrap();
        assert_eq!(url, "https://run-1.trycloudflare.com");
        assert_eq!(
            next_event(&mut events).await,
            TunnelEvent::Connected { url: url.clone() }
        );

        let snap = sup.snapshot();
        assert_eq!(snap.state, TunnelState::Connected);
        assert_eq!(snap.public_endpoint.as_deref(), Some(url.as_str()));
        assert!(snap.stats.connected_at.is_some());
        let pid = snap.pid.unwrap();

        sup.stop().await;
        let snap = sup.snapshot();
        assert_eq!(snap.state, TunnelState::Disconnected);
        assert_eq!(snap.public_endpoint, None);
        assert_eq!(snap.pid, None);
        assert!(!sup.is_monitoring());
        #[allow(clippy::cast_possible_wrap)]
        let gone = kill(Pid::from_raw(pid as i32), None).is_err();
        assert!(gone, "tunnel process {pid} still alive after stop");
        assert_eq!(runs(dir.path()), 1);
    }

    #[tokio::test]
    async fn test_reconnects_after_process_exits() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_tunnel(
            dir.path(),
            &format!(
                "{ANNOUNCE}\nif [ \"$n\" -le 2 ]; then sleep 0.2; exit 1; fi\nexec sleep 30"
            ),
        );
        let mut sup = TunnelSupervisor::new(settings(bin)).unwrap();
        let mut events = sup.subscribe();
        let mut rx = sup.subscribe_snapshot();

        sup.start(8787).await.unwrap();

        let expected = [
            TunnelEvent::Connected {
                url: "https://run-1.trycloudflare.com".into(),
            },
            TunnelEvent::Disconnected {
                reason: String::new(),
            },
            TunnelEvent::Reconnected {
                url: "https://run-2.trycloudflare.com".into(),
                attempt: 1,
            },
            TunnelEvent::Disconnected {
                reason: String::new(),
            },
            TunnelEvent::Reconnected {
                url: "https://run-3.trycloudflare.com".into(),
                attempt: 1,
            },
        ];
        for want in expected {
            let got = next_event(&mut events).await;
            match (&want, &got) {
                (TunnelEvent::Disconnected { .. }, TunnelEvent::Disconnected { reason }) => {
                    assert!(reason.contains("exited"), "{reason}");
                }
                _ => assert_eq!(got, want),
            }
        }

        let snap = wait_until(&mut rx, |s| s.stats.reconnect_count == 2).await;
        assert_eq!(snap.state, TunnelState::Connected);
        assert_eq!(
            snap.public_endpoint.as_deref(),
            Some("https://run-3.trycloudflare.com")
        );
        assert_eq!(snap.stats.disconnect_count, 2);
        assert_eq!(snap.retry_count, 0);
        assert_eq!(runs(dir.path()), 3);

        sup.stop().await;
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_tunnel(
            dir.path(),
            &format!(
                "if [ \"$n\" -eq 1 ]; then {ANNOUNCE}; sleep 0.2; exit 1; fi\n\
                 echo 'ERR failed to dial edge' >&2\nexit 1"
            ),
        );
        let mut sup = TunnelSupervisor::new(settings(bin)).unwrap();
        let mut events = sup.subscribe();

        sup.start(8787).await.unwrap();
        assert!(matches!(
            next_event(&mut events).await,
            TunnelEvent::Connected { .. }
        ));
        assert!(matches!(
            next_event(&mut events).await,
            TunnelEvent::Disconnected { .. }
        ));
        for _ in 0..3 {
            match next_event(&mut events).await {
                TunnelEvent::Error { message } => {
                    assert!(message.contains("failed to dial edge"), "{message}");
                }
                other => panic!("expected Error, got {other:?}"),
            }
        }
        assert_eq!(
            next_event(&mut events).await,
            TunnelEvent::Failed { attempts: 3 }
        );

        let snap = sup.snapshot();
        assert_eq!(snap.state, TunnelState::Failed);
        assert_eq!(snap.public_endpoint, None);
        assert_eq!(snap.retry_count, 3);
        assert!(snap.stats.last_error.is_some());

        // Terminal: no further attempts or events.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(runs(dir.path()), 4);
        assert_eq!(events.try_recv(), None);
        assert!(!sup.is_monitoring());

        sup.stop().await;
        assert_eq!(sup.snapshot().state, TunnelState::Disconnected);
    }

    #[tokio::test]
    async fn test_startup_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_tunnel(dir.path(), "echo 'INF waiting for edge' >&2\nexec sleep 30");
        let mut sup = TunnelSupervisor::new(TunnelSettings {
            startup_timeout: Duration::from_millis(300),
            ..settings(bin)
        })
        .unwrap();

        let err = sup.start(8787).await.unwrap_err();
        assert!(matches!(err, TunnelError::StartupTimeout(_)), "{err}");
        let snap = sup.snapshot();
        assert_eq!(snap.state, TunnelState::Disconnected);
        assert_eq!(snap.public_endpoint, None);
        assert!(snap.stats.last_error.is_some());
        assert!(!sup.is_monitoring());
    }

    #[tokio::test]
    async fn test_stop_interrupts_reconnect_delay() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_tunnel(dir.path(), &format!("{ANNOUNCE}\nsleep 0.2\nexit 1"));
        let mut sup = TunnelSupervisor::new(TunnelSettings {
            retry_delay: Duration::from_secs(30),
            ..settings(bin)
        })
        .unwrap();
        let mut rx = sup.subscribe_snapshot();

        sup.start(8787).await.unwrap();
        wait_until(&mut rx, |s| s.state == TunnelState::Reconnecting).await;

        tokio::time::timeout(Duration::from_secs(2), sup.stop())
            .await
            .expect("stop blocked on the reconnect delay");
        assert_eq!(sup.snapshot().state, TunnelState::Disconnected);
        assert_eq!(sup.snapshot().retry_count, 0);
        assert_eq!(runs(dir.path()), 1);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_tunnel(dir.path(), &format!("{ANNOUNCE}\nexec sleep 30"));
        let mut sup = TunnelSupervisor::new(settings(bin)).unwrap();

        sup.start(8787).await.unwrap();
        assert!(matches!(
            sup.start(8787).await,
            Err(TunnelError::AlreadyRunning)
        ));
        sup.stop().await;

        // Startable again once stopped.
        let url = sup.start(8787).await.unwrap();
        assert_eq!(url, "https://run-2.trycloudflare.com");
        sup.stop().await;
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let mut sup = TunnelSupervisor::new(settings("/nonexistent".into())).unwrap();
        sup.stop().await;
        sup.stop().await;
        assert_eq!(sup.snapshot().state, TunnelState::Disconnected);
        assert_eq!(sup.public_endpoint(), None);
    }

    #[tokio::test]
    async fn test_uptime_advances_while_connected() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_tunnel(dir.path(), &format!("{ANNOUNCE}\nexec sleep 30"));
        let mut sup = TunnelSupervisor::new(settings(bin)).unwrap();
        let mut rx = sup.subscribe_snapshot();

        sup.start(8787).await.unwrap();
        let snap = wait_until(&mut rx, |s| s.stats.uptime_secs >= 1).await;
        assert_eq!(snap.state, TunnelState::Connected);
        sup.stop().await;
    }
}
