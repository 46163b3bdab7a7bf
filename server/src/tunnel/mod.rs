//! Public endpoint via a supervised tunnel subprocess.
//!
//! - [`supervisor`]: lifecycle, liveness monitor, reconnection, snapshots
//! - [`endpoint`]: spawning the binary and scraping the assigned hostname
//! - [`reconnect`]: bounded retry policy
//! - [`events`]: the closed event set and its broadcast channel

pub mod endpoint;
pub mod events;
pub mod reconnect;
pub mod supervisor;

use std::time::Duration;

pub use events::{EventNotifier, TunnelEvent, TunnelEvents};
pub use supervisor::{TunnelSettings, TunnelSnapshot, TunnelState, TunnelStats, TunnelSupervisor};

/// Tunnel supervision errors.
#[derive(Debug)]
pub enum TunnelError {
    /// Supervisor settings are unusable.
    Config(String),
    /// The tunnel binary could not be started.
    Spawn(std::io::Error),
    /// No public endpoint appeared before the startup deadline.
    StartupTimeout(Duration),
    /// The diagnostic stream closed before a public endpoint appeared.
    StartupFailed(String),
    /// The supervised process died.
    ProcessExit(String),
    /// Every reconnect attempt failed.
    MaxRetriesExceeded(u32),
    /// `start()` called while a tunnel is already supervised.
    AlreadyRunning,
}

impl std::fmt::Display for TunnelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "invalid tunnel settings: {msg}"),
            Self::Spawn(e) => write!(f, "failed to spawn tunnel binary: {e}"),
            Self::StartupTimeout(d) => write!(
                f,
                "no public endpoint within {}s of starting the tunnel",
                d.as_secs_f64()
            ),
            Self::StartupFailed(detail) => write!(f, "tunnel failed to start: {detail}"),
            Self::ProcessExit(status) => write!(f, "tunnel process exited ({status})"),
            Self::MaxRetriesExceeded(n) => {
                write!(f, "giving up after {n} failed reconnect attempts")
            }
            Self::AlreadyRunning => write!(f, "tunnel is already running"),
        }
    }
}

impl std::error::Error for TunnelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn(e) => Some(e),
            _ => None,
        }
    }
}
