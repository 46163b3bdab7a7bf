//! Tunnel lifecycle events.
//!
//! The supervisor publishes every state transition as a [`TunnelEvent`] on a
//! broadcast channel. Subscribers (the orchestrator, tests) react to them;
//! nothing a subscriber does can feed back into the supervisor.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Buffered events per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 64;

/// A supervisor state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelEvent {
    /// Initial endpoint acquired by `start()`.
    Connected { url: String },
    /// The tunnel process exited while connected.
    Disconnected { reason: String },
    /// A reconnect attempt acquired a new endpoint.
    Reconnected { url: String, attempt: u32 },
    /// A reconnect attempt (or a liveness check) failed.
    Error { message: String },
    /// Reconnect attempts are exhausted; the supervisor stopped trying.
    Failed { attempts: u32 },
}

impl TunnelEvent {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::Reconnected { .. } => "reconnected",
            Self::Error { .. } => "error",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Sending side of the event channel, owned by the supervisor.
#[derive(Clone)]
pub struct EventNotifier {
    tx: broadcast::Sender<TunnelEvent>,
}

impl EventNotifier {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// New subscription; sees only events emitted after this call.
    pub fn subscribe(&self) -> TunnelEvents {
        TunnelEvents {
            rx: self.tx.subscribe(),
        }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: TunnelEvent) {
        debug!("Tunnel: event {}", event.as_str());
        let _ = self.tx.send(event);
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of the event channel.
pub struct TunnelEvents {
    rx: broadcast::Receiver<TunnelEvent>,
}

impl TunnelEvents {
    /// Next event, or `None` once the supervisor is gone. Events dropped
    /// because this subscriber fell behind are logged and skipped.
    pub async fn recv(&mut self) -> Option<TunnelEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Tunnel: event subscriber lagged, {n} events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-buffered event, without waiting.
    pub fn try_recv(&mut self) -> Option<TunnelEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_later_events_only() {
        let notifier = EventNotifier::new();
        notifier.emit(TunnelEvent::Error {
            message: "before".into(),
        });
        let mut events = notifier.subscribe();
        notifier.emit(TunnelEvent::Connected {
            url: "https://a.trycloudflare.com".into(),
        });
        assert_eq!(
            events.recv().await,
            Some(TunnelEvent::Connected {
                url: "https://a.trycloudflare.com".into()
            })
        );
        assert_eq!(events.try_recv(), None);
    }

    #[tokio::test]
    async fn test_closed_when_notifier_dropped() {
        let notifier = EventNotifier::new();
        let mut events = notifier.subscribe();
        drop(notifier);
        assert_eq!(events.recv().await, None);
    }

    #[test]
    fn test_event_json() {
        let v = serde_json::to_value(TunnelEvent::Reconnected {
            url: "https://b.trycloudflare.com".into(),
            attempt: 2,
        })
        .unwrap();
        assert_eq!(v["type"], "reconnected");
        assert_eq!(v["attempt"], 2);
    }
}
