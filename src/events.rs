//! Session notifications.
//!
//! A single broadcast bus replaces per-field callbacks: every subscriber
//! sees every [`SessionEvent`] published after it subscribed. A subscriber
//! that falls behind loses the oldest events, never blocks the publisher.

use tokio::sync::broadcast;

use crate::frame::pipeline::StartTrigger;
use crate::session::SessionState;
use crate::usage::UsageNotice;

/// Notification published by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The session moved to a new state.
    StateChanged(SessionState),
    /// Server accepted authentication.
    Ready {
        /// Server-assigned session id.
        session_id: String,
        /// Negotiated output width.
        width: u32,
        /// Negotiated output height.
        height: u32,
    },
    /// The outbound frame loop started.
    StreamingStarted {
        /// What started it.
        trigger: StartTrigger,
    },
    /// The active style changed.
    StyleChanged {
        /// New active prompt.
        prompt: String,
        /// Whether the prompt came from an image extraction.
        from_image: bool,
    },
    /// A style extraction request was rejected by the server.
    StyleExtractionFailed(String),
    /// Quota threshold notification.
    Usage(UsageNotice),
    /// Server acknowledged a prompt change.
    PromptAck {
        /// Whether it was applied.
        success: bool,
        /// Reason when not applied.
        error: Option<String>,
    },
    /// Server reported an error.
    ServerError(String),
    /// Older inbound frames were discarded in favor of a newer one.
    FramesDropped {
        /// Number discarded on this tick.
        count: usize,
    },
    /// The transport closed.
    Disconnected {
        /// Close reason.
        reason: String,
    },
}

/// Publish/subscribe fan-out for [`SessionEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// Create a bus retaining up to `capacity` undelivered events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: SessionEvent) {
        log::trace!("[Session] event: {event:?}");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::constants::EVENT_BUS_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new(4);
        bus.publish(SessionEvent::ServerError("x".into()));
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_event() {
        let bus = EventBus::new(4);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(SessionEvent::FramesDropped { count: 2 });

        assert_eq!(a.recv().await.unwrap(), SessionEvent::FramesDropped { count: 2 });
        assert_eq!(b.recv().await.unwrap(), SessionEvent::FramesDropped { count: 2 });
    }

    #[tokio::test]
    async fn test_lagging_subscriber_keeps_newest() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for count in 0..5 {
            bus.publish(SessionEvent::FramesDropped { count });
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert_eq!(rx.recv().await.unwrap(), SessionEvent::FramesDropped { count: 3 });
    }
}
