//! Transport abstraction for the session engine.
//!
//! # Architecture
//!
//! ```text
//! Transport (trait)
//!     │
//!     ├── WebSocketTransport
//!     │   └── one socket: JSON text control + binary frames
//!     │
//!     └── WebRtcTransport
//!         ├── signaling socket: JSON control + offer/answer/ice-candidate
//!         └── data channel "frames": binary frames both ways
//! ```
//!
//! `connect` hands back the receiving end of a bounded event channel. The
//! session owns that receiver and runs its receive loop over it; sending
//! goes through `&self` so one transport can be shared (`Arc<dyn Transport>`)
//! between the session and the frame pipeline.

pub mod webrtc;
pub mod websocket;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use self::webrtc::WebRtcTransport;
pub use self::websocket::WebSocketTransport;

/// Which transport variant a session uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Single WebSocket for control and frames.
    #[default]
    #[serde(alias = "ws")]
    WebSocket,
    /// WebSocket signaling plus a WebRTC data channel for frames.
    #[serde(alias = "rtc")]
    WebRtc,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WebSocket => write!(f, "websocket"),
            Self::WebRtc => write!(f, "webrtc"),
        }
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(Self::WebSocket),
            "webrtc" | "rtc" => Ok(Self::WebRtc),
            other => Err(format!("unknown transport '{other}' (expected websocket or webrtc)")),
        }
    }
}

/// Something that happened on the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// JSON control message from the server.
    Text(String),
    /// One encoded stylized frame.
    Binary(Bytes),
    /// The media path (WebRTC peer connection) became usable.
    MediaConnected,
    /// The connection closed.
    Closed {
        /// Close code, if the peer sent one.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// Read-side failure; the connection is unusable.
    Error(String),
}

/// Errors from transport operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Endpoint unreachable or handshake rejected.
    ConnectionFailed(String),
    /// A send failed on an established connection.
    SendFailed(String),
    /// Operation needs a connection and there is none.
    NotConnected,
    /// The connection was closed.
    Closed,
    /// Connect did not complete in time.
    Timeout,
    /// WebRTC offer/answer/ICE negotiation failed.
    Negotiation(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {msg}"),
            Self::SendFailed(msg) => write!(f, "Send failed: {msg}"),
            Self::NotConnected => write!(f, "Not connected"),
            Self::Closed => write!(f, "Transport closed"),
            Self::Timeout => write!(f, "Operation timed out"),
            Self::Negotiation(msg) => write!(f, "Negotiation failed: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// A bidirectional message transport to the stylization service.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which variant this is.
    fn kind(&self) -> TransportKind;

    /// Open the connection and return the event stream.
    ///
    /// Calling `connect` again replaces any previous connection.
    async fn connect(&self, endpoint: &str) -> Result<mpsc::Receiver<TransportEvent>, TransportError>;

    /// Send a JSON control message.
    async fn send_text(&self, text: &str) -> Result<(), TransportError>;

    /// Send one encoded frame.
    async fn send_binary(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Whether frames can flow yet.
    ///
    /// Always true for WebSocket once connected; for WebRTC only after the
    /// peer connection reports connected.
    fn media_ready(&self) -> bool;

    /// Close gracefully. Callers bound this with a grace timeout.
    async fn close(&self);
}

/// Build the transport variant named by `kind`.
pub fn for_kind(kind: TransportKind, ice_servers: Vec<String>) -> std::sync::Arc<dyn Transport> {
    match kind {
        TransportKind::WebSocket => std::sync::Arc::new(WebSocketTransport::new().with_header(
            "User-Agent",
            concat!("stylestream/", env!("CARGO_PKG_VERSION")),
        )),
        TransportKind::WebRtc => std::sync::Arc::new(WebRtcTransport::new(ice_servers)),
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Channel-backed transport that records everything sent.

    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug)]
    pub(crate) struct RecordingTransport {
        kind: TransportKind,
        texts: Mutex<Vec<String>>,
        binaries: Mutex<Vec<Bytes>>,
        fail_sends: AtomicBool,
        media_ready: AtomicBool,
        connect_error: Mutex<Option<TransportError>>,
        connect_delay: Mutex<Option<Duration>>,
        events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
        connects: AtomicUsize,
        closes: AtomicUsize,
    }

    impl RecordingTransport {
        pub(crate) fn new() -> Self {
            Self::with_kind(TransportKind::WebSocket)
        }

        pub(crate) fn with_kind(kind: TransportKind) -> Self {
            Self {
                kind,
                texts: Mutex::new(Vec::new()),
                binaries: Mutex::new(Vec::new()),
                fail_sends: AtomicBool::new(false),
                media_ready: AtomicBool::new(kind == TransportKind::WebSocket),
                connect_error: Mutex::new(None),
                connect_delay: Mutex::new(None),
                events: Mutex::new(None),
                connects: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
            }
        }

        pub(crate) fn fail_sends(&self, fail: bool) {
            self.fail_sends.store(fail, Ordering::SeqCst);
        }

        pub(crate) fn set_media_ready(&self, ready: bool) {
            self.media_ready.store(ready, Ordering::SeqCst);
        }

        pub(crate) fn fail_connect(&self, err: TransportError) {
            *self.connect_error.lock().unwrap() = Some(err);
        }

        pub(crate) fn delay_connect(&self, delay: Duration) {
            *self.connect_delay.lock().unwrap() = Some(delay);
        }

        pub(crate) fn sent_texts(&self) -> Vec<String> {
            self.texts.lock().unwrap().clone()
        }

        /// Sent control messages parsed as JSON.
        pub(crate) fn sent_json(&self) -> Vec<serde_json::Value> {
            self.sent_texts()
                .iter()
                .map(|t| serde_json::from_str(t).unwrap())
                .collect()
        }

        pub(crate) fn sent_types(&self) -> Vec<String> {
            self.sent_json()
                .iter()
                .map(|v| v["type"].as_str().unwrap().to_string())
                .collect()
        }

        pub(crate) fn binary_count(&self) -> usize {
            self.binaries.lock().unwrap().len()
        }

        pub(crate) fn connect_count(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        pub(crate) fn close_count(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }

        /// Deliver an event to the session's receive loop.
        pub(crate) async fn inject(&self, event: TransportEvent) {
            let tx = self.events.lock().unwrap().clone();
            tx.expect("not connected").send(event).await.unwrap();
        }

        pub(crate) async fn inject_json(&self, value: serde_json::Value) {
            self.inject(TransportEvent::Text(value.to_string())).await;
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        async fn connect(&self, _endpoint: &str) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let delay = *self.connect_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(err) = self.connect_error.lock().unwrap().clone() {
                return Err(err);
            }
            let (tx, rx) = mpsc::channel(64);
            *self.events.lock().unwrap() = Some(tx);
            Ok(rx)
        }

        async fn send_text(&self, text: &str) -> Result<(), TransportError> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(TransportError::SendFailed("injected".into()));
            }
            self.texts.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn send_binary(&self, frame: Bytes) -> Result<(), TransportError> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(TransportError::SendFailed("injected".into()));
            }
            self.binaries.lock().unwrap().push(frame);
            Ok(())
        }

        fn media_ready(&self) -> bool {
            self.media_ready.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.events.lock().unwrap().take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_from_str() {
        assert_eq!("websocket".parse::<TransportKind>(), Ok(TransportKind::WebSocket));
        assert_eq!(" WebRTC ".parse::<TransportKind>(), Ok(TransportKind::WebRtc));
        assert_eq!("ws".parse::<TransportKind>(), Ok(TransportKind::WebSocket));
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_transport_kind_serde() {
        assert_eq!(serde_json::to_string(&TransportKind::WebRtc).unwrap(), "\"webrtc\"");
        let kind: TransportKind = serde_json::from_str("\"ws\"").unwrap();
        assert_eq!(kind, TransportKind::WebSocket);
    }

    #[test]
    fn test_error_display() {
        assert_eq!(TransportError::Timeout.to_string(), "Operation timed out");
        assert_eq!(
            TransportError::ConnectionFailed("refused".into()).to_string(),
            "Connection failed: refused"
        );
    }
}
