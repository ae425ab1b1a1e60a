//! Plain WebSocket transport.
//!
//! JSON control messages travel as text frames and encoded video frames as
//! binary frames on the same socket. The socket is split: a writer task
//! drains an mpsc queue so callers never hold the sink, and a reader task
//! turns incoming frames into [`TransportEvent`]s.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{Transport, TransportError, TransportEvent, TransportKind};
use crate::constants::TRANSPORT_EVENT_CAPACITY;
use crate::ws::{self, Incoming, Outgoing, WsReader, WsWriter};

/// Close code used when the socket ended without a close frame.
const CLOSE_ABNORMAL: u16 = 1006;

/// Work for the writer task.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(Outgoing),
    Close(oneshot::Sender<()>),
}

/// Writer/reader tasks for one connected socket.
///
/// Dropping it aborts both tasks.
#[derive(Debug)]
pub(crate) struct SocketTasks {
    pub(crate) out_tx: mpsc::Sender<Outbound>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl SocketTasks {
    /// Spawn the writer and reader for a freshly connected socket.
    ///
    /// Everything the reader sees goes to `events`.
    pub(crate) fn spawn(
        writer: WsWriter,
        reader: WsReader,
        events: mpsc::Sender<TransportEvent>,
        tag: &'static str,
    ) -> Self {
        let (out_tx, out_rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
        let writer = tokio::spawn(write_loop(writer, out_rx, tag));
        let reader = tokio::spawn(read_loop(reader, events, out_tx.clone(), tag));
        Self {
            out_tx,
            writer,
            reader,
        }
    }

    /// Queue a close frame and wait until the writer has sent it.
    pub(crate) async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.out_tx.send(Outbound::Close(ack_tx)).await.is_ok() {
            // Writer gone means the socket is already down.
            let _ = ack_rx.await;
        }
    }
}

impl Drop for SocketTasks {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
    }
}

async fn write_loop(mut writer: WsWriter, mut rx: mpsc::Receiver<Outbound>, tag: &'static str) {
    while let Some(item) = rx.recv().await {
        let result = match item {
            Outbound::Frame(frame) => writer.send(frame).await,
            Outbound::Close(ack) => {
                if let Err(e) = writer.close().await {
                    log::debug!("{tag} Close handshake failed: {e:#}");
                }
                let _ = ack.send(());
                break;
            }
        };
        if let Err(e) = result {
            log::warn!("{tag} Write failed, stopping writer: {e:#}");
            break;
        }
    }
    log::debug!("{tag} Writer task exited");
}

async fn read_loop(
    mut reader: WsReader,
    events: mpsc::Sender<TransportEvent>,
    out_tx: mpsc::Sender<Outbound>,
    tag: &'static str,
) {
    loop {
        let event = match reader.recv().await {
            Some(Ok(Incoming::Text(text))) => TransportEvent::Text(text),
            Some(Ok(Incoming::Binary(data))) => TransportEvent::Binary(data),
            Some(Ok(Incoming::Ping(data))) => {
                let _ = out_tx.send(Outbound::Frame(Outgoing::Pong(data))).await;
                continue;
            }
            Some(Ok(Incoming::Close { code, reason })) => {
                log::info!("{tag} Server closed connection ({code}): {reason}");
                let _ = events.send(TransportEvent::Closed { code, reason }).await;
                break;
            }
            Some(Err(e)) => {
                log::warn!("{tag} {e:#}");
                let _ = events.send(TransportEvent::Error(format!("{e:#}"))).await;
                break;
            }
            None => {
                let _ = events
                    .send(TransportEvent::Closed {
                        code: CLOSE_ABNORMAL,
                        reason: "connection lost".to_string(),
                    })
                    .await;
                break;
            }
        };
        if events.send(event).await.is_err() {
            log::debug!("{tag} Event receiver dropped, stopping reader");
            break;
        }
    }
}

/// Single-socket transport.
#[derive(Debug, Default)]
pub struct WebSocketTransport {
    headers: Vec<(String, String)>,
    socket: Mutex<Option<SocketTasks>>,
}

impl WebSocketTransport {
    /// Create an unconnected transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header sent with the upgrade request.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    fn sender(&self) -> Result<mpsc::Sender<Outbound>, TransportError> {
        self.socket
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .map(|s| s.out_tx.clone())
            .ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn connect(&self, endpoint: &str) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let headers: Vec<(&str, &str)> = self
            .headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        log::info!("[WS] Connecting to {endpoint}");
        let (writer, reader) = ws::connect(endpoint, &headers)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{e:#}")))?;

        let (events_tx, events_rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
        let tasks = SocketTasks::spawn(writer, reader, events_tx, "[WS]");
        // Replacing drops (and aborts) any previous connection.
        *self
            .socket
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(tasks);

        log::info!("[WS] Connected");
        Ok(events_rx)
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.sender()?
            .send(Outbound::Frame(Outgoing::Text(text.to_string())))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn send_binary(&self, frame: Bytes) -> Result<(), TransportError> {
        self.sender()?
            .send(Outbound::Frame(Outgoing::Binary(frame)))
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn media_ready(&self) -> bool {
        self.socket
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_some()
    }

    async fn close(&self) {
        let tasks = self
            .socket
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(tasks) = tasks {
            log::debug!("[WS] Closing");
            tasks.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_without_connect_is_not_connected() {
        let transport = WebSocketTransport::new();
        assert_eq!(
            transport.send_text("{}").await,
            Err(TransportError::NotConnected)
        );
        assert_eq!(
            transport.send_binary(Bytes::from_static(b"x")).await,
            Err(TransportError::NotConnected)
        );
        assert!(!transport.media_ready());
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_failed() {
        let transport = WebSocketTransport::new();
        let err = transport.connect("ws://127.0.0.1:1/stream").await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
    }

    #[tokio::test]
    async fn test_close_without_connect_is_noop() {
        let transport = WebSocketTransport::new().with_header("User-Agent", "stylestream-test");
        transport.close().await;
        assert_eq!(transport.kind(), TransportKind::WebSocket);
    }
}
