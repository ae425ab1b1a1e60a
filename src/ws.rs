//! WebSocket plumbing shared by both transports.
//!
//! [`connect`] returns independent halves: a [`WsWriter`] that is moved into
//! a writer task and a [`WsReader`] that feeds the receive side. Frames are
//! modeled per direction ([`Outgoing`], [`Incoming`]) so neither side has to
//! handle variants it can never see.

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Close code reported when the peer closed without a status.
pub const CLOSE_NO_STATUS: u16 = 1005;

/// Frame written by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    /// JSON control message.
    Text(String),
    /// Encoded camera frame.
    Binary(Bytes),
    /// Reply to a server ping.
    Pong(Vec<u8>),
}

impl From<Outgoing> for Message {
    fn from(frame: Outgoing) -> Self {
        match frame {
            Outgoing::Text(text) => Message::Text(text),
            Outgoing::Binary(data) => Message::Binary(data.into()),
            Outgoing::Pong(data) => Message::Pong(data),
        }
    }
}

/// Frame read from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// JSON control message.
    Text(String),
    /// Stylized frame.
    Binary(Bytes),
    /// Keepalive that wants a pong.
    Ping(Vec<u8>),
    /// Server closed the socket.
    Close {
        /// Close code, [`CLOSE_NO_STATUS`] if none was sent.
        code: u16,
        /// Close reason, possibly empty.
        reason: String,
    },
}

impl Incoming {
    /// `None` for frames the client ignores (pongs, raw frames).
    fn from_message(msg: Message) -> Option<Self> {
        match msg {
            Message::Text(text) => Some(Self::Text(text)),
            Message::Binary(data) => Some(Self::Binary(Bytes::from(data))),
            Message::Ping(data) => Some(Self::Ping(data)),
            Message::Close(frame) => {
                let (code, reason) = frame.map_or((CLOSE_NO_STATUS, String::new()), |f| {
                    (u16::from(f.code), f.reason.into_owned())
                });
                Some(Self::Close { code, reason })
            }
            Message::Pong(_) | Message::Frame(_) => None,
        }
    }
}

/// Sending half.
#[derive(Debug)]
pub struct WsWriter {
    sink: SplitSink<Socket, Message>,
}

impl WsWriter {
    /// Write one frame.
    pub async fn send(&mut self, frame: Outgoing) -> Result<()> {
        self.sink
            .send(frame.into())
            .await
            .context("WebSocket write failed")
    }

    /// Send a close frame without a status, then shut the sink.
    pub async fn close(&mut self) -> Result<()> {
        self.sink
            .send(Message::Close(None))
            .await
            .context("WebSocket close frame failed")?;
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Receiving half.
#[derive(Debug)]
pub struct WsReader {
    stream: SplitStream<Socket>,
}

impl WsReader {
    /// Next frame the client cares about; `None` once the stream ends.
    pub async fn recv(&mut self) -> Option<Result<Incoming>> {
        while let Some(msg) = self.stream.next().await {
            match msg {
                Ok(msg) => {
                    if let Some(frame) = Incoming::from_message(msg) {
                        return Some(Ok(frame));
                    }
                }
                Err(e) => return Some(Err(anyhow::anyhow!("WebSocket read error: {e}"))),
            }
        }
        None
    }
}

/// Open `url` with extra request `headers`.
pub async fn connect(url: &str, headers: &[(&str, &str)]) -> Result<(WsWriter, WsReader)> {
    let mut request = url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;

    for &(name, value) in headers {
        let name_bytes = name.as_bytes();
        let header = HeaderName::from_bytes(name_bytes).with_context(|| format!("invalid header name: {name}"))?;
        let value = HeaderValue::from_str(value).with_context(|| format!("invalid header value for {name}"))?;
        request.headers_mut().insert(header, value);
    }

    let (socket, response) = tokio_tungstenite::connect_async(request)
        .await
        .context("WebSocket connect failed")?;
    log::debug!("[WS] Handshake complete ({})", response.status());
    let (sink, stream) = socket.split();
    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Rewrite `http(s)://` to `ws(s)://`; other URLs pass through.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}
