//! WebRTC transport: WebSocket signaling plus a `frames` data channel.
//!
//! # Architecture
//!
//! ```text
//!            session ◀──────────── events ────────────────┐
//!                                                         │
//! signaling socket ──reader──▶ drive_signaling ──forward──┤ (ready, error, prompt_ack, ...)
//!        ▲                         │   ▲                  │
//!        └──writer◀── offer/ice ───┘   │ local ICE        │
//!                                      │ dc open          │
//!                          RTCPeerConnection ── "frames" ─┘ (binary frames)
//! ```
//!
//! `answer` and `ice-candidate` are consumed by the driver; every other
//! control message is forwarded to the session unchanged. The driver is
//! generic over [`MediaNegotiator`] so its ordering rules are testable
//! without a real peer connection.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::websocket::{Outbound, SocketTasks};
use super::{Transport, TransportError, TransportEvent, TransportKind};
use crate::constants::{LOOP_SHUTDOWN_TIMEOUT, TRANSPORT_EVENT_CAPACITY};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::signaling::{MediaNegotiator, PendingIceCandidate, Signaling, SignalingError};
use crate::ws::{self, Outgoing};

/// Label of the data channel carrying frames.
pub const FRAMES_CHANNEL: &str = "frames";

/// [`MediaNegotiator`] backed by a webrtc-rs peer connection.
pub struct RtcNegotiator {
    pc: Arc<RTCPeerConnection>,
}

impl std::fmt::Debug for RtcNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcNegotiator")
            .field("state", &self.pc.connection_state())
            .finish()
    }
}

fn media_err(e: impl std::fmt::Display) -> SignalingError {
    SignalingError::Media(e.to_string())
}

#[async_trait]
impl MediaNegotiator for RtcNegotiator {
    async fn create_offer(&self) -> Result<String, SignalingError> {
        let offer = self.pc.create_offer(None).await.map_err(media_err)?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await.map_err(media_err)?;
        Ok(sdp)
    }

    async fn apply_answer(&self, sdp: &str) -> Result<(), SignalingError> {
        let answer = RTCSessionDescription::answer(sdp.to_string()).map_err(media_err)?;
        self.pc.set_remote_description(answer).await.map_err(media_err)
    }

    async fn add_remote_candidate(&self, candidate: PendingIceCandidate) -> Result<(), SignalingError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(media_err)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            log::debug!("[WebRTC] Peer connection close failed: {e}");
        }
    }
}

/// Channels the signaling driver works over.
#[derive(Debug)]
pub(crate) struct SignalingLinks {
    /// Writer queue of the signaling socket.
    pub(crate) outbound: mpsc::Sender<Outbound>,
    /// Raw events from the signaling socket reader.
    pub(crate) inbound: mpsc::Receiver<TransportEvent>,
    /// Candidates discovered by the local media stack.
    pub(crate) local_ice: mpsc::Receiver<PendingIceCandidate>,
    /// Fires once the media path is usable.
    pub(crate) media_up: mpsc::Receiver<()>,
    /// Events for the session.
    pub(crate) events: mpsc::Sender<TransportEvent>,
    /// Shared with the transport's `media_ready`.
    pub(crate) media_ready: Arc<AtomicBool>,
}

async fn send_signal(outbound: &mpsc::Sender<Outbound>, msg: &ClientMessage) -> bool {
    let text = match msg.to_json() {
        Ok(text) => text,
        Err(e) => {
            log::error!("[WebRTC] Failed to encode {}: {e}", msg.kind());
            return true;
        }
    };
    outbound.send(Outbound::Frame(Outgoing::Text(text))).await.is_ok()
}

async fn fail(events: &mpsc::Sender<TransportEvent>, err: &SignalingError) {
    log::error!("[WebRTC] {err}");
    let _ = events.send(TransportEvent::Error(err.to_string())).await;
}

/// Run offer/answer/ICE exchange until the socket closes or `cancel` fires,
/// then close the negotiator.
pub(crate) async fn drive_signaling<N>(negotiator: Arc<N>, mut links: SignalingLinks, cancel: CancellationToken)
where
    N: MediaNegotiator + ?Sized + 'static,
{
    let mut signaling = Signaling::new();
    if let Err(e) = signaling.on_signaling_connected() {
        fail(&links.events, &e).await;
        negotiator.close().await;
        return;
    }

    let offer = {
        let negotiator = Arc::clone(&negotiator);
        async move { negotiator.create_offer().await }
    };
    tokio::pin!(offer);
    let mut offer_pending = true;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,

            result = &mut offer, if offer_pending => {
                offer_pending = false;
                match result.and_then(|sdp| signaling.send_offer(sdp)) {
                    Ok(messages) => {
                        log::info!("[WebRTC] Sending offer");
                        let mut open = true;
                        for msg in &messages {
                            open = send_signal(&links.outbound, msg).await;
                            if !open {
                                break;
                            }
                        }
                        if !open {
                            break;
                        }
                    }
                    Err(e) => {
                        fail(&links.events, &e).await;
                        break;
                    }
                }
            }

            Some(candidate) = links.local_ice.recv() => {
                if let Some(msg) = signaling.on_local_candidate(candidate) {
                    if !send_signal(&links.outbound, &msg).await {
                        break;
                    }
                }
            }

            Some(()) = links.media_up.recv() => {
                if signaling.on_media_connected() {
                    log::info!("[WebRTC] Media path established");
                    links.media_ready.store(true, Ordering::Release);
                    let _ = links.events.send(TransportEvent::MediaConnected).await;
                }
            }

            event = links.inbound.recv() => {
                let Some(event) = event else { break };
                let text = match event {
                    TransportEvent::Text(text) => text,
                    other => {
                        let terminal = matches!(other, TransportEvent::Closed { .. } | TransportEvent::Error(_));
                        let _ = links.events.send(other).await;
                        if terminal {
                            break;
                        }
                        continue;
                    }
                };

                match ServerMessage::parse(&text) {
                    Ok(ServerMessage::Answer { sdp }) => {
                        if let Err(e) = signaling.on_answer() {
                            log::warn!("[WebRTC] Ignoring answer: {e}");
                            continue;
                        }
                        log::info!("[WebRTC] Applying remote answer");
                        if let Err(e) = negotiator.apply_answer(&sdp).await {
                            fail(&links.events, &e).await;
                            break;
                        }
                    }
                    Ok(ServerMessage::IceCandidate { candidate }) => {
                        if let Err(e) = signaling.on_remote_candidate() {
                            log::warn!("[WebRTC] Ignoring remote candidate: {e}");
                        } else if let Err(e) = negotiator.add_remote_candidate(candidate.into()).await {
                            log::warn!("[WebRTC] Remote candidate rejected: {e}");
                        }
                    }
                    // Everything else, malformed text included, belongs to the session.
                    _ => {
                        if links.events.send(TransportEvent::Text(text)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    log::debug!("[WebRTC] Signaling driver exited in state {}", signaling.state());
    negotiator.close().await;
}

struct RtcConnection {
    socket: SocketTasks,
    pc: Arc<RTCPeerConnection>,
    dc: Arc<RTCDataChannel>,
    driver: JoinHandle<()>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for RtcConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcConnection")
            .field("peer_state", &self.pc.connection_state())
            .field("channel", &self.dc.label())
            .finish_non_exhaustive()
    }
}

impl Drop for RtcConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.driver.abort();
    }
}

/// Signaling socket plus WebRTC data channel.
#[derive(Debug, Default)]
pub struct WebRtcTransport {
    ice_servers: Vec<String>,
    media_ready: Arc<AtomicBool>,
    conn: Mutex<Option<RtcConnection>>,
}

impl WebRtcTransport {
    /// Create an unconnected transport using `ice_servers` (STUN/TURN URLs).
    #[must_use]
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self {
            ice_servers,
            ..Self::default()
        }
    }

    fn handles(&self) -> Result<(mpsc::Sender<Outbound>, Arc<RTCDataChannel>), TransportError> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .map(|c| (c.socket.out_tx.clone(), Arc::clone(&c.dc)))
            .ok_or(TransportError::NotConnected)
    }

    async fn build_peer(
        &self,
        local_ice: mpsc::Sender<PendingIceCandidate>,
        media_up: mpsc::Sender<()>,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(Arc<RTCPeerConnection>, Arc<RTCDataChannel>), webrtc::Error> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await?,
        );

        pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let tx = local_ice.clone();
            Box::pin(async move {
                let Some(c) = c else { return };
                match c.to_json() {
                    Ok(init) => {
                        let _ = tx
                            .send(PendingIceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            })
                            .await;
                    }
                    Err(e) => log::warn!("[WebRTC] Could not serialize local candidate: {e}"),
                }
            })
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let tx = state_events.clone();
            Box::pin(async move {
                log::info!("[WebRTC] Peer connection state: {s}");
                if s == RTCPeerConnectionState::Failed {
                    let _ = tx
                        .send(TransportEvent::Error("peer connection failed".to_string()))
                        .await;
                }
            })
        }));

        let dc = pc.create_data_channel(FRAMES_CHANNEL, None).await?;
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                let _ = media_up.send(()).await;
            })
        }));
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = events.clone();
            Box::pin(async move {
                let event = if msg.is_string {
                    TransportEvent::Text(String::from_utf8_lossy(&msg.data).into_owned())
                } else {
                    TransportEvent::Binary(msg.data)
                };
                let _ = tx.send(event).await;
            })
        }));

        Ok((pc, dc))
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebRtc
    }

    async fn connect(&self, endpoint: &str) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        self.media_ready.store(false, Ordering::Release);

        log::info!("[WebRTC] Connecting signaling to {endpoint}");
        let (writer, reader) = ws::connect(endpoint, &[])
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{e:#}")))?;

        let (signal_tx, signal_rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
        let socket = SocketTasks::spawn(writer, reader, signal_tx, "[WebRTC]");

        let (events_tx, events_rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
        let (ice_tx, ice_rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
        let (media_tx, media_rx) = mpsc::channel(1);

        let (pc, dc) = self
            .build_peer(ice_tx, media_tx, events_tx.clone())
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;

        let cancel = CancellationToken::new();
        let links = SignalingLinks {
            outbound: socket.out_tx.clone(),
            inbound: signal_rx,
            local_ice: ice_rx,
            media_up: media_rx,
            events: events_tx,
            media_ready: Arc::clone(&self.media_ready),
        };
        let negotiator = Arc::new(RtcNegotiator { pc: Arc::clone(&pc) });
        let driver = tokio::spawn(drive_signaling(negotiator, links, cancel.clone()));

        *self
            .conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(RtcConnection {
            socket,
            pc,
            dc,
            driver,
            cancel,
        });

        Ok(events_rx)
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        let (out_tx, _) = self.handles()?;
        out_tx
            .send(Outbound::Frame(Outgoing::Text(text.to_string())))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn send_binary(&self, frame: Bytes) -> Result<(), TransportError> {
        if !self.media_ready() {
            return Err(TransportError::NotConnected);
        }
        let (_, dc) = self.handles()?;
        dc.send(&frame)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn media_ready(&self) -> bool {
        self.media_ready.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.media_ready.store(false, Ordering::Release);
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(mut conn) = conn {
            log::debug!("[WebRTC] Closing");
            conn.cancel.cancel();
            conn.socket.close().await;
            // The driver closes the peer connection on its way out.
            if tokio::time::timeout(LOOP_SHUTDOWN_TIMEOUT, &mut conn.driver)
                .await
                .is_err()
            {
                log::warn!("[WebRTC] Signaling driver did not stop, closing peer connection directly");
                if let Err(e) = conn.pc.close().await {
                    log::debug!("[WebRTC] Peer connection close failed: {e}");
                }
            }
        }
    }
}
