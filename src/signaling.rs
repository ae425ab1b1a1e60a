//! Offer/answer/ICE signaling state for the WebRTC transport.
//!
//! ```text
//! Idle ──connected──▶ Connected ──offer sent──▶ OfferSent ──answer──▶ AnswerReceived
//!                                                                        │
//!                                             MediaEstablished ◀──media──┘
//! ```
//!
//! [`Signaling`] is pure bookkeeping: it returns the control messages to
//! put on the signaling socket and never touches I/O. Local ICE candidates
//! discovered before the offer goes out are held in FIFO order and released
//! right behind the offer; after that every candidate passes straight
//! through. Remote candidates are never buffered.
//!
//! The media stack itself sits behind [`MediaNegotiator`] so the driver in
//! `transport::webrtc` can be exercised with a fake.

use async_trait::async_trait;
use std::collections::VecDeque;

use crate::protocol::{ClientMessage, IceCandidatePayload};

/// Signaling progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// Signaling socket not connected.
    Idle,
    /// Signaling socket up, no offer yet.
    Connected,
    /// Local offer transmitted.
    OfferSent,
    /// Remote answer applied.
    AnswerReceived,
    /// Media path usable.
    MediaEstablished,
}

impl std::fmt::Display for SignalingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connected => "connected",
            Self::OfferSent => "offer-sent",
            Self::AnswerReceived => "answer-received",
            Self::MediaEstablished => "media-established",
        };
        f.write_str(name)
    }
}

/// A local ICE candidate awaiting transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingIceCandidate {
    /// SDP candidate line.
    pub candidate: String,
    /// Media stream identification tag.
    pub sdp_mid: Option<String>,
    /// Index of the m-line the candidate belongs to.
    pub sdp_mline_index: Option<u16>,
}

impl From<PendingIceCandidate> for IceCandidatePayload {
    fn from(c: PendingIceCandidate) -> Self {
        Self {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
        }
    }
}

impl From<IceCandidatePayload> for PendingIceCandidate {
    fn from(c: IceCandidatePayload) -> Self {
        Self {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
        }
    }
}

/// Signaling failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Event not valid in the current state.
    InvalidTransition {
        /// State at the time.
        from: SignalingState,
        /// What was attempted.
        event: &'static str,
    },
    /// The media stack rejected an offer, answer or candidate.
    Media(String),
}

impl std::fmt::Display for SignalingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidTransition { from, event } => {
                write!(f, "Invalid signaling transition: {event} while {from}")
            }
            Self::Media(msg) => write!(f, "Media negotiation error: {msg}"),
        }
    }
}

impl std::error::Error for SignalingError {}

/// SDP/ICE primitives supplied by a media stack.
#[async_trait]
pub trait MediaNegotiator: Send + Sync {
    /// Create a local offer, apply it locally and return its SDP.
    ///
    /// Local candidate gathering starts here.
    async fn create_offer(&self) -> Result<String, SignalingError>;

    /// Apply the remote answer.
    async fn apply_answer(&self, sdp: &str) -> Result<(), SignalingError>;

    /// Apply a remote ICE candidate.
    async fn add_remote_candidate(&self, candidate: PendingIceCandidate) -> Result<(), SignalingError>;

    /// Tear down the media session.
    async fn close(&self);
}

/// Signaling state plus the pre-offer candidate buffer.
#[derive(Debug)]
pub struct Signaling {
    state: SignalingState,
    buffered: VecDeque<PendingIceCandidate>,
    bypass_buffer: bool,
}

impl Default for Signaling {
    fn default() -> Self {
        Self::new()
    }
}

impl Signaling {
    /// Start in [`SignalingState::Idle`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: SignalingState::Idle,
            buffered: VecDeque::new(),
            bypass_buffer: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> SignalingState {
        self.state
    }

    /// Candidates waiting for the offer.
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// The signaling socket connected.
    pub fn on_signaling_connected(&mut self) -> Result<(), SignalingError> {
        self.expect(SignalingState::Idle, "signaling connected")?;
        self.state = SignalingState::Connected;
        Ok(())
    }

    /// The local stack discovered a candidate.
    ///
    /// Returns the message to send now, or `None` if it was buffered.
    pub fn on_local_candidate(&mut self, candidate: PendingIceCandidate) -> Option<ClientMessage> {
        if self.bypass_buffer {
            return Some(ClientMessage::IceCandidate {
                candidate: candidate.into(),
            });
        }
        log::debug!("[WebRTC] Buffering local ICE candidate until offer is sent");
        self.buffered.push_back(candidate);
        None
    }

    /// Emit the offer followed by every buffered candidate in discovery order.
    ///
    /// The buffer is bypassed from here on.
    pub fn send_offer(&mut self, sdp: String) -> Result<Vec<ClientMessage>, SignalingError> {
        self.expect(SignalingState::Connected, "send offer")?;
        self.state = SignalingState::OfferSent;
        self.bypass_buffer = true;

        let mut out = Vec::with_capacity(1 + self.buffered.len());
        out.push(ClientMessage::Offer { sdp });
        out.extend(self.buffered.drain(..).map(|c| ClientMessage::IceCandidate {
            candidate: c.into(),
        }));
        if out.len() > 1 {
            log::debug!("[WebRTC] Flushing {} buffered ICE candidates", out.len() - 1);
        }
        Ok(out)
    }

    /// The remote answer arrived.
    pub fn on_answer(&mut self) -> Result<(), SignalingError> {
        self.expect(SignalingState::OfferSent, "answer")?;
        self.state = SignalingState::AnswerReceived;
        Ok(())
    }

    /// A remote candidate arrived; valid any time after signaling connects.
    pub fn on_remote_candidate(&self) -> Result<(), SignalingError> {
        if self.state == SignalingState::Idle {
            return Err(SignalingError::InvalidTransition {
                from: self.state,
                event: "remote candidate",
            });
        }
        Ok(())
    }

    /// The media path reported connected. Returns `true` the first time.
    pub fn on_media_connected(&mut self) -> bool {
        if self.state == SignalingState::MediaEstablished {
            return false;
        }
        if self.state != SignalingState::AnswerReceived {
            log::warn!("[WebRTC] Media connected while {}", self.state);
        }
        self.state = SignalingState::MediaEstablished;
        true
    }

    /// Back to `Idle` with an empty buffer.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    fn expect(&self, state: SignalingState, event: &'static str) -> Result<(), SignalingError> {
        if self.state == state {
            Ok(())
        } else {
            Err(SignalingError::InvalidTransition {
                from: self.state,
                event,
            })
        }
    }
}
