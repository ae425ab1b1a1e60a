//! Wire messages exchanged with the stylization service.
//!
//! Control messages are JSON objects discriminated by a `type` field and
//! travel as text frames. Camera and stylized frames travel as binary
//! messages with no header beyond the transport's own message boundary.
//!
//! # Client → server
//!
//! | type | fields |
//! |---|---|
//! | `auth` | `prompt`, `api_key` |
//! | `prompt` | `prompt`, `enhance` |
//! | `image_prompt` | `image_data` (base64), `enhance` |
//! | `offer` | `sdp` |
//! | `ice-candidate` | `candidate: {candidate, sdpMid, sdpMLineIndex}` |
//!
//! # Server → client
//!
//! | type | fields |
//! |---|---|
//! | `ready` | `session_id`, `width`, `height`, `usage?`, `warning?` |
//! | `error` | `message` |
//! | `style_extracted` | `prompt` |
//! | `answer` | `sdp` |
//! | `ice-candidate` | `candidate: {...}` |
//! | `prompt_ack` | `success`, `error?` |
//! | `generation_started` | — |

use serde::{Deserialize, Serialize};

use crate::usage::UsageInfo;

/// Type tags the client understands on inbound messages.
const KNOWN_SERVER_TYPES: &[&str] = &[
    "ready",
    "error",
    "style_extracted",
    "answer",
    "ice-candidate",
    "prompt_ack",
    "generation_started",
];

/// ICE candidate in the browser `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    /// Candidate line (`candidate:...`).
    pub candidate: String,
    /// Media stream identification tag.
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    /// Index of the m-line the candidate belongs to.
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

/// Message sent by the client.
#[derive(Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate and set the initial prompt.
    Auth {
        /// Initial style prompt.
        prompt: String,
        /// Service credential.
        api_key: String,
    },
    /// Change the active text prompt.
    Prompt {
        /// New prompt text.
        prompt: String,
        /// Ask the service to enhance the prompt.
        enhance: bool,
    },
    /// Ask the service to extract a style from a reference image.
    ImagePrompt {
        /// Base64-encoded image bytes.
        image_data: String,
        /// Ask the service to enhance the extracted prompt.
        enhance: bool,
    },
    /// Local SDP offer.
    Offer {
        /// Offer SDP.
        sdp: String,
    },
    /// Local ICE candidate.
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        /// Candidate payload.
        candidate: IceCandidatePayload,
    },
}

impl ClientMessage {
    /// Wire type tag, safe to log.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Prompt { .. } => "prompt",
            Self::ImagePrompt { .. } => "image_prompt",
            Self::Offer { .. } => "offer",
            Self::IceCandidate { .. } => "ice-candidate",
        }
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

// Manual impl keeps the API key and image payloads out of logs.
impl std::fmt::Debug for ClientMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auth { prompt, .. } => f
                .debug_struct("Auth")
                .field("prompt", prompt)
                .field("api_key", &"<redacted>")
                .finish(),
            Self::Prompt { prompt, enhance } => f
                .debug_struct("Prompt")
                .field("prompt", prompt)
                .field("enhance", enhance)
                .finish(),
            Self::ImagePrompt { image_data, enhance } => f
                .debug_struct("ImagePrompt")
                .field("image_data_len", &image_data.len())
                .field("enhance", enhance)
                .finish(),
            Self::Offer { sdp } => f.debug_struct("Offer").field("sdp_len", &sdp.len()).finish(),
            Self::IceCandidate { candidate } => f
                .debug_struct("IceCandidate")
                .field("candidate", candidate)
                .finish(),
        }
    }
}

/// Message received from the server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication accepted; session parameters negotiated.
    Ready {
        /// Server-assigned session id.
        session_id: String,
        /// Output width, if the server chose one.
        #[serde(default)]
        width: Option<u32>,
        /// Output height, if the server chose one.
        #[serde(default)]
        height: Option<u32>,
        /// Quota snapshot.
        #[serde(default)]
        usage: Option<UsageInfo>,
        /// Free-text warning to surface to the user.
        #[serde(default)]
        warning: Option<String>,
    },
    /// Request failed.
    Error {
        /// Human-readable reason.
        message: String,
    },
    /// Style resolved from a reference image.
    StyleExtracted {
        /// Prompt describing the extracted style.
        prompt: String,
    },
    /// Remote SDP answer.
    Answer {
        /// Answer SDP.
        sdp: String,
    },
    /// Remote ICE candidate.
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        /// Candidate payload.
        candidate: IceCandidatePayload,
    },
    /// Acknowledgement of a prompt change.
    PromptAck {
        /// Whether the prompt was applied.
        success: bool,
        /// Reason when not applied.
        #[serde(default)]
        error: Option<String>,
    },
    /// The service started producing stylized frames.
    GenerationStarted,
}

impl ServerMessage {
    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        match serde_json::from_str::<Self>(text) {
            Ok(msg) => Ok(msg),
            Err(e) => {
                let value: serde_json::Value = serde_json::from_str(text)
                    .map_err(|_| ProtocolError::Malformed(e.to_string()))?;
                match value.get("type").and_then(serde_json::Value::as_str) {
                    None => Err(ProtocolError::MissingType),
                    Some(t) if !KNOWN_SERVER_TYPES.contains(&t) => {
                        Err(ProtocolError::UnknownType(t.to_string()))
                    }
                    Some(_) => Err(ProtocolError::Malformed(e.to_string())),
                }
            }
        }
    }
}

/// Inbound message could not be understood.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Not JSON, or fields of the wrong shape.
    Malformed(String),
    /// JSON object without a `type` tag.
    MissingType,
    /// A `type` tag this client does not handle.
    UnknownType(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "malformed message: {msg}"),
            Self::MissingType => write!(f, "message has no type"),
            Self::UnknownType(t) => write!(f, "unknown message type: {t}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
