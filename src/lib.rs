//! Stylestream - session engine for live AI stylization of camera frames.
//!
//! A client connects to the stylization service, authenticates, and then
//! streams encoded frames at a fixed rate while displaying whichever
//! stylized frame arrived most recently.
//!
//! # Architecture
//!
//! - **Session** - negotiates connect/auth/ready, owns the transport, runs
//!   the receive loop and the host tick
//! - **Frame pipeline** - paced send loop plus the latest-wins inbound queue
//! - **Style controller** - prompt staging and image-style extraction
//! - **Usage tracker** - quota snapshots and threshold notifications
//! - **Transport** - plain WebSocket, or WebSocket signaling with a WebRTC
//!   data channel
//!
//! # Modules
//!
//! - [`session`] - [`Session`] lifecycle and state machine
//! - [`transport`] - [`Transport`] trait and both variants
//! - [`signaling`] - offer/answer/ICE bookkeeping for WebRTC
//! - [`frame`] - send pacing, inbound queue, directory source/sink
//! - [`config`] - configuration loading/saving

pub mod config;
pub mod constants;
pub mod env;
pub mod error;
pub mod events;
pub mod frame;
pub mod keyring;
pub mod preferences;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod style;
pub mod transport;
pub mod usage;
pub mod ws;

// Re-export commonly used types
pub use config::Config;
pub use error::SessionError;
pub use events::SessionEvent;
pub use frame::{FrameRate, FrameSink, FrameSource};
pub use preferences::Preferences;
pub use session::{Session, SessionConfig, SessionMode, SessionState, SessionStatus};
pub use transport::{Transport, TransportKind};
pub use usage::{UsageInfo, UsageNotice};
