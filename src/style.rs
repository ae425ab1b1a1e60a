//! Style/prompt bookkeeping.
//!
//! [`StyleController`] is pure state: it decides what, if anything, must go
//! on the wire and leaves the sending to the session. That keeps the
//! extraction race rules testable without a transport.
//!
//! # Extraction policy
//!
//! At most one `image_prompt` request is outstanding. A second image
//! submitted while one is in flight replaces the pending target but is not
//! sent, and the in-flight request is not cancelled: the eventual
//! `style_extracted` reply is applied as the style for whatever image was
//! requested last. Once an extraction has been outstanding longer than
//! [`STYLE_EXTRACTION_TIMEOUT`], a new request is sent normally.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::time::{Duration, Instant};

use crate::constants::STYLE_EXTRACTION_TIMEOUT;
use crate::protocol::ClientMessage;

/// Snapshot of the active style.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StyleState {
    /// Active prompt (text, or the prompt resolved from an image).
    pub prompt: String,
    /// Enhance flag sent with the active prompt.
    pub enhance: bool,
    /// An `image_prompt` request is outstanding.
    pub extracting: bool,
    /// The active prompt came from a resolved extraction.
    pub using_image_style: bool,
    /// Size of the image most recently submitted for extraction.
    pub pending_image_len: Option<usize>,
}

/// Outcome of a prompt change request.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptAction {
    /// Send this message now.
    Send(ClientMessage),
    /// Session not ready; applied on the next authenticate.
    Staged,
}

/// Outcome of an image extraction request.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionAction {
    /// Send this message now.
    Send(ClientMessage),
    /// A request is already in flight; the new image replaced its target.
    Superseded,
}

/// Tracks the active style and mediates changes against session readiness.
#[derive(Debug)]
pub struct StyleController {
    state: StyleState,
    pending_image: Option<Vec<u8>>,
    extracting_since: Option<Instant>,
    staged: Option<(String, bool)>,
    queued_update: Option<(String, bool)>,
    extraction_timeout: Duration,
}

impl Default for StyleController {
    fn default() -> Self {
        Self::new(STYLE_EXTRACTION_TIMEOUT)
    }
}

impl StyleController {
    /// Create a controller with a custom extraction timeout.
    #[must_use]
    pub fn new(extraction_timeout: Duration) -> Self {
        Self {
            state: StyleState::default(),
            pending_image: None,
            extracting_since: None,
            staged: None,
            queued_update: None,
            extraction_timeout,
        }
    }

    /// Current style snapshot.
    #[must_use]
    pub fn state(&self) -> &StyleState {
        &self.state
    }

    /// Image most recently submitted for extraction, if still pending.
    #[must_use]
    pub fn pending_image(&self) -> Option<&[u8]> {
        self.pending_image.as_deref()
    }

    /// Change the text prompt. Sends when `ready`, otherwise stages it.
    pub fn set_prompt(&mut self, text: &str, enhance: bool, ready: bool) -> PromptAction {
        self.state.prompt = text.to_string();
        self.state.enhance = enhance;
        self.state.using_image_style = false;

        if ready {
            self.staged = None;
            PromptAction::Send(ClientMessage::Prompt {
                prompt: text.to_string(),
                enhance,
            })
        } else {
            log::debug!("[Style] Session not ready, staging prompt");
            self.staged = Some((text.to_string(), enhance));
            PromptAction::Staged
        }
    }

    /// Prompt to send in the `auth` message.
    ///
    /// A staged prompt wins over `initial`; an empty `initial` falls back
    /// to the active prompt.
    pub fn take_auth_prompt(&mut self, initial: &str) -> String {
        if let Some((prompt, enhance)) = self.staged.take() {
            self.state.prompt.clone_from(&prompt);
            self.state.enhance = enhance;
            return prompt;
        }
        if !initial.is_empty() {
            self.state.prompt = initial.to_string();
        }
        self.state.prompt.clone()
    }

    /// Stage a prompt change from a non-async context; see [`Self::take_queued_update`].
    pub fn queue_prompt(&mut self, text: &str, enhance: bool) {
        self.queued_update = Some((text.to_string(), enhance));
    }

    /// Consume a queued prompt change, producing the message to send when `ready`.
    pub fn take_queued_update(&mut self, ready: bool) -> Option<ClientMessage> {
        let (text, enhance) = self.queued_update.take()?;
        match self.set_prompt(&text, enhance, ready) {
            PromptAction::Send(msg) => Some(msg),
            PromptAction::Staged => None,
        }
    }

    /// Request a style from a reference image.
    pub fn request_style_from_image(&mut self, image: &[u8], enhance: bool) -> ExtractionAction {
        self.pending_image = Some(image.to_vec());
        self.state.pending_image_len = Some(image.len());

        let in_flight = self.state.extracting
            && self
                .extracting_since
                .is_some_and(|since| since.elapsed() < self.extraction_timeout);
        if in_flight {
            log::debug!("[Style] Extraction in flight, replacing pending target");
            return ExtractionAction::Superseded;
        }
        if self.state.extracting {
            log::warn!("[Style] Previous extraction timed out, sending new request");
        }

        self.state.extracting = true;
        self.extracting_since = Some(Instant::now());
        ExtractionAction::Send(ClientMessage::ImagePrompt {
            image_data: BASE64.encode(image),
            enhance,
        })
    }

    /// Apply a `style_extracted` reply.
    pub fn on_style_extracted(&mut self, prompt: &str) {
        self.state.prompt = prompt.to_string();
        self.state.extracting = false;
        self.state.using_image_style = true;
        self.state.pending_image_len = None;
        self.pending_image = None;
        self.extracting_since = None;
    }

    /// The server rejected the outstanding extraction.
    pub fn on_extraction_failed(&mut self) {
        self.state.extracting = false;
        self.extracting_since = None;
    }

    /// Drop image-derived style without contacting the server.
    pub fn clear_image_style(&mut self) {
        self.state.using_image_style = false;
        self.state.extracting = false;
        self.state.pending_image_len = None;
        self.pending_image = None;
        self.extracting_since = None;
    }

    /// Back to initial values.
    pub fn reset(&mut self) {
        let timeout = self.extraction_timeout;
        *self = Self::new(timeout);
    }
}
