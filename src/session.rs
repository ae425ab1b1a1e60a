//! Session negotiator and lifecycle.
//!
//! # State machine
//!
//! ```text
//!                 connect              authenticate          ready
//! Disconnected ───────────▶ Connecting ───────────▶ Authenticating ─────▶ Ready
//!      ▲  ▲                     │                       │                  │ pipeline start
//!      │  │ connect             │ timeout/refused       │ error/close      ▼
//!      │  └──────────────── Failed ◀────────────────────┴────────────── Streaming
//!      │                        │
//!      └──── Closing ◀──── stop() (from any live state)
//! ```
//!
//! # Tasks
//!
//! - **receive loop**: one task per connection. Binary frames go to the
//!   [`LatestFrameQueue`]; text is parsed and dispatched on arrival.
//! - **send loop**: the [`FramePipeline`], started at most once per
//!   connection by whichever trigger gets there first.
//! - **host tick**: [`Session::tick`], driven by the caller, drains the
//!   inbound queue and flushes queued prompt changes.
//!
//! Shared state lives behind one mutex that is never held across an
//! `.await`; decisions are made under the lock and sends happen after it.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::constants::{
    CLOSE_GRACE, CONNECT_TIMEOUT, DEFAULT_INPUT_HEIGHT, DEFAULT_INPUT_WIDTH, EVENT_BUS_CAPACITY,
    USAGE_WARN_PERCENT,
};
use crate::error::SessionError;
use crate::events::{EventBus, SessionEvent};
use crate::frame::pipeline::SharedFrameSource;
use crate::frame::{FramePipeline, FrameRate, FrameSink, FrameSource, LatestFrameQueue, PipelineStats, StartTrigger};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::style::{ExtractionAction, PromptAction, StyleController, StyleState};
use crate::transport::{Transport, TransportEvent, TransportKind};
use crate::usage::{UsageInfo, UsageTracker};

/// Message returned by `authenticate` for an empty credential.
pub const NO_API_KEY: &str = "No API key configured";

/// Static parameters for a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Capture width sent frames are encoded at.
    pub input_width: u32,
    /// Capture height.
    pub input_height: u32,
    /// Send pacing.
    pub frame_rate: FrameRate,
    /// Default connect bound.
    pub connect_timeout: Duration,
    /// Bound on the graceful close handshake in `stop()`.
    pub close_grace: Duration,
    /// Usage percentage that raises a warning.
    pub usage_warn_percent: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            input_width: DEFAULT_INPUT_WIDTH,
            input_height: DEFAULT_INPUT_HEIGHT,
            frame_rate: FrameRate::default(),
            connect_timeout: CONNECT_TIMEOUT,
            close_grace: CLOSE_GRACE,
            usage_warn_percent: USAGE_WARN_PERCENT,
        }
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transport.
    Disconnected,
    /// Transport connecting, or connected and awaiting `authenticate`.
    Connecting,
    /// `auth` sent, waiting for `ready`.
    Authenticating,
    /// Server accepted; frames not flowing.
    Ready,
    /// Send loop running.
    Streaming,
    /// `stop()` in progress.
    Closing,
    /// Negotiation aborted or transport lost.
    Failed,
}

impl SessionState {
    /// Whether `self → next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use SessionState::{Authenticating, Closing, Connecting, Disconnected, Failed, Ready, Streaming};
        match (self, next) {
            (a, b) if a == b => true,
            (Disconnected | Failed, Connecting) => true,
            (Connecting, Authenticating) => true,
            (Authenticating, Ready) => true,
            (Ready, Streaming) => true,
            (Connecting | Authenticating | Ready | Streaming, Failed) => true,
            (Connecting | Authenticating | Ready | Streaming | Failed, Closing) => true,
            (Closing, Disconnected) => true,
            _ => false,
        }
    }

    /// Authenticated and usable for prompt and style traffic.
    #[must_use]
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Ready | Self::Streaming)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::Streaming => "streaming",
            Self::Closing => "closing",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Negotiation mode chosen at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionMode {
    /// Authenticate only; used to resolve a style from an image.
    ExtractionOnly,
    /// Start the send loop as soon as the session is ready.
    #[default]
    Full,
}

/// Parameters in effect for the current connection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NegotiatedParams {
    /// Capture width.
    pub input_width: u32,
    /// Capture height.
    pub input_height: u32,
    /// Output width from `ready`.
    pub output_width: Option<u32>,
    /// Output height from `ready`.
    pub output_height: Option<u32>,
    /// Send pacing.
    pub frame_rate: FrameRate,
    /// Connect bound used.
    pub connect_timeout: Duration,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    /// Lifecycle state.
    pub state: SessionState,
    /// Server-assigned id once ready.
    pub session_id: Option<String>,
    /// Negotiation mode.
    pub mode: SessionMode,
    /// Transport variant.
    pub transport: TransportKind,
    /// Negotiated parameters.
    pub params: NegotiatedParams,
    /// Latest quota snapshot.
    pub usage: Option<UsageInfo>,
    /// Active style.
    pub style: StyleState,
    /// Frame counters.
    pub pipeline: PipelineStats,
    /// Error that moved the session to `Failed`.
    pub last_error: Option<SessionError>,
}

impl SessionStatus {
    /// Authenticating, ready or streaming.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            SessionState::Authenticating | SessionState::Ready | SessionState::Streaming
        )
    }

    /// Frames are flowing.
    pub fn is_streaming(&self) -> bool {
        self.state == SessionState::Streaming
    }
}

/// What one host tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// A frame was handed to the sink and decoded.
    pub presented: bool,
    /// Older frames discarded this tick.
    pub dropped: usize,
    /// A queued prompt change was sent.
    pub prompt_sent: bool,
}

#[derive(Debug)]
struct Core {
    state: SessionState,
    mode: SessionMode,
    session_id: Option<String>,
    output: Option<(u32, u32)>,
    connect_timeout: Duration,
    style: StyleController,
    usage: UsageTracker,
    pending_auth: bool,
    last_error: Option<SessionError>,
    /// Bumped by every `connect`; a finished connect whose generation is
    /// stale must not install its connection.
    generation: u64,
    /// Cancels the connect currently in flight.
    connect_cancel: Option<CancellationToken>,
}

struct Shared {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    source: SharedFrameSource,
    core: Mutex<Core>,
    inbound: LatestFrameQueue,
    pipeline: FramePipeline,
    events: EventBus,
    state_tx: watch::Sender<SessionState>,
    receiver: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

/// A streaming session against the stylization service.
///
/// # Example
///
/// ```ignore
/// let session = Session::new(config, Arc::new(WebSocketTransport::new()), source);
/// session.connect(&endpoint, SessionMode::Full).await?;
/// session.authenticate(&api_key, "noir").await?;
/// session.wait_ready(Duration::from_secs(10)).await?;
/// loop {
///     session.tick(&mut sink).await;
/// }
/// ```
pub struct Session {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.shared.core();
        f.debug_struct("Session")
            .field("state", &core.state)
            .field("mode", &core.mode)
            .field("session_id", &core.session_id)
            .field("transport", &self.shared.transport.kind())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a disconnected session.
    pub fn new(config: SessionConfig, transport: Arc<dyn Transport>, source: Box<dyn FrameSource>) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let core = Core {
            state: SessionState::Disconnected,
            mode: SessionMode::Full,
            session_id: None,
            output: None,
            connect_timeout: config.connect_timeout,
            style: StyleController::default(),
            usage: UsageTracker::new(config.usage_warn_percent),
            pending_auth: false,
            last_error: None,
            generation: 0,
            connect_cancel: None,
        };
        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                source: Arc::new(Mutex::new(source)),
                core: Mutex::new(core),
                inbound: LatestFrameQueue::new(),
                pipeline: FramePipeline::new(),
                events: EventBus::new(EVENT_BUS_CAPACITY),
                state_tx,
                receiver: Mutex::new(None),
            }),
        }
    }

    /// Subscribe to session notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.shared.core().state
    }

    /// Server-assigned session id.
    pub fn session_id(&self) -> Option<String> {
        self.shared.core().session_id.clone()
    }

    /// Active style.
    pub fn style(&self) -> StyleState {
        self.shared.core().style.state().clone()
    }

    /// Latest quota snapshot.
    pub fn usage(&self) -> Option<UsageInfo> {
        self.shared.core().usage.current()
    }

    /// Authenticating, ready or streaming.
    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    /// Frames are flowing.
    pub fn is_streaming(&self) -> bool {
        self.state() == SessionState::Streaming
    }

    /// Snapshot of everything observable.
    pub fn status(&self) -> SessionStatus {
        let core = self.shared.core();
        SessionStatus {
            state: core.state,
            session_id: core.session_id.clone(),
            mode: core.mode,
            transport: self.shared.transport.kind(),
            params: NegotiatedParams {
                input_width: self.shared.config.input_width,
                input_height: self.shared.config.input_height,
                output_width: core.output.map(|(w, _)| w),
                output_height: core.output.map(|(_, h)| h),
                frame_rate: self.shared.config.frame_rate,
                connect_timeout: core.connect_timeout,
            },
            usage: core.usage.current(),
            style: core.style.state().clone(),
            pipeline: self.shared.pipeline.stats(),
            last_error: core.last_error.clone(),
        }
    }

    /// Connect with the configured timeout.
    pub async fn connect(&self, endpoint: &str, mode: SessionMode) -> Result<(), SessionError> {
        self.connect_with_timeout(endpoint, self.shared.config.connect_timeout, mode)
            .await
    }

    /// Open the transport, failing with a connect error after `timeout`.
    ///
    /// On success the session is `Connecting` until [`Self::authenticate`].
    pub async fn connect_with_timeout(
        &self,
        endpoint: &str,
        timeout: Duration,
        mode: SessionMode,
    ) -> Result<(), SessionError> {
        let shared = &self.shared;
        let (generation, cancel) = {
            let mut core = shared.core();
            if !matches!(core.state, SessionState::Disconnected | SessionState::Failed) {
                return Err(SessionError::Precondition(format!(
                    "cannot connect while {}",
                    core.state
                )));
            }
            core.mode = mode;
            core.session_id = None;
            core.output = None;
            core.connect_timeout = timeout;
            core.usage.reset();
            core.pending_auth = false;
            core.last_error = None;
            core.generation += 1;
            let cancel = CancellationToken::new();
            core.connect_cancel = Some(cancel.clone());
            shared.transition(&mut core, SessionState::Connecting);
            (core.generation, cancel)
        };
        shared.inbound.clear();
        shared.pipeline.reset_stats();

        log::info!(
            "[Session] Connecting via {} ({mode:?}) to {endpoint}",
            shared.transport.kind()
        );
        let attempt = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            result = tokio::time::timeout(timeout, shared.transport.connect(endpoint)) => Some(result),
        };
        let rx = match attempt {
            None => return Err(shared.abandon_connect(generation).await),
            Some(Ok(Ok(rx))) => rx,
            Some(Ok(Err(e))) => return Err(shared.fail_connect(generation, SessionError::from(e))),
            Some(Err(_)) => {
                // Drop whatever half-open connection the transport holds.
                shared.transport.close().await;
                return Err(shared.fail_connect(
                    generation,
                    SessionError::Connect(format!("connect timed out after {}s", timeout.as_secs_f32())),
                ));
            }
        };

        let installed = {
            let mut core = shared.core();
            let current = core.generation == generation && core.state == SessionState::Connecting;
            if current {
                core.connect_cancel = None;
                // Installed under the core lock so a concurrent stop() either
                // sees this receiver or has already made the attempt stale.
                let cancel = CancellationToken::new();
                let handle = tokio::spawn(receive_loop(Arc::clone(shared), rx, cancel.clone()));
                if let Some((old, old_cancel)) = shared.receiver_slot().replace((handle, cancel)) {
                    old_cancel.cancel();
                    old.abort();
                }
            }
            current
        };
        if !installed {
            return Err(shared.abandon_connect(generation).await);
        }
        log::info!("[Session] Transport connected");
        Ok(())
    }

    /// Send `auth`. Readiness arrives asynchronously; see [`Self::wait_ready`].
    ///
    /// An empty key fails locally without touching the transport. A prompt
    /// staged by [`Self::set_prompt`] before readiness wins over
    /// `initial_prompt`.
    pub async fn authenticate(&self, api_key: &str, initial_prompt: &str) -> Result<(), SessionError> {
        if api_key.trim().is_empty() {
            log::warn!("[Session] {NO_API_KEY}");
            return Err(SessionError::Auth(NO_API_KEY.to_string()));
        }

        let shared = &self.shared;
        let prompt = {
            let mut core = shared.core();
            if core.state != SessionState::Connecting || !shared.has_receiver() {
                return Err(SessionError::Precondition(format!(
                    "cannot authenticate while {}",
                    core.state
                )));
            }
            let prompt = core.style.take_auth_prompt(initial_prompt);
            core.pending_auth = true;
            shared.transition(&mut core, SessionState::Authenticating);
            prompt
        };

        log::info!("[Session] Authenticating");
        let msg = ClientMessage::Auth {
            prompt,
            api_key: api_key.to_string(),
        };
        if let Err(e) = shared.send(&msg).await {
            return Err(shared.fail(e));
        }
        Ok(())
    }

    /// Wait until `Ready`/`Streaming`, or fail with the reason negotiation stopped.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), SessionError> {
        let mut rx = self.shared.state_tx.subscribe();
        let wait = async {
            loop {
                let state = *rx.borrow_and_update();
                match state {
                    SessionState::Ready | SessionState::Streaming => return Ok(()),
                    SessionState::Failed => {
                        return Err(self
                            .shared
                            .core()
                            .last_error
                            .clone()
                            .unwrap_or_else(|| SessionError::Connect("session failed".to_string())));
                    }
                    SessionState::Disconnected | SessionState::Closing => {
                        return Err(SessionError::Precondition(format!("session is {state}")));
                    }
                    SessionState::Connecting | SessionState::Authenticating => {}
                }
                if rx.changed().await.is_err() {
                    return Err(SessionError::Precondition("session dropped".to_string()));
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or_else(|_| Err(SessionError::Connect("timed out waiting for ready".to_string())))
    }

    /// Change the text prompt: sent now when ready, otherwise staged for `authenticate`.
    pub async fn set_prompt(&self, text: &str, enhance: bool) -> Result<(), SessionError> {
        let action = {
            let mut core = self.shared.core();
            let ready = core.state.is_ready();
            core.style.set_prompt(text, enhance, ready)
        };
        self.shared.events.publish(SessionEvent::StyleChanged {
            prompt: text.to_string(),
            from_image: false,
        });
        match action {
            PromptAction::Send(msg) => {
                log::info!("[Style] Prompt -> {text:?}");
                self.shared.send(&msg).await
            }
            PromptAction::Staged => Ok(()),
        }
    }

    /// Queue a prompt change for the next [`Self::tick`].
    pub fn queue_prompt(&self, text: &str, enhance: bool) {
        self.shared.core().style.queue_prompt(text, enhance);
    }

    /// Ask the server to derive a style from `image` (encoded bytes).
    ///
    /// Returns `Ok(false)` when an extraction was already in flight and
    /// this image only replaced its target.
    pub async fn request_style_from_image(&self, image: &[u8], enhance: bool) -> Result<bool, SessionError> {
        let action = {
            let mut core = self.shared.core();
            if !core.state.is_ready() || core.session_id.is_none() {
                return Err(SessionError::Precondition("No active session".to_string()));
            }
            core.style.request_style_from_image(image, enhance)
        };
        match action {
            ExtractionAction::Superseded => Ok(false),
            ExtractionAction::Send(msg) => {
                log::info!("[Style] Requesting style extraction ({} bytes)", image.len());
                if let Err(e) = self.shared.send(&msg).await {
                    self.shared.core().style.on_extraction_failed();
                    return Err(e);
                }
                Ok(true)
            }
        }
    }

    /// Drop image-derived style locally.
    pub fn clear_image_style(&self) {
        self.shared.core().style.clear_image_style();
    }

    /// Manual start trigger. `Ok(false)` if a loop was already running.
    pub fn start_streaming(&self) -> Result<bool, SessionError> {
        let shared = &self.shared;
        let mut core = shared.core();
        if core.mode == SessionMode::ExtractionOnly {
            return Err(SessionError::Precondition(
                "extraction-only session; use promote_to_streaming".to_string(),
            ));
        }
        if !core.state.is_ready() {
            return Err(SessionError::Precondition(format!(
                "cannot stream while {}",
                core.state
            )));
        }
        if !shared.transport.media_ready() {
            return Err(SessionError::Precondition("media path not connected".to_string()));
        }
        Ok(shared.maybe_start(&mut core, StartTrigger::Manual))
    }

    /// Switch an extraction-only session to full streaming without renegotiating.
    ///
    /// Frames start now, or as soon as the media path connects.
    pub fn promote_to_streaming(&self) -> Result<(), SessionError> {
        let shared = &self.shared;
        let mut core = shared.core();
        if !core.state.is_ready() {
            return Err(SessionError::Precondition(format!(
                "cannot promote while {}",
                core.state
            )));
        }
        if core.mode == SessionMode::ExtractionOnly {
            log::info!("[Session] Promoting to full streaming");
            core.mode = SessionMode::Full;
        }
        shared.maybe_start(&mut core, StartTrigger::Manual);
        Ok(())
    }

    /// Host tick: present the newest inbound frame and flush a queued prompt.
    pub async fn tick<S: FrameSink + ?Sized>(&self, sink: &mut S) -> TickReport {
        let shared = &self.shared;
        let mut report = TickReport::default();

        if let Some(drained) = shared.inbound.drain_latest() {
            report.dropped = drained.dropped;
            if drained.dropped > 0 {
                shared.events.publish(SessionEvent::FramesDropped {
                    count: drained.dropped,
                });
            }
            report.presented = match sink.present(&drained.frame) {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("[Pipeline] Frame decode failed: {e:#}");
                    false
                }
            };
            shared.pipeline.record_display(drained.dropped, report.presented);
        }

        let queued = {
            let mut core = shared.core();
            let ready = core.state.is_ready();
            core.style.take_queued_update(ready)
        };
        if let Some(msg) = queued {
            match shared.send(&msg).await {
                Ok(()) => report.prompt_sent = true,
                Err(e) => log::warn!("[Style] Queued prompt not sent: {e}"),
            }
        }
        report
    }

    /// Tear everything down. Idempotent; bounded by the close grace.
    pub async fn stop(&self) {
        let shared = &self.shared;
        {
            let mut core = shared.core();
            if matches!(core.state, SessionState::Disconnected | SessionState::Closing) {
                return;
            }
            if let Some(connecting) = core.connect_cancel.take() {
                connecting.cancel();
            }
            shared.transition(&mut core, SessionState::Closing);
        }
        log::info!("[Session] Stopping");

        let receiver = shared.receiver_slot().take();
        if let Some((_, cancel)) = &receiver {
            cancel.cancel();
        }
        shared.pipeline.stop().await;

        if tokio::time::timeout(shared.config.close_grace, shared.transport.close())
            .await
            .is_err()
        {
            log::warn!("[Session] Close handshake exceeded grace period, forcing teardown");
        }

        if let Some((handle, _)) = receiver {
            handle.abort();
            let _ = handle.await;
        }

        shared.inbound.clear();
        {
            let mut core = shared.core();
            core.session_id = None;
            core.output = None;
            core.usage.reset();
            core.style.reset();
            core.pending_auth = false;
            core.last_error = None;
            shared.transition(&mut core, SessionState::Disconnected);
        }
        shared.pipeline.reset_stats();
        log::info!("[Session] Stopped");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some((handle, cancel)) = self.shared.receiver_slot().take() {
            cancel.cancel();
            handle.abort();
        }
        self.shared.pipeline.abort();
    }
}

impl Shared {
    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn receiver_slot(&self) -> MutexGuard<'_, Option<(JoinHandle<()>, CancellationToken)>> {
        self.receiver
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn has_receiver(&self) -> bool {
        self.receiver_slot().is_some()
    }

    fn transition(&self, core: &mut Core, to: SessionState) -> bool {
        let from = core.state;
        if from == to {
            return true;
        }
        if !from.can_transition_to(to) {
            log::error!("[Session] Refusing transition {from} -> {to}");
            return false;
        }
        log::debug!("[Session] {from} -> {to}");
        core.state = to;
        self.state_tx.send_replace(to);
        self.events.publish(SessionEvent::StateChanged(to));
        true
    }

    /// Record `err`, move to `Failed`, hand the error back.
    fn fail(&self, err: SessionError) -> SessionError {
        log::error!("[Session] {err}");
        let mut core = self.core();
        core.pending_auth = false;
        core.last_error = Some(err.clone());
        self.transition(&mut core, SessionState::Failed);
        err
    }

    /// Fail a connect attempt, unless `stop()` already moved on from it.
    fn fail_connect(&self, generation: u64, err: SessionError) -> SessionError {
        let current = {
            let mut core = self.core();
            let current = core.generation == generation && core.state == SessionState::Connecting;
            if current {
                core.connect_cancel = None;
            }
            current
        };
        if current {
            self.fail(err)
        } else {
            log::debug!("[Session] Stale connect failed after stop: {err}");
            SessionError::Precondition("connect cancelled by stop".to_string())
        }
    }

    /// A connect that `stop()` overtook: release anything it opened.
    async fn abandon_connect(&self, generation: u64) -> SessionError {
        log::info!("[Session] Connect cancelled by stop");
        let newer = self.core().generation != generation;
        if !newer {
            self.transport.close().await;
        }
        SessionError::Precondition("connect cancelled by stop".to_string())
    }

    async fn send(&self, msg: &ClientMessage) -> Result<(), SessionError> {
        let text = msg.to_json()?;
        log::debug!("[Session] -> {}", msg.kind());
        self.transport
            .send_text(&text)
            .await
            .map_err(SessionError::from)
    }

    /// Start the send loop if mode, state and media path allow it.
    fn maybe_start(&self, core: &mut Core, trigger: StartTrigger) -> bool {
        if core.mode != SessionMode::Full {
            log::debug!("[Pipeline] {trigger} ignored in extraction-only mode");
            return false;
        }
        if !core.state.is_ready() {
            log::debug!("[Pipeline] {trigger} ignored while {}", core.state);
            return false;
        }
        if !self.transport.media_ready() {
            log::info!("[Pipeline] {trigger} deferred until the media path connects");
            return false;
        }
        let started = self.pipeline.start(
            trigger,
            Arc::clone(&self.transport),
            Arc::clone(&self.source),
            self.config.frame_rate,
        );
        if started {
            self.transition(core, SessionState::Streaming);
            self.events.publish(SessionEvent::StreamingStarted { trigger });
        }
        started
    }

    fn handle_text(&self, text: &str) {
        let msg = match ServerMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("[Session] Dropping inbound message: {e}");
                return;
            }
        };

        match msg {
            ServerMessage::Ready {
                session_id,
                width,
                height,
                usage,
                warning,
            } => self.on_ready(session_id, width, height, usage, warning),
            ServerMessage::Error { message } => self.on_server_error(message),
            ServerMessage::StyleExtracted { prompt } => {
                log::info!("[Style] Extracted style: {prompt:?}");
                self.core().style.on_style_extracted(&prompt);
                self.events.publish(SessionEvent::StyleChanged {
                    prompt,
                    from_image: true,
                });
            }
            ServerMessage::PromptAck { success, error } => {
                if success {
                    log::debug!("[Style] Prompt acknowledged");
                } else {
                    log::warn!(
                        "[Style] Prompt rejected: {}",
                        error.as_deref().unwrap_or("no reason given")
                    );
                }
                self.events.publish(SessionEvent::PromptAck { success, error });
            }
            ServerMessage::GenerationStarted => {
                log::info!("[Session] Generation started");
                let mut core = self.core();
                self.maybe_start(&mut core, StartTrigger::GenerationStarted);
            }
            ServerMessage::Answer { .. } | ServerMessage::IceCandidate { .. } => {
                log::debug!("[Session] Ignoring signaling message on a non-signaling transport");
            }
        }
    }

    fn on_ready(
        &self,
        session_id: String,
        width: Option<u32>,
        height: Option<u32>,
        usage: Option<UsageInfo>,
        warning: Option<String>,
    ) {
        let mut core = self.core();
        if !matches!(
            core.state,
            SessionState::Authenticating | SessionState::Ready | SessionState::Streaming
        ) {
            log::warn!("[Session] Ignoring ready while {}", core.state);
            return;
        }

        let output = (
            width.unwrap_or(self.config.input_width),
            height.unwrap_or(self.config.input_height),
        );
        log::info!(
            "[Session] Ready: session {session_id}, output {}x{}",
            output.0,
            output.1
        );
        core.session_id = Some(session_id.clone());
        core.output = Some(output);
        core.pending_auth = false;

        if let Some(info) = usage {
            let notice = core.usage.update_usage(
                info.seconds_used,
                info.seconds_limit,
                info.seconds_remaining,
            );
            if let Some(notice) = notice {
                self.events.publish(SessionEvent::Usage(notice));
            }
        }
        if let Some(text) = warning.filter(|w| !w.trim().is_empty()) {
            let notice = core.usage.handle_warning(&text);
            self.events.publish(SessionEvent::Usage(notice));
        }

        if core.state == SessionState::Authenticating {
            self.transition(&mut core, SessionState::Ready);
        }
        self.events.publish(SessionEvent::Ready {
            session_id,
            width: output.0,
            height: output.1,
        });
        self.maybe_start(&mut core, StartTrigger::Ready);
    }

    fn on_server_error(&self, message: String) {
        log::error!("[Session] Server error: {message}");
        let failed_auth = {
            let mut core = self.core();
            if core.style.state().extracting {
                core.style.on_extraction_failed();
                self.events
                    .publish(SessionEvent::StyleExtractionFailed(message.clone()));
            }
            core.pending_auth
        };
        self.events.publish(SessionEvent::ServerError(message.clone()));
        if failed_auth {
            self.fail(SessionError::Server(message));
        }
    }

    async fn on_transport_closed(&self, reason: String) {
        {
            let mut core = self.core();
            if matches!(core.state, SessionState::Closing | SessionState::Disconnected) {
                return;
            }
            log::warn!("[Session] Transport closed: {reason}");
            core.pending_auth = false;
            core.last_error = Some(SessionError::Transport(reason.clone()));
            self.transition(&mut core, SessionState::Failed);
        }
        self.pipeline.stop().await;
        self.events.publish(SessionEvent::Disconnected { reason });
    }
}

async fn receive_loop(shared: Arc<Shared>, mut rx: mpsc::Receiver<TransportEvent>, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = rx.recv() => event,
        };
        match event {
            Some(TransportEvent::Binary(frame)) => shared.inbound.push(frame),
            Some(TransportEvent::Text(text)) => shared.handle_text(&text),
            Some(TransportEvent::MediaConnected) => {
                log::info!("[Session] Media path connected");
                let mut core = shared.core();
                shared.maybe_start(&mut core, StartTrigger::MediaConnected);
            }
            Some(TransportEvent::Closed { code, reason }) => {
                shared
                    .on_transport_closed(format!("closed ({code}) {reason}").trim_end().to_string())
                    .await;
                break;
            }
            Some(TransportEvent::Error(e)) => {
                shared.on_transport_closed(e).await;
                break;
            }
            None => {
                shared.on_transport_closed("transport ended".to_string()).await;
                break;
            }
        }
    }
    log::debug!("[Session] Receive loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::RecordingTransport;
    use crate::transport::TransportError;
    use crate::usage::UsageNotice;
    use bytes::Bytes;
    use serde_json::json;

    struct Counter(u32);

    impl FrameSource for Counter {
        fn next_frame(&mut self) -> anyhow::Result<Bytes> {
            self.0 += 1;
            Ok(Bytes::copy_from_slice(&self.0.to_be_bytes()))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        frames: Vec<Vec<u8>>,
        fail: bool,
    }

    impl FrameSink for RecordingSink {
        fn present(&mut self, frame: &[u8]) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("not a jpeg");
            }
            self.frames.push(frame.to_vec());
            Ok(())
        }
    }

    const ENDPOINT: &str = "ws://test.invalid/stream";

    fn session_with(transport: &Arc<RecordingTransport>) -> Session {
        let config = SessionConfig {
            frame_rate: FrameRate::per_second(30),
            ..SessionConfig::default()
        };
        let transport: Arc<dyn Transport> = Arc::clone(transport) as Arc<dyn Transport>;
        Session::new(config, transport, Box::new(Counter(0)))
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    async fn ready_session(mode: SessionMode) -> (Arc<RecordingTransport>, Session) {
        let transport = Arc::new(RecordingTransport::new());
        let session = session_with(&transport);
        session.connect(ENDPOINT, mode).await.unwrap();
        session.authenticate("ak_test", "noir").await.unwrap();
        transport
            .inject_json(json!({"type": "ready", "session_id": "s1", "width": 1280, "height": 720}))
            .await;
        session.wait_ready(Duration::from_secs(1)).await.unwrap();
        (transport, session)
    }

    #[tokio::test]
    async fn test_empty_api_key_fails_locally_without_sending() {
        let transport = Arc::new(RecordingTransport::new());
        let session = session_with(&transport);
        session.connect(ENDPOINT, SessionMode::Full).await.unwrap();

        for key in ["", "   "] {
            assert_eq!(
                session.authenticate(key, "noir").await,
                Err(SessionError::Auth("No API key configured".into()))
            );
        }
        assert!(transport.sent_texts().is_empty());
        assert_eq!(session.state(), SessionState::Connecting);
    }

    #[tokio::test]
    async fn test_empty_api_key_checked_before_connection() {
        let transport = Arc::new(RecordingTransport::new());
        let session = session_with(&transport);
        assert!(matches!(
            session.authenticate("", "noir").await,
            Err(SessionError::Auth(_))
        ));
        assert_eq!(transport.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_scenario_streams_within_one_interval() {
        let transport = Arc::new(RecordingTransport::new());
        let session = session_with(&transport);
        let mut events = session.subscribe();

        session.connect(ENDPOINT, SessionMode::Full).await.unwrap();
        session.authenticate("ak_test", "noir").await.unwrap();
        assert_eq!(
            transport.sent_json(),
            vec![json!({"type": "auth", "prompt": "noir", "api_key": "ak_test"})]
        );

        transport
            .inject_json(json!({"type": "ready", "session_id": "s1", "width": 1280, "height": 720}))
            .await;
        session.wait_ready(Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(FrameRate::per_second(30).interval()).await;

        assert!(transport.binary_count() >= 1);
        let status = session.status();
        assert!(status.is_streaming());
        assert_eq!(status.session_id.as_deref(), Some("s1"));
        assert_eq!(status.params.output_width, Some(1280));
        assert_eq!(status.params.output_height, Some(720));

        let events = drain(&mut events);
        assert!(events.contains(&SessionEvent::Ready {
            session_id: "s1".into(),
            width: 1280,
            height: 720
        }));
        assert!(events.contains(&SessionEvent::StreamingStarted {
            trigger: StartTrigger::Ready
        }));
        session.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_racing_start_triggers_run_one_loop() {
        let (transport, session) = ready_session(SessionMode::Full).await;

        assert_eq!(session.start_streaming(), Ok(false));
        transport.inject_json(json!({"type": "generation_started"})).await;
        transport.inject(TransportEvent::MediaConnected).await;

        tokio::time::sleep(Duration::from_millis(990)).await;
        let sent = transport.binary_count();
        // 30 fps for just under a second, first tick immediate.
        assert!((29..=31).contains(&sent), "sent {sent}");
        session.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_connected_starts_webrtc_session() {
        let transport = Arc::new(RecordingTransport::with_kind(TransportKind::WebRtc));
        let session = session_with(&transport);
        let mut events = session.subscribe();
        session.connect(ENDPOINT, SessionMode::Full).await.unwrap();
        session.authenticate("ak_test", "noir").await.unwrap();
        transport
            .inject_json(json!({"type": "ready", "session_id": "s1"}))
            .await;
        session.wait_ready(Duration::from_secs(1)).await.unwrap();

        // Media path not up yet: ready alone does not start frames.
        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.start_streaming().is_err());

        transport.set_media_ready(true);
        transport.inject(TransportEvent::MediaConnected).await;
        transport.inject_json(json!({"type": "generation_started"})).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(session.is_streaming());
        let starts: Vec<_> = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::StreamingStarted { .. }))
            .collect();
        assert_eq!(
            starts,
            vec![SessionEvent::StreamingStarted {
                trigger: StartTrigger::MediaConnected
            }]
        );
        session.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_started_deferred_until_media_connects() {
        let transport = Arc::new(RecordingTransport::with_kind(TransportKind::WebRtc));
        let session = session_with(&transport);
        let mut events = session.subscribe();
        session.connect(ENDPOINT, SessionMode::Full).await.unwrap();
        session.authenticate("ak_test", "noir").await.unwrap();
        transport
            .inject_json(json!({"type": "ready", "session_id": "s1"}))
            .await;
        session.wait_ready(Duration::from_secs(1)).await.unwrap();

        transport.inject_json(json!({"type": "generation_started"})).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(transport.binary_count(), 0);

        transport.set_media_ready(true);
        transport.inject(TransportEvent::MediaConnected).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(session.is_streaming());
        assert!(transport.binary_count() >= 1);
        assert!(drain(&mut events).contains(&SessionEvent::StreamingStarted {
            trigger: StartTrigger::MediaConnected
        }));
        session.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_extraction_only_then_promote() {
        let (transport, session) = ready_session(SessionMode::ExtractionOnly).await;
        let mut events = session.subscribe();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.binary_count(), 0);
        assert_eq!(session.state(), SessionState::Ready);

        assert_eq!(session.request_style_from_image(b"\xff\xd8\xff", false).await, Ok(true));
        assert_eq!(session.request_style_from_image(b"second", false).await, Ok(false));
        assert_eq!(transport.sent_types(), vec!["auth", "image_prompt"]);

        transport
            .inject_json(json!({"type": "style_extracted", "prompt": "P"}))
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let style = session.style();
        assert_eq!(style.prompt, "P");
        assert!(style.using_image_style);
        assert!(!style.extracting);
        // Extraction never starts the send loop by itself.
        assert_eq!(transport.binary_count(), 0);
        assert!(drain(&mut events).contains(&SessionEvent::StyleChanged {
            prompt: "P".into(),
            from_image: true
        }));

        session.promote_to_streaming().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(session.is_streaming());
        assert!(transport.binary_count() >= 1);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_style_request_without_session_is_precondition() {
        let transport = Arc::new(RecordingTransport::new());
        let session = session_with(&transport);
        assert_eq!(
            session.request_style_from_image(b"img", false).await,
            Err(SessionError::Precondition("No active session".into()))
        );
        session.connect(ENDPOINT, SessionMode::ExtractionOnly).await.unwrap();
        assert!(matches!(
            session.request_style_from_image(b"img", false).await,
            Err(SessionError::Precondition(_))
        ));
    }

    #[tokio::test]
    async fn test_server_error_fails_pending_auth_without_closing() {
        let transport = Arc::new(RecordingTransport::new());
        let session = session_with(&transport);
        let mut events = session.subscribe();
        session.connect(ENDPOINT, SessionMode::Full).await.unwrap();
        session.authenticate("ak_bad", "noir").await.unwrap();

        transport
            .inject_json(json!({"type": "error", "message": "invalid key"}))
            .await;
        assert_eq!(
            session.wait_ready(Duration::from_secs(1)).await,
            Err(SessionError::Server("invalid key".into()))
        );
        assert_eq!(session.state(), SessionState::Failed);
        assert!(!session.is_connected());
        assert_eq!(transport.close_count(), 0);
        assert!(drain(&mut events).contains(&SessionEvent::ServerError("invalid key".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_after_ready_fails_extraction_only() {
        let (transport, session) = ready_session(SessionMode::ExtractionOnly).await;
        let mut events = session.subscribe();
        session.request_style_from_image(b"img", true).await.unwrap();

        transport
            .inject_json(json!({"type": "error", "message": "image too large"}))
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(session.state(), SessionState::Ready);
        assert!(!session.style().extracting);
        let events = drain(&mut events);
        assert!(events.contains(&SessionEvent::StyleExtractionFailed("image too large".into())));
        assert!(events.contains(&SessionEvent::ServerError("image too large".into())));
        session.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_then_connect_starts_clean() {
        let (transport, session) = ready_session(SessionMode::Full).await;
        transport
            .inject_json(json!({"type": "ready", "session_id": "s1",
                "usage": {"seconds_used": 10.0, "seconds_limit": 100.0, "seconds_remaining": 90.0}}))
            .await;
        transport
            .inject_json(json!({"type": "style_extracted", "prompt": "P"}))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.usage().is_some());

        session.stop().await;
        session.stop().await;
        assert_eq!(transport.close_count(), 1);

        session.connect(ENDPOINT, SessionMode::Full).await.unwrap();
        let status = session.status();
        assert_eq!(status.state, SessionState::Connecting);
        assert_eq!(status.session_id, None);
        assert_eq!(status.usage, None);
        assert_eq!(status.style, StyleState::default());
        assert_eq!(status.pipeline.frames_sent, 0);
        assert!(status.last_error.is_none());
        assert_eq!(transport.connect_count(), 2);
        session.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_send_loop() {
        let (transport, session) = ready_session(SessionMode::Full).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        session.stop().await;
        let sent = transport.binary_count();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(transport.binary_count(), sent);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_is_connect_error() {
        let transport = Arc::new(RecordingTransport::new());
        transport.delay_connect(Duration::from_secs(30));
        let session = session_with(&transport);

        let err = session
            .connect_with_timeout(ENDPOINT, Duration::from_millis(50), SessionMode::Full)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Connect(_)));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.status().last_error, Some(err));
    }

    #[tokio::test]
    async fn test_connect_refused_is_connect_error() {
        let transport = Arc::new(RecordingTransport::new());
        transport.fail_connect(TransportError::ConnectionFailed("refused".into()));
        let session = session_with(&transport);
        assert_eq!(
            session.connect(ENDPOINT, SessionMode::Full).await,
            Err(SessionError::Connect("refused".into()))
        );
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_double_connect_is_precondition() {
        let transport = Arc::new(RecordingTransport::new());
        let session = session_with(&transport);
        session.connect(ENDPOINT, SessionMode::Full).await.unwrap();
        assert!(matches!(
            session.connect(ENDPOINT, SessionMode::Full).await,
            Err(SessionError::Precondition(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_in_flight_connect() {
        let transport = Arc::new(RecordingTransport::new());
        transport.delay_connect(Duration::from_millis(200));
        let session = Arc::new(session_with(&transport));

        let connecting = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.connect(ENDPOINT, SessionMode::Full).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.state(), SessionState::Connecting);

        session.stop().await;
        let result = connecting.await.unwrap();
        assert!(matches!(result, Err(SessionError::Precondition(_))));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.shared.has_receiver());
        assert!(transport.close_count() >= 1);

        // Nothing from the abandoned attempt lingers past its original deadline.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.shared.has_receiver());

        transport.delay_connect(Duration::ZERO);
        session.connect(ENDPOINT, SessionMode::Full).await.unwrap();
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.shared.has_receiver());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_message_is_dropped() {
        let transport = Arc::new(RecordingTransport::new());
        let session = session_with(&transport);
        session.connect(ENDPOINT, SessionMode::ExtractionOnly).await.unwrap();
        session.authenticate("ak_test", "").await.unwrap();

        transport.inject(TransportEvent::Text("{not json".into())).await;
        transport.inject_json(json!({"type": "telemetry"})).await;
        transport
            .inject_json(json!({"type": "ready", "session_id": "s2"}))
            .await;
        session.wait_ready(Duration::from_secs(1)).await.unwrap();
        assert_eq!(session.session_id().as_deref(), Some("s2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_close_fails_session() {
        let (transport, session) = ready_session(SessionMode::Full).await;
        let mut events = session.subscribe();

        transport
            .inject(TransportEvent::Closed {
                code: 1011,
                reason: "overloaded".into(),
            })
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let status = session.status();
        assert_eq!(status.state, SessionState::Failed);
        assert!(!status.is_connected());
        assert!(!status.is_streaming());
        assert!(matches!(status.last_error, Some(SessionError::Transport(_))));
        assert!(drain(&mut events)
            .iter()
            .any(|e| matches!(e, SessionEvent::Disconnected { reason } if reason.contains("overloaded"))));

        let sent = transport.binary_count();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(transport.binary_count(), sent);

        // No automatic reconnect.
        assert_eq!(transport.connect_count(), 1);
        session.stop().await;
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_presents_newest_frame() {
        let (transport, session) = ready_session(SessionMode::ExtractionOnly).await;
        let mut events = session.subscribe();
        for b in [b"f1", b"f2", b"f3"] {
            transport
                .inject(TransportEvent::Binary(Bytes::from_static(b)))
                .await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut sink = RecordingSink::default();
        let report = session.tick(&mut sink).await;
        assert!(report.presented);
        assert_eq!(report.dropped, 2);
        assert_eq!(sink.frames, vec![b"f3".to_vec()]);
        assert!(drain(&mut events).contains(&SessionEvent::FramesDropped { count: 2 }));

        let report = session.tick(&mut sink).await;
        assert!(!report.presented);

        let stats = session.status().pipeline;
        assert_eq!(stats.frames_displayed, 1);
        assert_eq!(stats.frames_dropped, 2);
        session.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_failure_does_not_stop_ticks() {
        let (transport, session) = ready_session(SessionMode::ExtractionOnly).await;
        let mut sink = RecordingSink {
            fail: true,
            ..RecordingSink::default()
        };
        transport.inject(TransportEvent::Binary(Bytes::from_static(b"x"))).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!session.tick(&mut sink).await.presented);

        sink.fail = false;
        transport.inject(TransportEvent::Binary(Bytes::from_static(b"y"))).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(session.tick(&mut sink).await.presented);
        assert_eq!(session.status().pipeline.decode_failures, 1);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_prompt_staged_before_auth_goes_in_auth() {
        let transport = Arc::new(RecordingTransport::new());
        let session = session_with(&transport);
        session.set_prompt("anime", false).await.unwrap();
        assert!(transport.sent_texts().is_empty());

        session.connect(ENDPOINT, SessionMode::Full).await.unwrap();
        session.authenticate("ak_test", "noir").await.unwrap();
        assert_eq!(transport.sent_json()[0]["prompt"], "anime");
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_prompt_when_ready_sends_now() {
        let (transport, session) = ready_session(SessionMode::ExtractionOnly).await;
        session.set_prompt("watercolor", true).await.unwrap();
        assert_eq!(
            transport.sent_json().last().unwrap(),
            &json!({"type": "prompt", "prompt": "watercolor", "enhance": true})
        );
        session.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_prompt_sent_on_tick() {
        let (transport, session) = ready_session(SessionMode::ExtractionOnly).await;
        session.queue_prompt("pastel", false);
        assert_eq!(transport.sent_types(), vec!["auth"]);

        let report = session.tick(&mut RecordingSink::default()).await;
        assert!(report.prompt_sent);
        assert_eq!(transport.sent_types(), vec!["auth", "prompt"]);
        assert_eq!(session.style().prompt, "pastel");
        session.stop().await;
    }

    #[tokio::test]
    async fn test_ready_usage_and_warning_both_raised() {
        let transport = Arc::new(RecordingTransport::new());
        let session = session_with(&transport);
        let mut events = session.subscribe();
        session.connect(ENDPOINT, SessionMode::ExtractionOnly).await.unwrap();
        session.authenticate("ak_test", "noir").await.unwrap();
        transport
            .inject_json(json!({
                "type": "ready",
                "session_id": "s1",
                "usage": {"seconds_used": 95.0, "seconds_limit": 100.0, "seconds_remaining": 5.0},
                "warning": "Almost out of minutes"
            }))
            .await;
        session.wait_ready(Duration::from_secs(1)).await.unwrap();

        let info = UsageInfo::new(95.0, 100.0, 5.0);
        let usage: Vec<_> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Usage(n) => Some(n),
                _ => None,
            })
            .collect();
        assert_eq!(
            usage,
            vec![
                UsageNotice::Warning {
                    usage: Some(info),
                    message: None
                },
                UsageNotice::Warning {
                    usage: Some(info),
                    message: Some("Almost out of minutes".into())
                },
            ]
        );
        assert_eq!(session.usage(), Some(info));
    }

    #[tokio::test]
    async fn test_prompt_ack_surfaced() {
        let transport = Arc::new(RecordingTransport::new());
        let session = session_with(&transport);
        let mut events = session.subscribe();
        session.connect(ENDPOINT, SessionMode::ExtractionOnly).await.unwrap();
        transport
            .inject_json(json!({"type": "prompt_ack", "success": false, "error": "nsfw"}))
            .await;
        transport
            .inject_json(json!({"type": "ready", "session_id": "late"}))
            .await;
        // Ready without authenticate is ignored; the ack is still surfaced.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(drain(&mut events).contains(&SessionEvent::PromptAck {
            success: false,
            error: Some("nsfw".into())
        }));
        assert_eq!(session.session_id(), None);
    }

    #[test]
    fn test_state_transition_table() {
        use SessionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Failed.can_transition_to(Connecting));
        assert!(Authenticating.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Streaming));
        assert!(Streaming.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Disconnected));

        assert!(!Disconnected.can_transition_to(Ready));
        assert!(!Streaming.can_transition_to(Ready));
        assert!(!Connecting.can_transition_to(Streaming));
        assert!(!Disconnected.can_transition_to(Closing));
    }
}
