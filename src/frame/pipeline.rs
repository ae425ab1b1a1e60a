//! Outbound frame send loop.
//!
//! One tokio task per started pipeline ticks at `1 / fps`, pulls one encoded
//! frame from the [`FrameSource`] and hands it to the transport as a binary
//! message. A failed capture or send is counted and skipped; only
//! cancellation ends the loop.
//!
//! Starting is idempotent: the first trigger flips the `running` flag with a
//! compare-exchange and spawns the task, every later trigger is a no-op
//! until [`FramePipeline::stop`] has fully released the flag.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{FrameRate, FrameSource};
use crate::constants::LOOP_SHUTDOWN_TIMEOUT;
use crate::transport::Transport;

/// Shared handle to the host's frame source.
pub type SharedFrameSource = Arc<Mutex<Box<dyn FrameSource>>>;

/// What asked the pipeline to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartTrigger {
    /// Server `ready` on a transport whose media path is already usable.
    Ready,
    /// The WebRTC media path reported connected.
    MediaConnected,
    /// Server `generation_started`.
    GenerationStarted,
    /// Explicit host call.
    Manual,
}

impl std::fmt::Display for StartTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::MediaConnected => write!(f, "media-connected"),
            Self::GenerationStarted => write!(f, "generation-started"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Pipeline counters snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PipelineStats {
    /// Frames handed to the transport successfully.
    pub frames_sent: u64,
    /// Captures or sends that failed and were skipped.
    pub frames_failed: u64,
    /// Inbound frames presented to the sink.
    pub frames_displayed: u64,
    /// Inbound frames discarded by latest-wins draining.
    pub frames_dropped: u64,
    /// Inbound frames the sink failed to decode.
    pub decode_failures: u64,
    /// Send rate measured over the last full second.
    pub effective_fps: f64,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    failed: AtomicU64,
    displayed: AtomicU64,
    dropped: AtomicU64,
    decode_failures: AtomicU64,
    effective_fps_bits: AtomicU64,
}

/// Idempotently startable frame send loop.
#[derive(Debug, Default)]
pub struct FramePipeline {
    running: Arc<AtomicBool>,
    started_by: Mutex<Option<StartTrigger>>,
    task: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
    counters: Arc<Counters>,
}

impl FramePipeline {
    /// Create a stopped pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a send loop currently owns the pipeline.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Trigger that started the current loop.
    pub fn started_by(&self) -> Option<StartTrigger> {
        *lock(&self.started_by)
    }

    /// Start the send loop. Returns `false` if one is already running.
    pub fn start(
        &self,
        trigger: StartTrigger,
        transport: Arc<dyn Transport>,
        source: SharedFrameSource,
        rate: FrameRate,
    ) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("[Pipeline] Start via {trigger} ignored, already running");
            return false;
        }

        *lock(&self.started_by) = Some(trigger);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(send_loop(
            transport,
            source,
            rate,
            cancel.clone(),
            Arc::clone(&self.counters),
        ));
        *lock(&self.task) = Some((handle, cancel));

        log::info!(
            "[Pipeline] Started via {trigger} at {:.2} fps",
            rate.fps()
        );
        true
    }

    /// Cancel the loop and wait (bounded) for it to exit, then release the flag.
    pub async fn stop(&self) {
        let task = lock(&self.task).take();
        if let Some((mut handle, cancel)) = task {
            cancel.cancel();
            if tokio::time::timeout(LOOP_SHUTDOWN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                log::warn!("[Pipeline] Send loop did not exit in time, aborting");
                handle.abort();
            }
        }
        *lock(&self.started_by) = None;
        self.running.store(false, Ordering::Release);
    }

    /// Cancel and abort without waiting. Used from `Drop`.
    pub fn abort(&self) {
        if let Some((handle, cancel)) = lock(&self.task).take() {
            cancel.cancel();
            handle.abort();
        }
        *lock(&self.started_by) = None;
        self.running.store(false, Ordering::Release);
    }

    /// Record one host-tick drain.
    pub fn record_display(&self, dropped: usize, decoded: bool) {
        self.counters
            .dropped
            .fetch_add(dropped as u64, Ordering::Relaxed);
        if decoded {
            self.counters.displayed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Counters snapshot.
    pub fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            frames_sent: c.sent.load(Ordering::Relaxed),
            frames_failed: c.failed.load(Ordering::Relaxed),
            frames_displayed: c.displayed.load(Ordering::Relaxed),
            frames_dropped: c.dropped.load(Ordering::Relaxed),
            decode_failures: c.decode_failures.load(Ordering::Relaxed),
            effective_fps: f64::from_bits(c.effective_fps_bits.load(Ordering::Relaxed)),
        }
    }

    /// Zero all counters.
    pub fn reset_stats(&self) {
        let c = &self.counters;
        for counter in [
            &c.sent,
            &c.failed,
            &c.displayed,
            &c.dropped,
            &c.decode_failures,
            &c.effective_fps_bits,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

async fn send_loop(
    transport: Arc<dyn Transport>,
    source: SharedFrameSource,
    rate: FrameRate,
    cancel: CancellationToken,
    counters: Arc<Counters>,
) {
    let mut ticker = tokio::time::interval(rate.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut window_start = Instant::now();
    let mut window_frames: u32 = 0;
    let mut unstable = false;
    let mut consecutive_failures: u32 = 0;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let frame = {
            let mut source = lock(&source);
            source.next_frame()
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("[Pipeline] Capture failed, skipping frame: {e:#}");
                counters.failed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        match transport.send_binary(frame).await {
            Ok(()) => {
                consecutive_failures = 0;
                counters.sent.fetch_add(1, Ordering::Relaxed);
                window_frames += 1;
            }
            Err(e) => {
                consecutive_failures += 1;
                counters.failed.fetch_add(1, Ordering::Relaxed);
                if consecutive_failures == 1 {
                    log::warn!("[Pipeline] Frame send failed, skipping: {e}");
                } else {
                    log::debug!("[Pipeline] Frame send failed ({consecutive_failures} in a row): {e}");
                }
            }
        }

        let elapsed = window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            let fps = f64::from(window_frames) / elapsed.as_secs_f64();
            counters
                .effective_fps_bits
                .store(fps.to_bits(), Ordering::Relaxed);
            let below = fps < f64::from(rate.stability_min);
            if below && !unstable {
                log::warn!(
                    "[Pipeline] Send rate {fps:.1} fps below stability minimum {:.1}",
                    rate.stability_min
                );
            } else if !below && unstable {
                log::info!("[Pipeline] Send rate recovered to {fps:.1} fps");
            }
            unstable = below;
            window_start = Instant::now();
            window_frames = 0;
        }
    }

    log::debug!("[Pipeline] Send loop exited");
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
