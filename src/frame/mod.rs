//! Frame pipeline: outbound capture/send pacing and inbound latest-wins display.
//!
//! # Architecture
//!
//! ```text
//! FrameSource ──(tick every 1/fps)──▶ FramePipeline ──▶ Transport::send_binary
//!
//! Transport receive loop ──▶ LatestFrameQueue ──(host tick)──▶ FrameSink
//!                               (drops all but newest)
//! ```
//!
//! Capturing and encoding (`FrameSource`) and decoding and displaying
//! (`FrameSink`) are collaborators supplied by the host. The pipeline only
//! moves opaque encoded buffers.

pub mod file;
pub mod pipeline;
pub mod queue;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{
    DEFAULT_FPS_DENOMINATOR, DEFAULT_FPS_NUMERATOR, DEFAULT_STABILITY_MIN_FPS, MIN_FRAME_INTERVAL,
};

pub use file::{DirectoryFrameSink, DirectoryFrameSource};
pub use pipeline::{FramePipeline, PipelineStats, StartTrigger};
pub use queue::LatestFrameQueue;

/// Target frame rate as a rational, plus the lowest rate considered stable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameRate {
    /// Frames per `denominator` seconds.
    pub numerator: u32,
    /// Seconds per `numerator` frames.
    pub denominator: u32,
    /// Effective rates below this are reported as unstable.
    pub stability_min: f32,
}

impl Default for FrameRate {
    fn default() -> Self {
        Self {
            numerator: DEFAULT_FPS_NUMERATOR,
            denominator: DEFAULT_FPS_DENOMINATOR,
            stability_min: DEFAULT_STABILITY_MIN_FPS,
        }
    }
}

impl FrameRate {
    /// Whole-number rate with the default stability minimum.
    #[must_use]
    pub fn per_second(fps: u32) -> Self {
        Self {
            numerator: fps,
            denominator: 1,
            ..Self::default()
        }
    }

    /// Frames per second. Zero parts are treated as 1.
    #[must_use]
    pub fn fps(&self) -> f64 {
        f64::from(self.numerator.max(1)) / f64::from(self.denominator.max(1))
    }

    /// Pacing interval, `1 / fps`, never shorter than [`MIN_FRAME_INTERVAL`].
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps()).max(MIN_FRAME_INTERVAL)
    }
}

/// Produces one encoded frame per pacing tick (camera capture + encode).
pub trait FrameSource: Send {
    /// Capture and encode the next frame.
    fn next_frame(&mut self) -> anyhow::Result<Bytes>;
}

/// Decodes and displays an inbound frame.
pub trait FrameSink {
    /// Decode and present `frame`.
    fn present(&mut self, frame: &[u8]) -> anyhow::Result<()>;
}
