//! Latest-wins inbound frame queue.
//!
//! The receive loop pushes every binary message; the host tick drains.
//! On each drain only the newest frame survives, so display latency is
//! bounded at the cost of completeness.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Result of one drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drained {
    /// Newest frame at drain time.
    pub frame: Bytes,
    /// Older frames discarded by this drain.
    pub dropped: usize,
}

/// Mutex-protected queue with an effective depth of one at consumption.
#[derive(Debug, Default)]
pub struct LatestFrameQueue {
    frames: Mutex<VecDeque<Bytes>>,
}

impl LatestFrameQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame (producer side).
    pub fn push(&self, frame: Bytes) {
        self.lock().push_back(frame);
    }

    /// Take the newest frame, discarding everything older.
    pub fn drain_latest(&self) -> Option<Drained> {
        let mut frames = self.lock();
        let frame = frames.pop_back()?;
        let dropped = frames.len();
        frames.clear();
        Some(Drained { frame, dropped })
    }

    /// Number of frames waiting.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no frame is waiting.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Discard everything.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Bytes>> {
        // A panicking producer cannot leave a VecDeque half-updated.
        self.frames
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
