//! Protocol-wide constants.
//!
//! Centralizes the timeouts, pacing defaults, and thresholds used by the
//! session engine so tests and the CLI agree on the same values.
//!
//! # Categories
//!
//! - **Timeouts**: connect and close-handshake bounds
//! - **Pacing**: default frame rate and queue sizing
//! - **Usage**: quota warning threshold

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// Default bound on transport connect.
///
/// A connect that has not completed by then fails with a connect error.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period for a graceful close handshake during `stop()`.
///
/// After this the transport is torn down regardless of the peer.
pub const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// How long an image-style extraction may stay outstanding before a new
/// request is allowed to replace it on the wire.
pub const STYLE_EXTRACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on waiting for the pipeline task to exit after cancellation.
pub const LOOP_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

// ============================================================================
// Pacing
// ============================================================================

/// Default target frame rate numerator.
pub const DEFAULT_FPS_NUMERATOR: u32 = 30;

/// Default target frame rate denominator.
pub const DEFAULT_FPS_DENOMINATOR: u32 = 1;

/// Shortest pacing interval; faster configured rates are clamped to it.
pub const MIN_FRAME_INTERVAL: Duration = Duration::from_millis(1);

/// Default minimum frame rate considered stable.
pub const DEFAULT_STABILITY_MIN_FPS: f32 = 15.0;

/// Default capture resolution.
pub const DEFAULT_INPUT_WIDTH: u32 = 1280;

/// Default capture resolution.
pub const DEFAULT_INPUT_HEIGHT: u32 = 720;

/// Capacity of the transport → session event queue.
pub const TRANSPORT_EVENT_CAPACITY: usize = 256;

/// Capacity of the session notification bus.
pub const EVENT_BUS_CAPACITY: usize = 64;

// ============================================================================
// Usage
// ============================================================================

/// Usage percentage at or above which a warning is raised.
pub const USAGE_WARN_PERCENT: f64 = 80.0;
