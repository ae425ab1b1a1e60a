//! Quota telemetry tracking.
//!
//! The service reports seconds used/limit/remaining in its `ready` message
//! and may push free-text warnings independently. [`UsageTracker`] keeps the
//! latest snapshot and turns each update into at most one notification.

use serde::{Deserialize, Serialize};

use crate::constants::USAGE_WARN_PERCENT;

/// Immutable quota snapshot. Replaced wholesale, never mutated in place.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageInfo {
    /// Seconds of streaming consumed.
    pub seconds_used: f64,
    /// Seconds allowed by the plan.
    pub seconds_limit: f64,
    /// Seconds left, as reported by the server.
    pub seconds_remaining: f64,
}

impl UsageInfo {
    /// Build a snapshot from the three reported values.
    #[must_use]
    pub fn new(seconds_used: f64, seconds_limit: f64, seconds_remaining: f64) -> Self {
        Self {
            seconds_used,
            seconds_limit,
            seconds_remaining,
        }
    }

    /// Percentage of the limit consumed; 100 when the limit is not positive.
    #[must_use]
    pub fn usage_percent(&self) -> f64 {
        if self.seconds_limit <= 0.0 {
            100.0
        } else {
            self.seconds_used / self.seconds_limit * 100.0
        }
    }

    /// Whether usage has crossed the default warning threshold.
    #[must_use]
    pub fn should_warn(&self) -> bool {
        self.usage_percent() >= USAGE_WARN_PERCENT
    }

    /// Whether the quota is exhausted.
    #[must_use]
    pub fn is_over_limit(&self) -> bool {
        self.seconds_used >= self.seconds_limit
    }
}

/// Notification raised by the tracker.
#[derive(Debug, Clone, PartialEq)]
pub enum UsageNotice {
    /// Usage crossed the warning threshold, or the server pushed a warning.
    Warning {
        /// Latest known snapshot; may be stale or absent for pushed warnings.
        usage: Option<UsageInfo>,
        /// Server-supplied text, if this came from a pushed warning.
        message: Option<String>,
    },
    /// Quota exhausted.
    LimitReached(UsageInfo),
}

/// Holds the latest [`UsageInfo`] and derives threshold notifications.
#[derive(Debug, Clone)]
pub struct UsageTracker {
    current: Option<UsageInfo>,
    warn_percent: f64,
}

impl Default for UsageTracker {
    fn default() -> Self {
        Self::new(USAGE_WARN_PERCENT)
    }
}

impl UsageTracker {
    /// Create a tracker that warns at `warn_percent`.
    #[must_use]
    pub fn new(warn_percent: f64) -> Self {
        Self {
            current: None,
            warn_percent,
        }
    }

    /// Latest snapshot, if any was received.
    #[must_use]
    pub fn current(&self) -> Option<UsageInfo> {
        self.current
    }

    /// Replace the snapshot. Over-limit takes precedence over warning.
    pub fn update_usage(&mut self, used: f64, limit: f64, remaining: f64) -> Option<UsageNotice> {
        let info = UsageInfo::new(used, limit, remaining);
        self.current = Some(info);

        if info.is_over_limit() {
            log::warn!("[Usage] Limit reached: {used:.0}s of {limit:.0}s");
            Some(UsageNotice::LimitReached(info))
        } else if info.usage_percent() >= self.warn_percent {
            log::info!("[Usage] {:.0}% of quota used", info.usage_percent());
            Some(UsageNotice::Warning {
                usage: Some(info),
                message: None,
            })
        } else {
            None
        }
    }

    /// Server-pushed warning; always raises, carrying the latest snapshot.
    pub fn handle_warning(&self, text: &str) -> UsageNotice {
        log::warn!("[Usage] Server warning: {text}");
        UsageNotice::Warning {
            usage: self.current,
            message: Some(text.to_string()),
        }
    }

    /// Forget the snapshot (session teardown).
    pub fn reset(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_percent_and_flags() {
        let info = UsageInfo::new(40.0, 100.0, 60.0);
        assert!((info.usage_percent() - 40.0).abs() < f64::EPSILON);
        assert!(!info.should_warn());
        assert!(!info.is_over_limit());

        let info = UsageInfo::new(80.0, 100.0, 20.0);
        assert!(info.should_warn());
    }

    #[test]
    fn test_zero_limit_counts_as_full() {
        let info = UsageInfo::new(0.0, 0.0, 0.0);
        assert!((info.usage_percent() - 100.0).abs() < f64::EPSILON);
        assert!(info.should_warn());
        assert!(info.is_over_limit());
    }

    #[test]
    fn test_ninety_five_percent_warns_not_limit() {
        let mut tracker = UsageTracker::default();
        let notice = tracker.update_usage(95.0, 100.0, 5.0);
        assert!(matches!(notice, Some(UsageNotice::Warning { message: None, .. })));
    }

    #[test]
    fn test_full_usage_raises_limit_not_warning() {
        let mut tracker = UsageTracker::default();
        let notice = tracker.update_usage(100.0, 100.0, 0.0);
        assert_eq!(
            notice,
            Some(UsageNotice::LimitReached(UsageInfo::new(100.0, 100.0, 0.0)))
        );
    }

    #[test]
    fn test_low_usage_is_silent() {
        let mut tracker = UsageTracker::default();
        assert_eq!(tracker.update_usage(10.0, 100.0, 90.0), None);
        assert_eq!(tracker.current(), Some(UsageInfo::new(10.0, 100.0, 90.0)));
    }

    #[test]
    fn test_snapshot_replaced_wholesale() {
        let mut tracker = UsageTracker::default();
        tracker.update_usage(10.0, 100.0, 90.0);
        tracker.update_usage(20.0, 200.0, 180.0);
        assert_eq!(tracker.current(), Some(UsageInfo::new(20.0, 200.0, 180.0)));
    }

    #[test]
    fn test_pushed_warning_carries_stale_snapshot() {
        let mut tracker = UsageTracker::default();
        match tracker.handle_warning("quota low") {
            UsageNotice::Warning { usage, message } => {
                assert!(usage.is_none());
                assert_eq!(message.as_deref(), Some("quota low"));
            }
            other => panic!("unexpected notice: {other:?}"),
        }

        tracker.update_usage(10.0, 100.0, 90.0);
        match tracker.handle_warning("still low") {
            UsageNotice::Warning { usage, .. } => {
                assert_eq!(usage, Some(UsageInfo::new(10.0, 100.0, 90.0)));
            }
            other => panic!("unexpected notice: {other:?}"),
        }
    }

    #[test]
    fn test_reset_forgets_snapshot() {
        let mut tracker = UsageTracker::default();
        tracker.update_usage(10.0, 100.0, 90.0);
        tracker.reset();
        assert!(tracker.current().is_none());
    }
}
