//! Failure-memoization pause policy for manifest generation.
//!
//! Rendering the same broken source over and over is wasted work: the inputs
//! are content-addressed, so a failed generation will keep failing until the
//! source changes. Instead of re-rendering, the cache layer memoizes the
//! failure and serves it back for a bounded window. This crate owns the
//! policy half of that contract: when a key enters the paused state, and
//! when it leaves it.
//!
//! A paused key exits the window when **either** bound is hit:
//! - the wall-clock window measured from the first failure has elapsed, or
//! - enough cached error responses have been served.
//!
//! Either bound may be disabled by setting it to zero; setting
//! `pause_after_failures` to zero disables memoization entirely.
//!
//! # Example
//!
//! ```
//! use manifold_backoff::{FailureWindow, PauseConfig};
//! use chrono::Utc;
//!
//! let policy = PauseConfig {
//!     pause_after_failures: 3,
//!     ..PauseConfig::default()
//! };
//!
//! let mut window = FailureWindow::default();
//! for _ in 0..3 {
//!     window.register_failure(Utc::now());
//! }
//! assert!(policy.should_pause(&window));
//! ```

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Policy knobs for failure memoization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseConfig {
    /// Consecutive failures after which generation pauses.
    /// Zero disables memoization.
    #[serde(default)]
    pub pause_after_failures: u32,

    /// Wall-clock window, measured from the first failure, after which the
    /// pause expires. Zero disables the temporal bound.
    #[serde(with = "humantime_serde", default = "default_pause_window")]
    pub pause_window: Duration,

    /// Cached error responses served before the pause expires.
    /// Zero disables the request-count bound.
    #[serde(default)]
    pub pause_requests: u32,
}

fn default_pause_window() -> Duration {
    Duration::from_secs(60 * 60)
}

impl Default for PauseConfig {
    fn default() -> Self {
        Self {
            pause_after_failures: 0,
            pause_window: default_pause_window(),
            pause_requests: 0,
        }
    }
}

impl PauseConfig {
    /// Whether failure memoization is enabled at all.
    pub fn memoization_enabled(&self) -> bool {
        self.pause_after_failures > 0
    }

    /// Whether the given window has accumulated enough consecutive failures
    /// to pause generation.
    pub fn should_pause(&self, window: &FailureWindow) -> bool {
        self.memoization_enabled() && window.consecutive_failures >= self.pause_after_failures
    }

    /// Whether a paused window has hit either exit bound at `now`.
    pub fn pause_expired(&self, window: &FailureWindow, now: DateTime<Utc>) -> bool {
        if self.pause_requests > 0 && window.cached_response_count >= self.pause_requests {
            return true;
        }
        if self.pause_window > Duration::ZERO {
            if let Some(first) = window.first_failure_at {
                let elapsed = now.signed_duration_since(first);
                let bound = TimeDelta::from_std(self.pause_window).unwrap_or(TimeDelta::MAX);
                return elapsed >= bound;
            }
        }
        false
    }
}

/// Counters tracked per cache key while a source keeps failing.
///
/// The window is embedded in the cached failure record; all mutation goes
/// through [`register_failure`](Self::register_failure) and
/// [`register_served`](Self::register_served) so the first-failure stamp and
/// the counters cannot drift apart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureWindow {
    /// When the current run of consecutive failures began.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_failure_at: Option<DateTime<Utc>>,
    /// Consecutive failed generation attempts for this key.
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Memoized error responses served while paused.
    #[serde(default)]
    pub cached_response_count: u32,
}

impl FailureWindow {
    /// Record one failed generation attempt.
    pub fn register_failure(&mut self, now: DateTime<Utc>) {
        if self.first_failure_at.is_none() {
            self.first_failure_at = Some(now);
        }
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    /// Record one memoized error response served to a caller.
    pub fn register_served(&mut self) {
        self.cached_response_count = self.cached_response_count.saturating_add(1);
    }

    /// Clear all counters; a successful generation calls this.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(failures: u32, window_secs: u64, requests: u32) -> PauseConfig {
        PauseConfig {
            pause_after_failures: failures,
            pause_window: Duration::from_secs(window_secs),
            pause_requests: requests,
        }
    }

    fn failed_window(failures: u32, first: DateTime<Utc>) -> FailureWindow {
        let mut w = FailureWindow::default();
        for _ in 0..failures {
            w.register_failure(first);
        }
        w
    }

    #[test]
    fn zero_threshold_disables_memoization() {
        let p = policy(0, 3600, 5);
        let w = failed_window(100, Utc::now());
        assert!(!p.memoization_enabled());
        assert!(!p.should_pause(&w));
    }

    #[test]
    fn pauses_at_exact_threshold() {
        let p = policy(3, 3600, 0);
        assert!(!p.should_pause(&failed_window(2, Utc::now())));
        assert!(p.should_pause(&failed_window(3, Utc::now())));
        assert!(p.should_pause(&failed_window(4, Utc::now())));
    }

    #[test]
    fn first_failure_stamp_is_sticky() {
        let first = Utc::now();
        let mut w = FailureWindow::default();
        w.register_failure(first);
        let later = first + TimeDelta::seconds(300);
        w.register_failure(later);
        assert_eq!(w.first_failure_at, Some(first));
        assert_eq!(w.consecutive_failures, 2);
    }

    #[test]
    fn expires_on_request_budget() {
        let p = policy(3, 86_400, 2);
        let mut w = failed_window(3, Utc::now());
        assert!(!p.pause_expired(&w, Utc::now()));
        w.register_served();
        assert!(!p.pause_expired(&w, Utc::now()));
        w.register_served();
        assert!(p.pause_expired(&w, Utc::now()));
    }

    #[test]
    fn expires_on_elapsed_window() {
        let p = policy(3, 600, 0);
        let first = Utc::now();
        let w = failed_window(3, first);
        assert!(!p.pause_expired(&w, first + TimeDelta::seconds(599)));
        assert!(p.pause_expired(&w, first + TimeDelta::seconds(600)));
    }

    #[test]
    fn zero_bounds_never_expire() {
        let p = policy(3, 0, 0);
        let first = Utc::now();
        let mut w = failed_window(3, first);
        for _ in 0..50 {
            w.register_served();
        }
        assert!(!p.pause_expired(&w, first + TimeDelta::days(365)));
    }

    #[test]
    fn reset_clears_everything() {
        let mut w = failed_window(5, Utc::now());
        w.register_served();
        w.reset();
        assert_eq!(w, FailureWindow::default());
    }

    #[test]
    fn config_roundtrips_through_serde() {
        let p = policy(3, 1440 * 60, 2);
        let json = serde_json::to_string(&p).expect("serialize");
        let back: PauseConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, p);
    }

    #[test]
    fn config_accepts_humantime_window() {
        let p: PauseConfig = serde_json::from_str(
            r#"{"pause_after_failures": 3, "pause_window": "24h", "pause_requests": 2}"#,
        )
        .expect("deserialize");
        assert_eq!(p.pause_window, Duration::from_secs(86_400));
    }
}
