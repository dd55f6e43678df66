//! Fixed-window counter records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a counter's expiry is armed.
///
/// Both counter stores apply the same mode so that a request served by the
/// local fallback sees the same window semantics as one served by the
/// shared store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpiryMode {
    /// Expiry is set on the first hit of a window and never moved.
    #[default]
    Fixed,
    /// Expiry is re-armed on every hit; a continuously hit key never lapses.
    Sliding,
}

/// Hit count for one bucket key within its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterRecord {
    /// Hits observed in the current window
    pub hits: u64,
    /// When the current window lapses
    pub reset_at: DateTime<Utc>,
}

impl CounterRecord {
    /// Create an empty record whose window starts at `now`.
    pub fn new(now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            hits: 0,
            reset_at: now + window_delta(window),
        }
    }

    /// Whether the window has lapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_at
    }

    /// Record one hit at `now`.
    ///
    /// An expired record restarts with `hits = 1` and a fresh window.
    pub fn hit(&mut self, now: DateTime<Utc>, window: Duration, mode: ExpiryMode) {
        if self.is_expired(now) {
            self.hits = 1;
            self.reset_at = now + window_delta(window);
            return;
        }

        self.hits += 1;
        if mode == ExpiryMode::Sliding {
            self.reset_at = now + window_delta(window);
        }
    }

    /// Whole seconds until the window lapses, rounded up, never negative.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset_at - now).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000)
    }
}

/// Longest window a counter accepts.
pub const MAX_WINDOW: Duration = Duration::from_secs(31 * 86400);

/// Convert a window length into a chrono delta, clamped to [`MAX_WINDOW`].
pub(crate) fn window_delta(window: Duration) -> chrono::Duration {
    chrono::Duration::from_std(window.min(MAX_WINDOW)).unwrap_or(chrono::Duration::zero())
}
