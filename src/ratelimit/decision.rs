//! The result every limiter returns.

use std::time::Duration;

use serde::Serialize;

/// Outcome of a single `check`.
///
/// `remaining` is always within `0..=limit` and `retry_after` is present
/// exactly when the request was rejected. Serializes with the client-facing
/// field names `success`, `limit`, `remaining`, `reset` and `retryAfter`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    success: bool,
    limit: u64,
    remaining: u64,
    /// Epoch milliseconds
    reset: u64,
    /// Seconds
    retry_after: Option<u64>,
}

impl Decision {
    /// An admitted request.
    pub fn allow(limit: u64, remaining: u64, reset: u64) -> Self {
        Self {
            success: true,
            limit,
            remaining: remaining.min(limit),
            reset,
            retry_after: None,
        }
    }

    /// A rejected request.
    pub fn deny(limit: u64, remaining: u64, reset: u64, retry_after_secs: u64) -> Self {
        Self {
            success: false,
            limit,
            remaining: remaining.min(limit),
            reset,
            retry_after: Some(retry_after_secs),
        }
    }

    /// Whether the request was admitted.
    pub fn success(&self) -> bool {
        self.success
    }

    /// The configured quota.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Quota left after this request.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// When the limiter's state next resets, in epoch milliseconds.
    pub fn reset(&self) -> u64 {
        self.reset
    }

    /// Seconds to wait before retrying, for rejected requests.
    pub fn retry_after(&self) -> Option<u64> {
        self.retry_after
    }

    /// `retry_after` as a [`Duration`].
    pub fn retry_after_duration(&self) -> Option<Duration> {
        self.retry_after.map(Duration::from_secs)
    }
}

/// Whole seconds covering `ms` milliseconds.
pub(crate) fn ceil_secs(ms: u64) -> u64 {
    ms.div_ceil(1000)
}

/// Whole seconds covering a fractional span of milliseconds.
pub(crate) fn ceil_secs_f64(ms: f64) -> u64 {
    (ms.max(0.0) / 1000.0).ceil() as u64
}

/// `now` plus a fractional span of milliseconds, rounded up.
pub(crate) fn offset_ms(now: u64, span_ms: f64) -> u64 {
    now.saturating_add(span_ms.max(0.0).ceil() as u64)
}
