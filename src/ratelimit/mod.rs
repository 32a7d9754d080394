//! Rate limiting strategies and the types they share.

mod backend;
mod bucket;
mod decision;
mod fixed_window;
mod keys;
mod leaky_bucket;
mod limiter;
mod rules;
mod sliding_log;
mod sliding_window;
mod token_bucket;

pub use backend::Limiter;
pub use decision::Decision;
pub use fixed_window::{FixedWindow, WindowConfig};
pub use keys::{Algorithm, StorageKey};
pub use leaky_bucket::{LeakyBucket, LeakyBucketConfig};
pub use limiter::RateLimiter;
pub use rules::LimiterRule;
pub use sliding_log::{LogStorage, SlidingLog, SlidingLogConfig};
pub use sliding_window::SlidingWindow;
pub use token_bucket::{TokenBucket, TokenBucketConfig};

use crate::error::ConfigError;

/// Lifetime of persisted bucket state, independent of any limiting window.
pub(crate) const BUCKET_STATE_TTL_SECS: u64 = 3600;

pub(crate) fn positive_count(field: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

pub(crate) fn positive_rate(field: &'static str, value: f64) -> Result<f64, ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::InvalidValue {
            field,
            reason: format!("must be a positive finite number, got {value}"),
        });
    }
    Ok(value)
}
