//! Tollgate - Rate Limiting Strategies over a Pluggable Counter Store
//!
//! This crate implements five rate limiting algorithms (fixed window,
//! estimated sliding window, exact sliding log, token bucket and leaky
//! bucket) behind a single [`Limiter`] interface. All per-identifier state
//! lives in a [`CounterStore`], so the same limiter code runs against the
//! process-local [`MemoryStore`] or any networked backend that implements
//! the store contract.

pub mod clock;
pub mod config;
pub mod duration;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{StoreConfig, TollgateConfig};
pub use duration::parse_duration_ms;
pub use error::{ConfigError, Result, StoreError, TollgateError};
pub use ratelimit::{Algorithm, Decision, Limiter, LimiterRule, RateLimiter};
pub use store::{Capability, CounterStore, MemoryStore};
