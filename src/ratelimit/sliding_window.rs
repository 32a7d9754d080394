//! Sliding window rate limiting, estimated from two fixed buckets.
//!
//! The count for the trailing window is approximated as the current bucket's
//! count plus the previous bucket's count weighted by how much of the
//! previous bucket still overlaps the trailing window. Rejected requests do
//! not touch the counter.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::decision::ceil_secs;
use super::{Algorithm, Decision, Limiter, StorageKey, WindowConfig};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, StoreError, StoreResult};
use crate::store::CounterStore;

/// Estimated sliding window limiter.
#[derive(Debug)]
pub struct SlidingWindow {
    tokens: u64,
    window_ms: u64,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindow {
    /// Validate `config` and bind it to `store`.
    pub fn new(config: &WindowConfig, store: Arc<dyn CounterStore>) -> Result<Self> {
        let (tokens, window_ms) = config.resolve()?;
        Ok(Self {
            tokens,
            window_ms,
            store,
            clock: Arc::new(SystemClock),
        })
    }

    /// Read time from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn read_count(&self, key: Option<&str>) -> StoreResult<u64> {
        let Some(key) = key else {
            return Ok(0);
        };
        match self.store.get(key).await? {
            None => Ok(0),
            Some(text) => text.parse().map_err(|_| StoreError::NotAnInteger {
                key: key.to_string(),
            }),
        }
    }
}

#[async_trait]
impl Limiter for SlidingWindow {
    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindow
    }

    fn limit(&self) -> u64 {
        self.tokens
    }

    async fn check(&self, identifier: &str) -> Result<Decision> {
        let now = self.clock.now_millis();
        let bucket = now / self.window_ms;
        let current_key =
            StorageKey::bucket(Algorithm::SlidingWindow, identifier, bucket).to_store_key();
        let previous_key = bucket
            .checked_sub(1)
            .map(|b| StorageKey::bucket(Algorithm::SlidingWindow, identifier, b).to_store_key());

        let (current_count, previous_count) = futures::try_join!(
            self.read_count(Some(&current_key)),
            self.read_count(previous_key.as_deref())
        )?;

        let elapsed_fraction = (now % self.window_ms) as f64 / self.window_ms as f64;
        let weighted_previous = (previous_count as f64 * (1.0 - elapsed_fraction)).floor() as u64;
        let estimate = current_count + weighted_previous;
        let reset = (bucket + 1) * self.window_ms;

        trace!(
            key = %current_key,
            current = current_count,
            previous = previous_count,
            estimate = estimate,
            "Sliding window estimated"
        );

        if estimate >= self.tokens {
            return Ok(Decision::deny(self.tokens, 0, reset, ceil_secs(reset - now)));
        }

        let new_count = self.store.incr(&current_key).await?;
        if new_count == 1 {
            debug!(key = %current_key, window_ms = self.window_ms, "Opened sliding window bucket");
            // Keep the bucket around long enough to be read as the previous one
            self.store
                .expire(&current_key, ceil_secs(self.window_ms * 2))
                .await?;
        }

        let new_estimate = u64::try_from(new_count).unwrap_or(0) + weighted_previous;
        Ok(Decision::allow(
            self.tokens,
            self.tokens.saturating_sub(new_estimate),
            reset,
        ))
    }
}
