//! Leaky bucket rate limiting.
//!
//! Admitted requests raise the bucket level by one; the level drains
//! continuously at `leak_rate` per `interval`. A full bucket rejects.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::bucket::{read_modify_write, Commit};
use super::decision::{ceil_secs_f64, offset_ms};
use super::{
    positive_count, positive_rate, Algorithm, Decision, Limiter, StorageKey,
    BUCKET_STATE_TTL_SECS,
};
use crate::clock::{Clock, SystemClock};
use crate::duration::parse_positive_ms;
use crate::error::Result;
use crate::store::CounterStore;

/// Configuration for [`LeakyBucket`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeakyBucketConfig {
    /// Level at which the bucket starts rejecting
    pub capacity: u64,
    /// Units drained per interval
    pub leak_rate: f64,
    /// Drain period as a duration string
    pub interval: String,
    /// Use compare-and-swap for state updates
    #[serde(default)]
    pub atomic: bool,
}

impl LeakyBucketConfig {
    /// An empty bucket draining `leak_rate` units per `interval`.
    pub fn new(capacity: u64, leak_rate: f64, interval: impl Into<String>) -> Self {
        Self {
            capacity,
            leak_rate,
            interval: interval.into(),
            atomic: false,
        }
    }

    /// Ask for lost-update-free state writes.
    pub fn atomic(mut self) -> Self {
        self.atomic = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeakyBucketState {
    level: f64,
    last_leak: u64,
}

/// Leaky bucket limiter.
#[derive(Debug)]
pub struct LeakyBucket {
    capacity: u64,
    leak_rate: f64,
    interval_ms: u64,
    commit: Commit,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
}

impl LeakyBucket {
    /// Validate `config` and bind it to `store`.
    pub fn new(config: &LeakyBucketConfig, store: Arc<dyn CounterStore>) -> Result<Self> {
        let capacity = positive_count("capacity", config.capacity)?;
        let leak_rate = positive_rate("leak_rate", config.leak_rate)?;
        let interval_ms = parse_positive_ms("interval", &config.interval)?;
        let commit = Commit::bind(store.as_ref(), Algorithm::LeakyBucket, config.atomic)?;

        Ok(Self {
            capacity,
            leak_rate,
            interval_ms,
            commit,
            store,
            clock: Arc::new(SystemClock),
        })
    }

    /// Read time from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Milliseconds needed to drain `amount` units.
    fn drain_ms(&self, amount: f64) -> f64 {
        amount / self.leak_rate * self.interval_ms as f64
    }

    fn step(&self, state: Option<LeakyBucketState>, now: u64) -> (LeakyBucketState, Decision) {
        let capacity = self.capacity as f64;
        let mut bucket = state.unwrap_or_else(|| {
            debug!(capacity = self.capacity, "Creating new leaky bucket");
            LeakyBucketState {
                level: 0.0,
                last_leak: now,
            }
        });

        let elapsed = now.saturating_sub(bucket.last_leak) as f64;
        let leaked = elapsed / self.interval_ms as f64 * self.leak_rate;
        bucket.level = (bucket.level - leaked).max(0.0);
        bucket.last_leak = now;

        if bucket.level >= capacity {
            let wait = self.drain_ms(bucket.level - capacity + 1.0);
            let decision = Decision::deny(
                self.capacity,
                0,
                offset_ms(now, wait),
                ceil_secs_f64(wait),
            );
            return (bucket, decision);
        }

        bucket.level = (bucket.level + 1.0).min(capacity);
        let decision = Decision::allow(
            self.capacity,
            (capacity - bucket.level).floor() as u64,
            offset_ms(now, self.drain_ms(bucket.level)),
        );
        (bucket, decision)
    }
}

#[async_trait]
impl Limiter for LeakyBucket {
    fn algorithm(&self) -> Algorithm {
        Algorithm::LeakyBucket
    }

    fn limit(&self) -> u64 {
        self.capacity
    }

    async fn check(&self, identifier: &str) -> Result<Decision> {
        let now = self.clock.now_millis();
        let key = StorageKey::state(Algorithm::LeakyBucket, identifier).to_store_key();

        let decision = read_modify_write(
            self.store.as_ref(),
            Algorithm::LeakyBucket,
            self.commit,
            &key,
            BUCKET_STATE_TTL_SECS,
            |state: Option<LeakyBucketState>| {
                let (bucket, decision) = self.step(state, now);
                (Some(bucket), decision)
            },
        )
        .await?;

        trace!(key = %key, remaining = decision.remaining(), "Leaky bucket updated");
        Ok(decision)
    }
}
