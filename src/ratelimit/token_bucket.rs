//! Token bucket rate limiting.
//!
//! Each identifier owns a bucket holding up to `max_tokens` tokens. Every
//! whole `interval` that passes adds `refill_rate` tokens; an admitted
//! request spends one.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::bucket::{read_modify_write, Commit};
use super::decision::ceil_secs;
use super::{
    positive_count, positive_rate, Algorithm, Decision, Limiter, StorageKey,
    BUCKET_STATE_TTL_SECS,
};
use crate::clock::{Clock, SystemClock};
use crate::duration::parse_positive_ms;
use crate::error::Result;
use crate::store::CounterStore;

/// Configuration for [`TokenBucket`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    /// Bucket capacity, and the initial fill
    pub max_tokens: u64,
    /// Tokens added per elapsed interval
    pub refill_rate: f64,
    /// Refill period as a duration string
    pub interval: String,
    /// Use compare-and-swap for state updates
    #[serde(default)]
    pub atomic: bool,
}

impl TokenBucketConfig {
    pub fn new(max_tokens: u64, refill_rate: f64, interval: impl Into<String>) -> Self {
        Self {
            max_tokens,
            refill_rate,
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
struct TokenBucketState {
    tokens: f64,
    last_refill: u64,
}

/// Token bucket limiter.
#[derive(Debug)]
pub struct TokenBucket {
    max_tokens: u64,
    refill_rate: f64,
    interval_ms: u64,
    commit: Commit,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    /// Validate `config` and bind it to `store`.
    pub fn new(config: &TokenBucketConfig, store: Arc<dyn CounterStore>) -> Result<Self> {
        let max_tokens = positive_count("max_tokens", config.max_tokens)?;
        let refill_rate = positive_rate("refill_rate", config.refill_rate)?;
        let interval_ms = parse_positive_ms("interval", &config.interval)?;
        let commit = Commit::bind(store.as_ref(), Algorithm::TokenBucket, config.atomic)?;

        Ok(Self {
            max_tokens,
            refill_rate,
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

    /// Credit every whole interval since the last refill.
    fn refill(&self, bucket: &mut TokenBucketState, now: u64) {
        let intervals = now.saturating_sub(bucket.last_refill) / self.interval_ms;
        if intervals > 0 {
            bucket.tokens = (bucket.tokens + intervals as f64 * self.refill_rate)
                .min(self.max_tokens as f64);
            // Advance by whole intervals so partial progress carries over
            bucket.last_refill += intervals * self.interval_ms;
        }
    }

    fn step(&self, state: Option<TokenBucketState>, now: u64) -> (TokenBucketState, Decision) {
        let max = self.max_tokens as f64;
        let mut bucket = state.unwrap_or_else(|| {
            debug!(max_tokens = self.max_tokens, "Creating new token bucket");
            TokenBucketState {
                tokens: max,
                last_refill: now,
            }
        });
        bucket.tokens = bucket.tokens.clamp(0.0, max);
        self.refill(&mut bucket, now);

        if bucket.tokens < 1.0 {
            let wait = self
                .interval_ms
                .saturating_sub(now.saturating_sub(bucket.last_refill));
            let decision = Decision::deny(
                self.max_tokens,
                bucket.tokens.floor() as u64,
                now + wait,
                ceil_secs(wait),
            );
            return (bucket, decision);
        }

        bucket.tokens -= 1.0;
        let refills_to_full = ((max - bucket.tokens) / self.refill_rate).ceil() as u64;
        let decision = Decision::allow(
            self.max_tokens,
            bucket.tokens.floor() as u64,
            now.saturating_add(refills_to_full.saturating_mul(self.interval_ms)),
        );
        (bucket, decision)
    }
}

#[async_trait]
impl Limiter for TokenBucket {
    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }

    fn limit(&self) -> u64 {
        self.max_tokens
    }

    async fn check(&self, identifier: &str) -> Result<Decision> {
        let now = self.clock.now_millis();
        let key = StorageKey::state(Algorithm::TokenBucket, identifier).to_store_key();

        trace!(key = %key, "Checking token bucket");

        // State is rewritten on rejection too, refreshing its lifetime
        read_modify_write(
            self.store.as_ref(),
            Algorithm::TokenBucket,
            self.commit,
            &key,
            BUCKET_STATE_TTL_SECS,
            |state: Option<TokenBucketState>| {
                let (bucket, decision) = self.step(state, now);
                (Some(bucket), decision)
            },
        )
        .await
    }
}
