//! Fixed window rate limiting.
//!
//! Time is cut into clock-aligned windows and each identifier gets one
//! counter per window. Cheap and race-free (a single atomic `incr`), but a
//! client can spend its whole quota at the end of one window and again at
//! the start of the next, admitting up to twice the quota in a short span
//! around the boundary. [`super::SlidingWindow`] trades a little accuracy
//! for smoothing that out.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::decision::ceil_secs;
use super::{positive_count, Algorithm, Decision, Limiter, StorageKey};
use crate::clock::{Clock, SystemClock};
use crate::duration::parse_positive_ms;
use crate::error::Result;
use crate::store::CounterStore;

/// Configuration shared by the window-based algorithms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Requests admitted per window
    pub tokens: u64,
    /// Window length as a duration string, e.g. `"60s"`
    pub window: String,
}

impl WindowConfig {
    pub fn new(tokens: u64, window: impl Into<String>) -> Self {
        Self {
            tokens,
            window: window.into(),
        }
    }

    /// Validate and return `(tokens, window_ms)`.
    pub(crate) fn resolve(&self) -> Result<(u64, u64)> {
        let tokens = positive_count("tokens", self.tokens)?;
        let window_ms = parse_positive_ms("window", &self.window)?;
        Ok((tokens, window_ms))
    }
}

/// Fixed window limiter.
#[derive(Debug)]
pub struct FixedWindow {
    tokens: u64,
    window_ms: u64,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
}

impl FixedWindow {
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
}

#[async_trait]
impl Limiter for FixedWindow {
    fn algorithm(&self) -> Algorithm {
        Algorithm::FixedWindow
    }

    fn limit(&self) -> u64 {
        self.tokens
    }

    async fn check(&self, identifier: &str) -> Result<Decision> {
        let now = self.clock.now_millis();
        let bucket = now / self.window_ms;
        let key = StorageKey::bucket(Algorithm::FixedWindow, identifier, bucket).to_store_key();

        // Counts every attempt, including the ones that end up rejected
        let current = self.store.incr(&key).await?;
        if current == 1 {
            debug!(key = %key, window_ms = self.window_ms, "Opened fixed window");
            self.store
                .expire(&key, ceil_secs(self.window_ms))
                .await?;
        }

        let count = u64::try_from(current).unwrap_or(0);
        let reset = (bucket + 1) * self.window_ms;

        trace!(key = %key, count = count, limit = self.tokens, "Fixed window counted");

        if count <= self.tokens {
            Ok(Decision::allow(self.tokens, self.tokens - count, reset))
        } else {
            Ok(Decision::deny(self.tokens, 0, reset, ceil_secs(reset - now)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::{ConfigError, TollgateError};
    use crate::store::{KeyTtl, MemoryStore};

    const START: u64 = 1_700_000_000_000;

    fn limiter(tokens: u64, window: &str) -> (FixedWindow, MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START));
        let store = MemoryStore::with_clock(clock.clone());
        let limiter = FixedWindow::new(&WindowConfig::new(tokens, window), Arc::new(store.clone()))
            .unwrap()
            .with_clock(clock.clone());
        (limiter, store, clock)
    }

    #[tokio::test]
    async fn test_admits_up_to_quota_then_rejects() {
        let (limiter, _, clock) = limiter(3, "1s");
        clock.set(START + 100);

        for expected in [2, 1, 0] {
            let decision = limiter.check("client").await.unwrap();
            assert!(decision.success());
            assert_eq!(decision.remaining(), expected);
            assert_eq!(decision.limit(), 3);
            assert_eq!(decision.retry_after(), None);
        }

        let decision = limiter.check("client").await.unwrap();
        assert!(!decision.success());
        assert_eq!(decision.remaining(), 0);
        assert!(decision.retry_after().unwrap() <= 1);
        assert_eq!(decision.reset(), START + 1_000);
    }

    #[tokio::test]
    async fn test_new_window_resets_quota() {
        let (limiter, _, clock) = limiter(3, "1s");

        for _ in 0..4 {
            limiter.check("client").await.unwrap();
        }
        assert!(!limiter.check("client").await.unwrap().success());

        clock.advance_millis(1_000);
        let decision = limiter.check("client").await.unwrap();
        assert!(decision.success());
        assert_eq!(decision.remaining(), 2);
    }

    #[tokio::test]
    async fn test_rejected_attempts_are_counted() {
        let (limiter, store, _) = limiter(1, "1s");

        limiter.check("client").await.unwrap();
        limiter.check("client").await.unwrap();
        limiter.check("client").await.unwrap();

        let key = StorageKey::bucket(Algorithm::FixedWindow, "client", START / 1_000);
        assert_eq!(
            store.get(&key.to_store_key()).await.unwrap().as_deref(),
            Some("3")
        );
    }

    #[tokio::test]
    async fn test_counter_expires_with_window() {
        let (limiter, store, _) = limiter(5, "1m");
        limiter.check("client").await.unwrap();

        let key = StorageKey::bucket(Algorithm::FixedWindow, "client", START / 60_000);
        assert_eq!(
            store.ttl(&key.to_store_key()).await.unwrap(),
            KeyTtl::Expires(60)
        );
    }

    #[tokio::test]
    async fn test_identifiers_are_independent() {
        let (limiter, _, _) = limiter(1, "1s");

        assert!(limiter.check("a").await.unwrap().success());
        assert!(!limiter.check("a").await.unwrap().success());
        assert!(limiter.check("b").await.unwrap().success());
    }

    #[tokio::test]
    async fn test_boundary_burst_is_admitted() {
        let (limiter, _, clock) = limiter(10, "1s");

        clock.set(START + 900);
        for _ in 0..10 {
            assert!(limiter.check("client").await.unwrap().success());
        }
        clock.set(START + 1_050);
        for _ in 0..10 {
            assert!(limiter.check("client").await.unwrap().success());
        }
    }

    #[test]
    fn test_invalid_config_fails_at_construction() {
        let store: Arc<dyn CounterStore> = Arc::new(MemoryStore::new());

        let err = FixedWindow::new(&WindowConfig::new(3, "10x"), store.clone()).unwrap_err();
        assert!(matches!(
            err,
            TollgateError::Config(ConfigError::UnsupportedUnit(_))
        ));

        let err = FixedWindow::new(&WindowConfig::new(0, "1s"), store.clone()).unwrap_err();
        assert!(matches!(
            err,
            TollgateError::Config(ConfigError::InvalidValue { field: "tokens", .. })
        ));

        assert!(FixedWindow::new(&WindowConfig::new(3, ""), store).is_err());
    }
}
