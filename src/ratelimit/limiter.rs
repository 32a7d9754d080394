//! Named rate limiter facade.

use std::sync::Arc;

use tracing::{debug, trace};

use super::{Algorithm, Decision, Limiter, LimiterRule};
use crate::clock::Clock;
use crate::error::Result;
use crate::store::CounterStore;

/// A named strategy, as configured under `limiters:`.
///
/// This struct is thread-safe and can be shared across multiple tasks.
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    limiter: Box<dyn Limiter>,
}

impl RateLimiter {
    /// Wrap an already constructed strategy.
    pub fn new(name: impl Into<String>, limiter: Box<dyn Limiter>) -> Self {
        Self {
            name: name.into(),
            limiter,
        }
    }

    /// Build the strategy described by `rule`.
    pub fn from_rule(
        name: impl Into<String>,
        rule: &LimiterRule,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Ok(Self::new(name, rule.build(store, clock)?))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn algorithm(&self) -> Algorithm {
        self.limiter.algorithm()
    }

    pub fn limit(&self) -> u64 {
        self.limiter.limit()
    }

    /// Check the rate limit for `identifier`.
    ///
    /// Store failures are returned to the caller untouched.
    pub async fn check(&self, identifier: &str) -> Result<Decision> {
        trace!(
            limiter = %self.name,
            algorithm = %self.algorithm(),
            identifier = identifier,
            "Checking rate limit"
        );

        let decision = self.limiter.check(identifier).await?;

        if !decision.success() {
            debug!(
                limiter = %self.name,
                identifier = identifier,
                limit = decision.limit(),
                retry_after = ?decision.retry_after(),
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::{
        LeakyBucketConfig, LogStorage, SlidingLogConfig, TokenBucketConfig, WindowConfig,
    };
    use crate::store::MemoryStore;

    fn rules() -> Vec<LimiterRule> {
        vec![
            LimiterRule::FixedWindow(WindowConfig::new(3, "1s")),
            LimiterRule::SlidingWindow(WindowConfig::new(3, "1s")),
            LimiterRule::SlidingLog(SlidingLogConfig::new(3, "1s")),
            LimiterRule::SlidingLog(
                SlidingLogConfig::new(3, "1s").with_storage(LogStorage::KeyValue),
            ),
            LimiterRule::SlidingLog(SlidingLogConfig::new(3, "1s").atomic()),
            LimiterRule::TokenBucket(TokenBucketConfig::new(3, 1.0, "1s")),
            LimiterRule::TokenBucket(TokenBucketConfig::new(3, 0.5, "1s").atomic()),
            LimiterRule::LeakyBucket(LeakyBucketConfig::new(3, 1.0, "1s")),
            LimiterRule::LeakyBucket(LeakyBucketConfig::new(3, 2.5, "1s").atomic()),
        ]
    }

    #[tokio::test]
    async fn test_decision_invariants_hold_for_every_strategy() {
        for (i, rule) in rules().iter().enumerate() {
            let clock = Arc::new(ManualClock::new(1_700_000_000_000));
            let store = Arc::new(MemoryStore::with_clock(clock.clone()));
            let limiter =
                RateLimiter::from_rule(format!("rule-{i}"), rule, store, clock.clone()).unwrap();

            let mut rejected = 0;
            for step in 0..40u64 {
                // Bursts separated by irregular pauses
                if step % 7 == 0 {
                    clock.advance_millis(step * 53 % 1_300);
                }
                let decision = limiter.check("client").await.unwrap();

                assert!(decision.remaining() <= decision.limit(), "{rule:?}");
                assert_eq!(decision.limit(), 3);
                assert_eq!(
                    decision.retry_after().is_some(),
                    !decision.success(),
                    "{rule:?}"
                );
                if !decision.success() {
                    rejected += 1;
                }
            }
            assert!(rejected > 0, "{rule:?} never rejected");
        }
    }

    #[tokio::test]
    async fn test_facade_reports_inner_strategy() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let limiter = RateLimiter::from_rule(
            "api",
            &LimiterRule::TokenBucket(TokenBucketConfig::new(7, 1.0, "1s")),
            store,
            clock,
        )
        .unwrap();

        assert_eq!(limiter.name(), "api");
        assert_eq!(limiter.algorithm(), Algorithm::TokenBucket);
        assert_eq!(limiter.limit(), 7);
    }

    #[tokio::test]
    async fn test_store_errors_propagate() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = MemoryStore::with_clock(clock.clone());
        let limiter = RateLimiter::from_rule(
            "api",
            &LimiterRule::LeakyBucket(LeakyBucketConfig::new(3, 1.0, "1s")),
            Arc::new(store.clone()),
            clock,
        )
        .unwrap();

        store
            .set("leaky:client", "{\"level\":".to_string())
            .await
            .unwrap();
        assert!(limiter.check("client").await.is_err());
    }

    /// Collects formatted log output for assertions.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_new_state_is_logged_once() {
        let cases = [
            (
                LimiterRule::FixedWindow(WindowConfig::new(3, "1s")),
                "Opened fixed window",
            ),
            (
                LimiterRule::SlidingWindow(WindowConfig::new(3, "1s")),
                "Opened sliding window bucket",
            ),
            (
                LimiterRule::TokenBucket(TokenBucketConfig::new(3, 1.0, "1s")),
                "Creating new token bucket",
            ),
            (
                LimiterRule::LeakyBucket(LeakyBucketConfig::new(3, 1.0, "1s")),
                "Creating new leaky bucket",
            ),
        ];

        for (rule, message) in cases {
            let logs = LogBuffer::default();
            let writer = logs.clone();
            let subscriber = tracing_subscriber::fmt()
                .with_max_level(tracing::Level::DEBUG)
                .with_writer(move || writer.clone())
                .finish();
            let _guard = tracing::subscriber::set_default(subscriber);

            let clock = Arc::new(ManualClock::new(1_700_000_000_000));
            let store = Arc::new(MemoryStore::with_clock(clock.clone()));
            let limiter = RateLimiter::from_rule("api", &rule, store, clock).unwrap();
            limiter.check("client").await.unwrap();
            limiter.check("client").await.unwrap();

            assert_eq!(logs.contents().matches(message).count(), 1, "{rule:?}");
        }
    }
}
