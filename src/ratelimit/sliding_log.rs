//! Sliding window log rate limiting.
//!
//! Keeps the timestamp of every admitted request inside the trailing window,
//! which makes it the only exact algorithm here at the cost of
//! `O(tokens)` storage per identifier.
//!
//! Two storage layouts are supported. With an ordered-set store each request
//! is a member scored by its timestamp and pruning happens server-side. With
//! a plain key-value store the whole log is a JSON array that is read,
//! filtered and rewritten on every admitted request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use uuid::Uuid;

use super::bucket::{read_modify_write, Commit};
use super::decision::ceil_secs;
use super::{Algorithm, Decision, Limiter, StorageKey, WindowConfig};
use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, Result, TollgateError};
use crate::store::{self, Capability, CounterStore, SortedSetStore};

/// Where the log lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStorage {
    /// One ordered-set member per request
    SortedSet,
    /// A JSON array of timestamps
    KeyValue,
}

/// Configuration for [`SlidingLog`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlidingLogConfig {
    /// Requests admitted per trailing window
    pub tokens: u64,
    /// Window length as a duration string
    pub window: String,
    /// Storage layout. Picked from the store's capabilities when unset.
    #[serde(default, rename = "log_storage", alias = "storage")]
    pub storage: Option<LogStorage>,
    /// Use compare-and-swap for the key-value layout
    #[serde(default)]
    pub atomic: bool,
}

impl SlidingLogConfig {
    pub fn new(tokens: u64, window: impl Into<String>) -> Self {
        Self {
            tokens,
            window: window.into(),
            storage: None,
            atomic: false,
        }
    }

    /// Force a storage layout.
    pub fn with_storage(mut self, storage: LogStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Ask for lost-update-free writes.
    pub fn atomic(mut self) -> Self {
        self.atomic = true;
        self
    }
}

/// Unique member names for ordered-set entries.
///
/// Pairs the request timestamp with a per-limiter random instance id and a
/// monotonic sequence, so members never collide within a process and are
/// vanishingly unlikely to collide across processes.
#[derive(Debug)]
struct MemberIds {
    instance: String,
    sequence: AtomicU64,
}

impl MemberIds {
    fn new() -> Self {
        Self {
            instance: Uuid::new_v4().simple().to_string(),
            sequence: AtomicU64::new(0),
        }
    }

    fn next(&self, now: u64) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{}", now, self.instance, seq)
    }
}

/// Exact sliding window limiter.
#[derive(Debug)]
pub struct SlidingLog {
    tokens: u64,
    window_ms: u64,
    storage: LogStorage,
    commit: Commit,
    members: MemberIds,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
}

impl SlidingLog {
    /// Validate `config` and bind it to `store`.
    ///
    /// Fails if the requested layout or atomicity is not offered by `store`.
    pub fn new(config: &SlidingLogConfig, store: Arc<dyn CounterStore>) -> Result<Self> {
        let (tokens, window_ms) = WindowConfig::new(config.tokens, config.window.clone()).resolve()?;

        let storage = match config.storage {
            Some(storage) => storage,
            // Atomic writes are only defined for the key-value layout
            None if config.atomic => LogStorage::KeyValue,
            None if store.supports(Capability::SortedSet) => LogStorage::SortedSet,
            None => LogStorage::KeyValue,
        };

        let commit = match storage {
            LogStorage::SortedSet => {
                if config.atomic {
                    return Err(ConfigError::InvalidValue {
                        field: "atomic",
                        reason: "only the key_value log storage supports atomic updates"
                            .to_string(),
                    }
                    .into());
                }
                store::require(store.as_ref(), Algorithm::SlidingLog, Capability::SortedSet)?;
                Commit::Overwrite
            }
            LogStorage::KeyValue => Commit::bind(store.as_ref(), Algorithm::SlidingLog, config.atomic)?,
        };

        debug!(
            tokens = tokens,
            window_ms = window_ms,
            storage = ?storage,
            "Bound sliding log limiter"
        );

        Ok(Self {
            tokens,
            window_ms,
            storage,
            commit,
            members: MemberIds::new(),
            store,
            clock: Arc::new(SystemClock),
        })
    }

    /// Read time from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The layout chosen at construction.
    pub fn storage(&self) -> LogStorage {
        self.storage
    }

    fn log_ttl_secs(&self) -> u64 {
        ceil_secs(self.window_ms) + 1
    }

    async fn check_sorted(
        &self,
        zset: &dyn SortedSetStore,
        key: &str,
        now: u64,
    ) -> Result<Decision> {
        let window_start = now.saturating_sub(self.window_ms);

        zset.zremrangebyscore(key, f64::NEG_INFINITY, window_start as f64)
            .await?;
        let count = zset.zcard(key).await?;

        if count >= self.tokens {
            let oldest = zset.zrange(key, 0, 0, true).await?;
            let reset = oldest
                .first()
                .and_then(|entry| entry.score)
                .map(|score| score as u64 + self.window_ms)
                .unwrap_or(now + self.window_ms);
            return Ok(Decision::deny(
                self.tokens,
                0,
                reset,
                ceil_secs(reset.saturating_sub(now)),
            ));
        }

        zset.zadd(key, now as f64, &self.members.next(now)).await?;
        self.store.expire(key, self.log_ttl_secs()).await?;

        Ok(Decision::allow(
            self.tokens,
            self.tokens - count - 1,
            now + self.window_ms,
        ))
    }

    async fn check_key_value(&self, key: &str, now: u64) -> Result<Decision> {
        let window_start = now.saturating_sub(self.window_ms);
        let tokens = self.tokens;
        let window_ms = self.window_ms;

        read_modify_write(
            self.store.as_ref(),
            Algorithm::SlidingLog,
            self.commit,
            key,
            self.log_ttl_secs(),
            |log: Option<Vec<u64>>| {
                let mut timestamps: Vec<u64> = log
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|ts| *ts > window_start)
                    .collect();

                if timestamps.len() as u64 >= tokens {
                    let oldest = timestamps.iter().copied().min().unwrap_or(now);
                    let reset = oldest + window_ms;
                    let decision =
                        Decision::deny(tokens, 0, reset, ceil_secs(reset.saturating_sub(now)));
                    return (None, decision);
                }

                timestamps.push(now);
                let oldest = timestamps.iter().copied().min().unwrap_or(now);
                let decision = Decision::allow(
                    tokens,
                    tokens - timestamps.len() as u64,
                    oldest + window_ms,
                );
                (Some(timestamps), decision)
            },
        )
        .await
    }
}

#[async_trait]
impl Limiter for SlidingLog {
    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingLog
    }

    fn limit(&self) -> u64 {
        self.tokens
    }

    async fn check(&self, identifier: &str) -> Result<Decision> {
        let now = self.clock.now_millis();
        let key = StorageKey::state(Algorithm::SlidingLog, identifier).to_store_key();

        trace!(key = %key, storage = ?self.storage, "Checking sliding log");

        match self.storage {
            LogStorage::SortedSet => {
                let zset = self.store.sorted_sets().ok_or(TollgateError::Capability {
                    algorithm: Algorithm::SlidingLog,
                    capability: Capability::SortedSet,
                })?;
                self.check_sorted(zset, &key, now).await
            }
            LogStorage::KeyValue => self.check_key_value(&key, now).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    const START: u64 = 1_700_000_000_000;

    fn setup(
        sorted_sets: bool,
        config: SlidingLogConfig,
    ) -> (SlidingLog, MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START));
        let mut store = MemoryStore::with_clock(clock.clone());
        if !sorted_sets {
            store = store.without_sorted_sets();
        }
        let limiter = SlidingLog::new(&config, Arc::new(store.clone()))
            .unwrap()
            .with_clock(clock.clone());
        (limiter, store, clock)
    }

    async fn entry_count(limiter: &SlidingLog, store: &MemoryStore) -> u64 {
        let key = StorageKey::state(Algorithm::SlidingLog, "client").to_store_key();
        match limiter.storage() {
            LogStorage::SortedSet => store.sorted_sets().unwrap().zcard(&key).await.unwrap(),
            LogStorage::KeyValue => store
                .get(&key)
                .await
                .unwrap()
                .map(|raw| serde_json::from_str::<Vec<u64>>(&raw).unwrap().len() as u64)
                .unwrap_or(0),
        }
    }

    async fn exercise_exact_window(limiter: SlidingLog, store: MemoryStore, clock: Arc<ManualClock>) {
        let first = limiter.check("client").await.unwrap();
        assert!(first.success());
        assert_eq!(first.remaining(), 1);

        clock.set(START + 400);
        let second = limiter.check("client").await.unwrap();
        assert!(second.success());
        assert_eq!(second.remaining(), 0);
        assert_eq!(entry_count(&limiter, &store).await, 2);

        clock.set(START + 900);
        let third = limiter.check("client").await.unwrap();
        assert!(!third.success());
        assert_eq!(third.reset(), START + 1_000);
        assert_eq!(third.retry_after(), Some(1));
        assert_eq!(entry_count(&limiter, &store).await, 2);

        // The first entry has aged out, the second has not
        clock.set(START + 1_000);
        let fourth = limiter.check("client").await.unwrap();
        assert!(fourth.success());
        assert_eq!(fourth.remaining(), 0);
        assert_eq!(entry_count(&limiter, &store).await, 2);

        assert!(!limiter.check("client").await.unwrap().success());
        assert!(entry_count(&limiter, &store).await <= 2);
    }

    #[tokio::test]
    async fn test_sorted_set_layout() {
        let (limiter, store, clock) = setup(true, SlidingLogConfig::new(2, "1s"));
        assert_eq!(limiter.storage(), LogStorage::SortedSet);
        exercise_exact_window(limiter, store, clock).await;
    }

    #[tokio::test]
    async fn test_key_value_layout() {
        let (limiter, store, clock) = setup(false, SlidingLogConfig::new(2, "1s"));
        assert_eq!(limiter.storage(), LogStorage::KeyValue);
        exercise_exact_window(limiter, store, clock).await;
    }

    #[tokio::test]
    async fn test_atomic_key_value_layout() {
        let (limiter, store, clock) = setup(true, SlidingLogConfig::new(2, "1s").atomic());
        assert_eq!(limiter.storage(), LogStorage::KeyValue);
        exercise_exact_window(limiter, store, clock).await;
    }

    #[tokio::test]
    async fn test_log_expires_after_window() {
        let (limiter, store, _) = setup(true, SlidingLogConfig::new(2, "1s"));
        limiter.check("client").await.unwrap();

        let key = StorageKey::state(Algorithm::SlidingLog, "client").to_store_key();
        assert_eq!(
            store.ttl(&key).await.unwrap(),
            crate::store::KeyTtl::Expires(2)
        );
    }

    #[tokio::test]
    async fn test_members_are_unique_within_one_millisecond() {
        let (limiter, store, _) = setup(true, SlidingLogConfig::new(50, "1m"));

        for _ in 0..50 {
            assert!(limiter.check("client").await.unwrap().success());
        }
        assert_eq!(entry_count(&limiter, &store).await, 50);
        assert!(!limiter.check("client").await.unwrap().success());
    }

    #[test]
    fn test_sorted_set_layout_requires_capability() {
        let store: Arc<dyn CounterStore> = Arc::new(MemoryStore::new().without_sorted_sets());
        let config = SlidingLogConfig::new(2, "1s").with_storage(LogStorage::SortedSet);

        assert!(matches!(
            SlidingLog::new(&config, store),
            Err(TollgateError::Capability {
                algorithm: Algorithm::SlidingLog,
                capability: Capability::SortedSet,
            })
        ));
    }

    #[test]
    fn test_atomic_requires_compare_and_swap() {
        let store: Arc<dyn CounterStore> =
            Arc::new(MemoryStore::new().without_sorted_sets().without_atomic());

        assert!(matches!(
            SlidingLog::new(&SlidingLogConfig::new(2, "1s").atomic(), store),
            Err(TollgateError::Capability {
                capability: Capability::CompareAndSwap,
                ..
            })
        ));
    }

    #[test]
    fn test_atomic_sorted_set_is_rejected() {
        let store: Arc<dyn CounterStore> = Arc::new(MemoryStore::new());
        let config = SlidingLogConfig::new(2, "1s")
            .with_storage(LogStorage::SortedSet)
            .atomic();

        assert!(matches!(
            SlidingLog::new(&config, store),
            Err(TollgateError::Config(ConfigError::InvalidValue { field: "atomic", .. }))
        ));
    }

    #[test]
    fn test_member_ids_are_unique() {
        let ids = MemberIds::new();
        let a = ids.next(5);
        let b = ids.next(5);
        assert_ne!(a, b);
        assert!(a.starts_with("5-"));
    }
}
