//! Counter store contract.
//!
//! Limiters never touch persistence directly; every read and write goes
//! through a [`CounterStore`]. Values are strings, the way a networked
//! key-value server would hold them: counters as decimal text, structured
//! state as JSON.
//!
//! Capabilities are tiered. Every store offers the key-value tier; a store
//! may additionally expose ordered sets ([`SortedSetStore`]) and atomic
//! compare-and-swap ([`AtomicStore`]). A limiter that needs an optional tier
//! asks for it with [`require`] when it is constructed, so a missing
//! capability is reported before the first check rather than worked around.

mod memory;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreResult, TollgateError};
use crate::ratelimit::Algorithm;

pub use memory::{MemoryStore, SweeperHandle};

/// A capability tier a store can offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// get/set/setex/del/incr/expire/pexpire/ttl
    KeyValue,
    /// zadd/zremrangebyscore/zcard/zrange
    SortedSet,
    /// Conditional overwrite keyed on the previously read value
    CompareAndSwap,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::KeyValue => "key-value",
            Capability::SortedSet => "sorted-set",
            Capability::CompareAndSwap => "compare-and-swap",
        };
        f.write_str(name)
    }
}

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist
    Missing,
    /// The key exists and never expires
    Persistent,
    /// The key expires in this many seconds (rounded up)
    Expires(u64),
}

/// One member of an ordered set, as returned by [`SortedSetStore::zrange`].
#[derive(Debug, Clone, PartialEq)]
pub struct SortedEntry {
    pub member: String,
    /// Only populated when scores were requested
    pub score: Option<f64>,
}

/// The key-value tier every store provides.
#[async_trait]
pub trait CounterStore: Send + Sync + fmt::Debug {
    /// Read a value.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a value, clearing any expiry on the key.
    async fn set(&self, key: &str, value: String) -> StoreResult<()>;

    /// Write a value that expires after `ttl_secs` seconds.
    async fn setex(&self, key: &str, ttl_secs: u64, value: String) -> StoreResult<()>;

    /// Delete a key, returning whether it existed.
    async fn del(&self, key: &str) -> StoreResult<bool>;

    /// Atomically increment an integer, treating an absent key as 0.
    async fn incr(&self, key: &str) -> StoreResult<i64>;

    /// Attach an expiry in seconds. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<bool>;

    /// Attach an expiry in milliseconds. Returns false if the key does not exist.
    async fn pexpire(&self, key: &str, ttl_ms: u64) -> StoreResult<bool>;

    /// Report the remaining lifetime of a key.
    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl>;

    /// The ordered-set tier, if this store offers it.
    fn sorted_sets(&self) -> Option<&dyn SortedSetStore> {
        None
    }

    /// The compare-and-swap tier, if this store offers it.
    fn atomic(&self) -> Option<&dyn AtomicStore> {
        None
    }

    /// Whether this store offers `capability`.
    fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::KeyValue => true,
            Capability::SortedSet => self.sorted_sets().is_some(),
            Capability::CompareAndSwap => self.atomic().is_some(),
        }
    }

    /// Every capability tier this store offers.
    fn capabilities(&self) -> Vec<Capability> {
        [
            Capability::KeyValue,
            Capability::SortedSet,
            Capability::CompareAndSwap,
        ]
        .into_iter()
        .filter(|capability| self.supports(*capability))
        .collect()
    }
}

/// Ordered sets scored by `f64`, with Redis semantics.
#[async_trait]
pub trait SortedSetStore: Send + Sync {
    /// Insert or rescore a member. Returns true if the member is new.
    async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<bool>;

    /// Remove members with `min <= score <= max`, returning how many went.
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> StoreResult<u64>;

    /// Number of members in the set (0 when absent).
    async fn zcard(&self, key: &str) -> StoreResult<u64>;

    /// Members ranked `start..=stop` by ascending score. Negative indices
    /// count from the end.
    async fn zrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
        with_scores: bool,
    ) -> StoreResult<Vec<SortedEntry>>;
}

/// Conditional writes for lost-update-free read-modify-write cycles.
#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Replace the value at `key` with `new` (expiring after `ttl_secs`) only
    /// if it still equals `expected`. `None` means the key must be absent.
    /// Returns false when another writer got there first.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: String,
        ttl_secs: u64,
    ) -> StoreResult<bool>;
}

/// Fail unless `store` offers `capability`.
pub fn require(
    store: &dyn CounterStore,
    algorithm: Algorithm,
    capability: Capability,
) -> Result<()> {
    if store.supports(capability) {
        Ok(())
    } else {
        Err(TollgateError::Capability {
            algorithm,
            capability,
        })
    }
}
