//! Storage key namespacing.
//!
//! Every key a limiter writes starts with its algorithm's prefix, so several
//! algorithms can share one store and one identifier without colliding.
//! Windowed algorithms append the bucket index; the others hold a single
//! key per identifier.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The five limiting algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    FixedWindow,
    SlidingWindow,
    SlidingLog,
    TokenBucket,
    LeakyBucket,
}

impl Algorithm {
    pub const ALL: [Algorithm; 5] = [
        Algorithm::FixedWindow,
        Algorithm::SlidingWindow,
        Algorithm::SlidingLog,
        Algorithm::TokenBucket,
        Algorithm::LeakyBucket,
    ];

    /// Configuration name, e.g. `fixed_window`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::SlidingLog => "sliding_log",
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::LeakyBucket => "leaky_bucket",
        }
    }

    /// Prefix of every store key this algorithm writes.
    pub fn key_prefix(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fixed",
            Algorithm::SlidingWindow => "sliding",
            Algorithm::SlidingLog => "log",
            Algorithm::TokenBucket => "bucket",
            Algorithm::LeakyBucket => "leaky",
        }
    }

    /// Whether keys carry a bucket index.
    pub fn is_windowed(&self) -> bool {
        matches!(self, Algorithm::FixedWindow | Algorithm::SlidingWindow)
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.key_prefix() == prefix)
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key identifying one piece of limiter state in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey {
    pub algorithm: Algorithm,
    pub identifier: String,
    /// Bucket index for windowed algorithms
    pub bucket: Option<u64>,
}

impl StorageKey {
    /// Key for one bucket of a windowed algorithm.
    pub fn bucket(algorithm: Algorithm, identifier: &str, bucket: u64) -> Self {
        Self {
            algorithm,
            identifier: identifier.to_string(),
            bucket: Some(bucket),
        }
    }

    /// Key for the single state entry of a per-identifier algorithm.
    pub fn state(algorithm: Algorithm, identifier: &str) -> Self {
        Self {
            algorithm,
            identifier: identifier.to_string(),
            bucket: None,
        }
    }

    /// Format: `{prefix}:{identifier}` or `{prefix}:{identifier}:{bucket}`.
    pub fn to_store_key(&self) -> String {
        match self.bucket {
            Some(bucket) => format!(
                "{}:{}:{}",
                self.algorithm.key_prefix(),
                self.identifier,
                bucket
            ),
            None => format!("{}:{}", self.algorithm.key_prefix(), self.identifier),
        }
    }

    /// Parse a store key. Identifiers may themselves contain `:`.
    pub fn from_store_key(key: &str) -> Option<Self> {
        let (prefix, rest) = key.split_once(':')?;
        let algorithm = Algorithm::from_prefix(prefix)?;

        if !algorithm.is_windowed() {
            return Some(Self::state(algorithm, rest));
        }

        // Split from the right so identifiers keep their own separators
        let (identifier, bucket) = rest.rsplit_once(':')?;
        let bucket = bucket.parse().ok()?;
        Some(Self::bucket(algorithm, identifier, bucket))
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_store_key())
    }
}
