//! Read-compute-write cycle for per-identifier JSON state.
//!
//! Token Bucket, Leaky Bucket and the key-value Sliding Log all load a
//! value, compute a decision and write the value back. With
//! [`Commit::Overwrite`] that is a plain `get` followed by `setex`: two
//! concurrent checks for the same identifier against a networked store can
//! interleave and one update is lost. [`Commit::CompareAndSwap`] closes the
//! gap by writing conditionally on the value that was read and recomputing
//! on conflict.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use super::Algorithm;
use crate::error::{Result, StoreError, TollgateError};
use crate::store::{self, Capability, CounterStore};

/// Conflicting writes tolerated before a check gives up.
pub(crate) const MAX_CAS_ATTEMPTS: usize = 8;

/// How updated state is written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Commit {
    /// Unconditional `setex`
    Overwrite,
    /// Conditional write, retried on conflict
    CompareAndSwap,
}

impl Commit {
    /// Pick the commit mode, failing if `atomic` is asked of a store that
    /// cannot honor it.
    pub(crate) fn bind(store: &dyn CounterStore, algorithm: Algorithm, atomic: bool) -> Result<Self> {
        if !atomic {
            return Ok(Commit::Overwrite);
        }
        store::require(store, algorithm, Capability::CompareAndSwap)?;
        Ok(Commit::CompareAndSwap)
    }
}

/// Load the state at `key`, hand it to `step`, and persist what `step`
/// returns with a `ttl_secs` expiry. Returning `None` from `step` leaves the
/// stored value untouched.
pub(crate) async fn read_modify_write<S, T, F>(
    store: &dyn CounterStore,
    algorithm: Algorithm,
    commit: Commit,
    key: &str,
    ttl_secs: u64,
    mut step: F,
) -> Result<T>
where
    S: Serialize + DeserializeOwned + Send,
    T: Send,
    F: FnMut(Option<S>) -> (Option<S>, T) + Send,
{
    let attempts = match commit {
        Commit::Overwrite => 1,
        Commit::CompareAndSwap => MAX_CAS_ATTEMPTS,
    };

    for attempt in 1..=attempts {
        let raw = store.get(key).await?;
        let current = match raw.as_deref() {
            Some(text) => Some(serde_json::from_str::<S>(text).map_err(StoreError::from)?),
            None => None,
        };

        let (next, outcome) = step(current);
        let Some(next) = next else {
            return Ok(outcome);
        };
        let encoded = serde_json::to_string(&next).map_err(StoreError::from)?;

        match commit {
            Commit::Overwrite => {
                store.setex(key, ttl_secs, encoded).await?;
                return Ok(outcome);
            }
            Commit::CompareAndSwap => {
                let atomic = store.atomic().ok_or(TollgateError::Capability {
                    algorithm,
                    capability: Capability::CompareAndSwap,
                })?;
                if atomic
                    .compare_and_swap(key, raw.as_deref(), encoded, ttl_secs)
                    .await?
                {
                    return Ok(outcome);
                }
                warn!(
                    key = %key,
                    attempt = attempt,
                    "Concurrent update detected, recomputing"
                );
            }
        }
    }

    Err(StoreError::Contention {
        key: key.to_string(),
        attempts,
    }
    .into())
}
