//! Limiter trait shared by every algorithm.

use std::fmt;

use async_trait::async_trait;

use super::{Algorithm, Decision};
use crate::error::Result;

/// A configured rate limiting strategy bound to a counter store.
///
/// Implementations keep no in-process state of their own beyond their
/// configuration: everything per identifier lives in the store, so limiters
/// can be shared across tasks and checked concurrently for different
/// identifiers.
///
/// A store failure during `check` is returned as-is. Whether to admit or
/// reject the request in that case is the caller's decision.
#[async_trait]
pub trait Limiter: Send + Sync + fmt::Debug {
    /// The algorithm this limiter runs.
    fn algorithm(&self) -> Algorithm;

    /// The quota reported as `limit` on every decision.
    fn limit(&self) -> u64;

    /// Decide whether a new action by `identifier` is admitted.
    async fn check(&self, identifier: &str) -> Result<Decision>;
}
