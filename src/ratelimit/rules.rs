//! Declarative limiter rules.
//!
//! A rule names an algorithm and carries that algorithm's configuration. It
//! is what the YAML configuration holds for every named limiter, e.g.
//!
//! ```yaml
//! algorithm: token_bucket
//! max_tokens: 10
//! refill_rate: 1
//! interval: 1s
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{
    Algorithm, FixedWindow, LeakyBucket, LeakyBucketConfig, Limiter, SlidingLog,
    SlidingLogConfig, SlidingWindow, TokenBucket, TokenBucketConfig, WindowConfig,
};
use crate::clock::Clock;
use crate::error::Result;
use crate::store::CounterStore;

/// One limiter's algorithm and parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum LimiterRule {
    FixedWindow(WindowConfig),
    SlidingWindow(WindowConfig),
    SlidingLog(SlidingLogConfig),
    TokenBucket(TokenBucketConfig),
    LeakyBucket(LeakyBucketConfig),
}

impl LimiterRule {
    /// Parse a single rule from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            LimiterRule::FixedWindow(_) => Algorithm::FixedWindow,
            LimiterRule::SlidingWindow(_) => Algorithm::SlidingWindow,
            LimiterRule::SlidingLog(_) => Algorithm::SlidingLog,
            LimiterRule::TokenBucket(_) => Algorithm::TokenBucket,
            LimiterRule::LeakyBucket(_) => Algorithm::LeakyBucket,
        }
    }

    /// Validate the rule and bind it to `store`, reading time from `clock`.
    ///
    /// Every configuration or capability problem surfaces here.
    pub fn build(
        &self,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Box<dyn Limiter>> {
        let limiter: Box<dyn Limiter> = match self {
            LimiterRule::FixedWindow(config) => {
                Box::new(FixedWindow::new(config, store)?.with_clock(clock))
            }
            LimiterRule::SlidingWindow(config) => {
                Box::new(SlidingWindow::new(config, store)?.with_clock(clock))
            }
            LimiterRule::SlidingLog(config) => {
                Box::new(SlidingLog::new(config, store)?.with_clock(clock))
            }
            LimiterRule::TokenBucket(config) => {
                Box::new(TokenBucket::new(config, store)?.with_clock(clock))
            }
            LimiterRule::LeakyBucket(config) => {
                Box::new(LeakyBucket::new(config, store)?.with_clock(clock))
            }
        };
        Ok(limiter)
    }
}
