//! Configuration management for Tollgate.
//!
//! ```yaml
//! store:
//!   sorted_sets: true
//!   sweep_interval: 30s
//! limiters:
//!   login:
//!     algorithm: sliding_log
//!     tokens: 5
//!     window: 1m
//!   api:
//!     algorithm: token_bucket
//!     max_tokens: 100
//!     refill_rate: 10
//!     interval: 1s
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::clock::Clock;
use crate::duration::parse_positive_ms;
use crate::error::Result;
use crate::ratelimit::{LimiterRule, RateLimiter};
use crate::store::{CounterStore, MemoryStore};

/// Main configuration for Tollgate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Named limiters
    #[serde(default)]
    pub limiters: BTreeMap<String, LimiterRule>,
}

/// Process-local store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Offer the ordered-set tier
    #[serde(default = "default_sorted_sets")]
    pub sorted_sets: bool,

    /// Run a background sweeper at this interval
    #[serde(default)]
    pub sweep_interval: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sorted_sets: default_sorted_sets(),
            sweep_interval: None,
        }
    }
}

fn default_sorted_sets() -> bool {
    true
}

impl StoreConfig {
    /// The sweeper interval, if one is configured.
    pub fn sweep_interval(&self) -> Result<Option<Duration>> {
        self.sweep_interval
            .as_deref()
            .map(|interval| {
                parse_positive_ms("sweep_interval", interval).map(Duration::from_millis)
            })
            .transpose()
            .map_err(Into::into)
    }

    /// Create the store this configuration describes.
    pub fn build(&self, clock: Arc<dyn Clock>) -> MemoryStore {
        let store = MemoryStore::with_clock(clock);
        if self.sorted_sets {
            store
        } else {
            store.without_sorted_sets()
        }
    }
}

impl TollgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)?;
        info!(limiters = config.limiters.len(), "Configuration loaded");
        Ok(config)
    }

    /// Build every configured limiter against `store`.
    ///
    /// Fails on the first invalid rule, so a bad configuration never serves
    /// a single check.
    pub fn build_limiters(
        &self,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<BTreeMap<String, RateLimiter>> {
        self.limiters
            .iter()
            .map(|(name, rule)| {
                let limiter = RateLimiter::from_rule(name.clone(), rule, store.clone(), clock.clone())?;
                Ok((name.clone(), limiter))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::{ConfigError, TollgateError};
    use crate::ratelimit::{Algorithm, WindowConfig};
    use crate::store::Capability;
    use std::io::Write;
    use tokio_test::{assert_err, assert_ok};

    const YAML: &str = r#"
store:
  sweep_interval: 30s
limiters:
  login:
    algorithm: sliding_log
    tokens: 2
    window: 1m
  api:
    algorithm: token_bucket
    max_tokens: 100
    refill_rate: 10
    interval: 1s
  uploads:
    algorithm: fixed_window
    tokens: 3
    window: 1h
"#;

    fn clock() -> Arc<dyn Clock> {
        Arc::new(ManualClock::new(1_700_000_000_000))
    }

    #[test]
    fn test_defaults() {
        let config = assert_ok!(TollgateConfig::from_yaml("{}"));
        assert!(config.store.sorted_sets);
        assert_eq!(config.store.sweep_interval, None);
        assert!(config.limiters.is_empty());
        assert_eq!(config, TollgateConfig::default());
    }

    #[test]
    fn test_from_yaml() {
        let config = assert_ok!(TollgateConfig::from_yaml(YAML));

        assert_eq!(config.limiters.len(), 3);
        assert_eq!(config.limiters["login"].algorithm(), Algorithm::SlidingLog);
        assert_eq!(
            config.limiters["uploads"],
            LimiterRule::FixedWindow(WindowConfig::new(3, "1h"))
        );
        assert_eq!(
            assert_ok!(config.store.sweep_interval()),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(YAML.as_bytes()).unwrap();

        let config = assert_ok!(TollgateConfig::from_file(file.path()));
        assert_eq!(config, assert_ok!(TollgateConfig::from_yaml(YAML)));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = assert_err!(TollgateConfig::from_file(dir.path().join("absent.yaml")));
        assert!(matches!(err, TollgateError::Io(_)));
    }

    #[test]
    fn test_bad_sweep_interval() {
        let config = assert_ok!(TollgateConfig::from_yaml("store:\n  sweep_interval: 5w\n"));
        let err = assert_err!(config.store.sweep_interval());
        assert!(matches!(
            err,
            TollgateError::Config(ConfigError::UnsupportedUnit(_))
        ));
    }

    #[tokio::test]
    async fn test_build_limiters() {
        let config = assert_ok!(TollgateConfig::from_yaml(YAML));
        let clock = clock();
        let store: Arc<dyn CounterStore> = Arc::new(config.store.build(clock.clone()));

        let limiters = assert_ok!(config.build_limiters(store, clock));
        assert_eq!(
            limiters.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["api", "login", "uploads"]
        );

        let login = &limiters["login"];
        assert!(login.check("alice").await.unwrap().success());
        assert!(login.check("alice").await.unwrap().success());
        assert!(!login.check("alice").await.unwrap().success());
        assert!(limiters["uploads"].check("alice").await.unwrap().success());
    }

    #[test]
    fn test_build_limiters_fails_fast() {
        let yaml = r#"
store:
  sorted_sets: false
limiters:
  login:
    algorithm: sliding_log
    tokens: 2
    window: 1m
    log_storage: sorted_set
"#;
        let config = assert_ok!(TollgateConfig::from_yaml(yaml));
        let clock = clock();
        let store = config.store.build(clock.clone());
        assert!(!store.supports(Capability::SortedSet));

        let err = assert_err!(config.build_limiters(Arc::new(store), clock));
        assert!(matches!(
            err,
            TollgateError::Capability {
                algorithm: Algorithm::SlidingLog,
                capability: Capability::SortedSet,
            }
        ));
    }
}
