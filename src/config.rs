//! Configuration of rate limiting policies.
//!
//! A configuration names a set of policies, each describing one algorithm
//! and its limits, plus the location of the shared store:
//!
//! ```yaml
//! store:
//!   url: redis://127.0.0.1:6379
//! policies:
//!   uploads:
//!     algorithm: concurrency
//!     permit_limit: 4
//!     queue_limit: 16
//!   api:
//!     algorithm: token_bucket
//!     token_limit: 100
//!     tokens_per_period: 10
//!     replenishment_period_ms: 1000
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LimiterError, Result};
use crate::ratelimit::{
    Algorithm, ConcurrencyOptions, ConcurrencyRateLimiter, FixedWindowOptions,
    FixedWindowRateLimiter, PartitionKey, PartitionedRateLimiter, RateLimiter,
    SlidingWindowOptions, SlidingWindowRateLimiter, TokenBucketOptions, TokenBucketRateLimiter,
};
use crate::store::{shared_factory, RedisStore, StoreFactory};

/// Prefix of environment variables overriding file settings,
/// e.g. `RATE_LIMITING__STORE__URL`.
pub const ENV_PREFIX: &str = "RATE_LIMITING";

/// Top-level rate limiting configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Shared store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Policies by name
    #[serde(default)]
    pub policies: HashMap<String, PolicyConfig>,
}

/// Shared store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_try_dequeue_period_ms() -> u64 {
    1000
}

/// One rate limiting policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum PolicyConfig {
    Concurrency {
        permit_limit: u32,
        #[serde(default)]
        queue_limit: u32,
        #[serde(default = "default_try_dequeue_period_ms")]
        try_dequeue_period_ms: u64,
    },
    FixedWindow {
        permit_limit: u32,
        window_ms: u64,
        /// Extra lease metadata
        #[serde(default)]
        metadata: HashMap<String, String>,
    },
    SlidingWindow {
        permit_limit: u32,
        window_ms: u64,
    },
    TokenBucket {
        token_limit: u32,
        tokens_per_period: u32,
        replenishment_period_ms: u64,
    },
}

impl PolicyConfig {
    pub fn algorithm(&self) -> Algorithm {
        match self {
            PolicyConfig::Concurrency { .. } => Algorithm::Concurrency,
            PolicyConfig::FixedWindow { .. } => Algorithm::FixedWindow,
            PolicyConfig::SlidingWindow { .. } => Algorithm::SlidingWindow,
            PolicyConfig::TokenBucket { .. } => Algorithm::TokenBucket,
        }
    }

    /// Build the limiter of `partition` under this policy.
    ///
    /// Concurrency, fixed window and sliding window limiters all keep their
    /// main state at `rl:{partition}`, each with a different data type. A
    /// partition must therefore be used with one of those algorithms only;
    /// mixing them fails at the first decision with a store type error.
    pub fn build(
        &self,
        partition: impl Into<PartitionKey>,
        store: StoreFactory,
    ) -> Result<Arc<dyn RateLimiter>> {
        let limiter: Arc<dyn RateLimiter> = match self {
            PolicyConfig::Concurrency {
                permit_limit,
                queue_limit,
                try_dequeue_period_ms,
            } => {
                let options = ConcurrencyOptions::new(*permit_limit)
                    .with_queue_limit(*queue_limit)
                    .with_try_dequeue_period(Duration::from_millis(*try_dequeue_period_ms))
                    .with_store(store);
                Arc::new(ConcurrencyRateLimiter::new(partition, options)?)
            }
            PolicyConfig::FixedWindow {
                permit_limit,
                window_ms,
                metadata,
            } => {
                let mut options =
                    FixedWindowOptions::new(*permit_limit, Duration::from_millis(*window_ms))
                        .with_store(store);
                options.custom_metadata = metadata.clone();
                Arc::new(FixedWindowRateLimiter::new(partition, options)?)
            }
            PolicyConfig::SlidingWindow {
                permit_limit,
                window_ms,
            } => {
                let options =
                    SlidingWindowOptions::new(*permit_limit, Duration::from_millis(*window_ms))
                        .with_store(store);
                Arc::new(SlidingWindowRateLimiter::new(partition, options)?)
            }
            PolicyConfig::TokenBucket {
                token_limit,
                tokens_per_period,
                replenishment_period_ms,
            } => {
                let options = TokenBucketOptions::new(
                    *token_limit,
                    *tokens_per_period,
                    Duration::from_millis(*replenishment_period_ms),
                )
                .with_store(store);
                Arc::new(TokenBucketRateLimiter::new(partition, options)?)
            }
        };
        Ok(limiter)
    }
}

impl RateLimitingConfig {
    /// Parse configuration from YAML text.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).map_err(|e| LimiterError::Config(e.to_string()))
    }

    /// Load configuration from a YAML file, then apply `RATE_LIMITING__*`
    /// environment overrides.
    ///
    /// Keys are case-insensitive, so policy names are read back lowercased.
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::new(path, config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| LimiterError::Config(e.to_string()))?;

        let config: RateLimitingConfig = settings
            .try_deserialize()
            .map_err(|e| LimiterError::Config(e.to_string()))?;

        info!(path = %path, policies = config.policies.len(), "Loaded rate limiting configuration");
        Ok(config)
    }

    /// Look up a policy by name.
    pub fn policy(&self, name: &str) -> Result<&PolicyConfig> {
        self.policies
            .get(name)
            .ok_or_else(|| LimiterError::Config(format!("unknown rate limiting policy: {}", name)))
    }

    /// Build a limiter for every partition of the named policy.
    pub fn partitioned<K>(&self, name: &str, store: StoreFactory) -> Result<PartitionedRateLimiter<K>>
    where
        K: Eq + std::hash::Hash + Clone + fmt::Display,
    {
        let policy = self.policy(name)?.clone();
        Ok(PartitionedRateLimiter::new(move |partition| {
            policy.build(partition, store.clone())
        }))
    }

    /// Connect to the configured Redis store.
    pub async fn connect_store(&self) -> Result<StoreFactory> {
        let store = RedisStore::connect(&self.store.url).await?;
        Ok(shared_factory(Arc::new(store)))
    }
}
