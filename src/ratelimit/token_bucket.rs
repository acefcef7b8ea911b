//! Token bucket limiter with lazy replenishment.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::keys::PartitionKey;
use super::lease::{Lease, LeaseContext};
use super::limiter::{
    as_millis, check_permit_count, ensure_active, millis, Algorithm, IdleTracker, RateLimiter,
    RateLimiterStatistics,
};
use super::manager::TokenBucketManager;
use crate::error::{LimiterError, Result};
use crate::store::StoreFactory;

/// Options of a [`TokenBucketRateLimiter`].
#[derive(Clone)]
pub struct TokenBucketOptions {
    /// Bucket capacity
    pub token_limit: u32,
    /// Tokens added every replenishment period
    pub tokens_per_period: u32,
    pub replenishment_period: Duration,
    pub store_factory: Option<StoreFactory>,
}

impl TokenBucketOptions {
    pub fn new(token_limit: u32, tokens_per_period: u32, replenishment_period: Duration) -> Self {
        Self {
            token_limit,
            tokens_per_period,
            replenishment_period,
            store_factory: None,
        }
    }

    pub fn with_store(mut self, store_factory: StoreFactory) -> Self {
        self.store_factory = Some(store_factory);
        self
    }

    fn validate(&self) -> Result<StoreFactory> {
        if self.token_limit == 0 {
            return Err(LimiterError::Config(
                "token_limit must be greater than 0".to_string(),
            ));
        }
        if self.tokens_per_period == 0 {
            return Err(LimiterError::Config(
                "tokens_per_period must be greater than 0".to_string(),
            ));
        }
        if as_millis(self.replenishment_period) < 1 {
            return Err(LimiterError::Config(
                "replenishment_period must be at least 1ms".to_string(),
            ));
        }
        self.store_factory
            .clone()
            .ok_or_else(|| LimiterError::Config("store_factory is required".to_string()))
    }
}

impl fmt::Debug for TokenBucketOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucketOptions")
            .field("token_limit", &self.token_limit)
            .field("tokens_per_period", &self.tokens_per_period)
            .field("replenishment_period", &self.replenishment_period)
            .field("store_factory", &self.store_factory.is_some())
            .finish()
    }
}

/// Spends tokens from a bucket refilled by a fixed amount every period.
///
/// Refill is computed from elapsed time on each decision. Rejected
/// attempts leave the stored bucket untouched.
pub struct TokenBucketRateLimiter {
    partition: PartitionKey,
    token_limit: u32,
    manager: TokenBucketManager,
    idle: IdleTracker,
    disposed: AtomicBool,
}

impl TokenBucketRateLimiter {
    pub fn new(partition: impl Into<PartitionKey>, options: TokenBucketOptions) -> Result<Self> {
        let store_factory = options.validate()?;
        let partition = partition.into();
        let manager = TokenBucketManager::new(
            &partition,
            store_factory(),
            options.token_limit,
            options.tokens_per_period,
            as_millis(options.replenishment_period),
        );

        debug!(
            partition = %partition,
            token_limit = options.token_limit,
            tokens_per_period = options.tokens_per_period,
            replenishment_period = ?options.replenishment_period,
            "Created token bucket rate limiter"
        );

        Ok(Self {
            partition,
            token_limit: options.token_limit,
            manager,
            idle: IdleTracker::new(),
            disposed: AtomicBool::new(false),
        })
    }

    async fn decide(&self, permit_count: u32) -> Result<Lease> {
        ensure_active(&self.disposed)?;
        check_permit_count(permit_count, self.token_limit)?;
        let _in_flight = self.idle.begin();

        let response = self.manager.try_acquire(permit_count).await?;
        let mut context = LeaseContext {
            permit_count,
            limit: self.token_limit,
            remaining: Some(response.tokens.max(0) as u64),
            ..Default::default()
        };

        if response.allowed {
            return Ok(Lease::acquired(context));
        }

        context.retry_after = Some(millis(response.retry_after_ms));
        debug!(
            partition = %self.partition,
            permit_count = permit_count,
            tokens = response.tokens,
            retry_after_ms = response.retry_after_ms,
            "Token bucket exhausted"
        );
        Ok(Lease::failed(context))
    }
}

#[async_trait]
impl RateLimiter for TokenBucketRateLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }

    fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    async fn attempt_acquire(&self, permit_count: u32) -> Result<Lease> {
        self.decide(permit_count).await
    }

    async fn acquire_with_cancellation(
        &self,
        permit_count: u32,
        _cancel: CancellationToken,
    ) -> Result<Lease> {
        self.decide(permit_count).await
    }

    async fn statistics(&self) -> Result<Option<RateLimiterStatistics>> {
        ensure_active(&self.disposed)?;
        Ok(None)
    }

    fn idle_duration(&self) -> Duration {
        self.idle.idle_duration()
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

impl fmt::Debug for TokenBucketRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucketRateLimiter")
            .field("partition", &self.partition)
            .field("token_limit", &self.token_limit)
            .finish()
    }
}
