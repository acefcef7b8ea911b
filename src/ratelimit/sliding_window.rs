//! Sliding window log limiter.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::keys::{new_request_id, PartitionKey};
use super::lease::{Lease, LeaseContext};
use super::limiter::{
    as_millis, check_permit_count, ensure_active, millis, timestamp, Algorithm, IdleTracker,
    RateLimiter, RateLimiterStatistics,
};
use super::manager::SlidingWindowManager;
use crate::error::{LimiterError, Result};
use crate::store::StoreFactory;

/// Options of a [`SlidingWindowRateLimiter`].
#[derive(Clone)]
pub struct SlidingWindowOptions {
    pub permit_limit: u32,
    pub window: Duration,
    pub store_factory: Option<StoreFactory>,
}

impl SlidingWindowOptions {
    pub fn new(permit_limit: u32, window: Duration) -> Self {
        Self {
            permit_limit,
            window,
            store_factory: None,
        }
    }

    pub fn with_store(mut self, store_factory: StoreFactory) -> Self {
        self.store_factory = Some(store_factory);
        self
    }

    fn validate(&self) -> Result<StoreFactory> {
        if self.permit_limit == 0 {
            return Err(LimiterError::Config(
                "permit_limit must be greater than 0".to_string(),
            ));
        }
        if as_millis(self.window) < 1 {
            return Err(LimiterError::Config(
                "window must be at least 1ms".to_string(),
            ));
        }
        self.store_factory
            .clone()
            .ok_or_else(|| LimiterError::Config("store_factory is required".to_string()))
    }
}

impl fmt::Debug for SlidingWindowOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlidingWindowOptions")
            .field("permit_limit", &self.permit_limit)
            .field("window", &self.window)
            .field("store_factory", &self.store_factory.is_some())
            .finish()
    }
}

/// Admits at most `permit_limit` permits in any interval of length `window`.
///
/// Every granted permit is logged with its timestamp; entries older than the
/// window are evicted by the next decision.
pub struct SlidingWindowRateLimiter {
    partition: PartitionKey,
    permit_limit: u32,
    window: Duration,
    manager: SlidingWindowManager,
    idle: IdleTracker,
    disposed: AtomicBool,
}

impl SlidingWindowRateLimiter {
    pub fn new(partition: impl Into<PartitionKey>, options: SlidingWindowOptions) -> Result<Self> {
        let store_factory = options.validate()?;
        let partition = partition.into();
        let manager = SlidingWindowManager::new(
            &partition,
            store_factory(),
            options.permit_limit,
            as_millis(options.window),
        );

        debug!(
            partition = %partition,
            permit_limit = options.permit_limit,
            window = ?options.window,
            "Created sliding window rate limiter"
        );

        Ok(Self {
            partition,
            permit_limit: options.permit_limit,
            window: options.window,
            manager,
            idle: IdleTracker::new(),
            disposed: AtomicBool::new(false),
        })
    }

    async fn decide(&self, permit_count: u32) -> Result<Lease> {
        ensure_active(&self.disposed)?;
        check_permit_count(permit_count, self.permit_limit)?;
        let _in_flight = self.idle.begin();

        let request_id = new_request_id();
        let response = self.manager.try_acquire(&request_id, permit_count).await?;

        let held = if response.allowed {
            response.count + i64::from(permit_count)
        } else {
            response.count
        };
        let mut context = LeaseContext {
            request_id: Some(request_id),
            permit_count,
            limit: self.permit_limit,
            remaining: Some((i64::from(self.permit_limit) - held).max(0) as u64),
            window: Some(self.window),
            retry_after: None,
            reset_at: timestamp(response.reset_at),
            custom: Default::default(),
        };

        if response.allowed {
            return Ok(Lease::acquired(context));
        }

        context.retry_after = Some(millis(response.reset_at - response.now));
        debug!(
            partition = %self.partition,
            permit_count = permit_count,
            count = response.count,
            limit = self.permit_limit,
            "Sliding window limit reached"
        );
        Ok(Lease::failed(context))
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowRateLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindow
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
        Ok(Some(self.manager.statistics().await?))
    }

    fn idle_duration(&self) -> Duration {
        self.idle.idle_duration()
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

impl fmt::Debug for SlidingWindowRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlidingWindowRateLimiter")
            .field("partition", &self.partition)
            .field("permit_limit", &self.permit_limit)
            .field("window", &self.window)
            .finish()
    }
}
