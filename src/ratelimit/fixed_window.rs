//! Fixed window counter limiter.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::keys::PartitionKey;
use super::lease::{Lease, LeaseContext};
use super::limiter::{
    as_millis, check_permit_count, ensure_active, millis, timestamp, Algorithm, IdleTracker,
    RateLimiter, RateLimiterStatistics,
};
use super::manager::FixedWindowManager;
use crate::error::{LimiterError, Result};
use crate::store::StoreFactory;

/// Options of a [`FixedWindowRateLimiter`].
#[derive(Clone)]
pub struct FixedWindowOptions {
    pub permit_limit: u32,
    pub window: Duration,
    /// Extra metadata copied into every lease
    pub custom_metadata: HashMap<String, String>,
    pub store_factory: Option<StoreFactory>,
}

impl FixedWindowOptions {
    pub fn new(permit_limit: u32, window: Duration) -> Self {
        Self {
            permit_limit,
            window,
            custom_metadata: HashMap::new(),
            store_factory: None,
        }
    }

    pub fn with_metadata(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_metadata.insert(name.into(), value.into());
        self
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

impl fmt::Debug for FixedWindowOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedWindowOptions")
            .field("permit_limit", &self.permit_limit)
            .field("window", &self.window)
            .field("custom_metadata", &self.custom_metadata)
            .field("store_factory", &self.store_factory.is_some())
            .finish()
    }
}

/// Counts permits in consecutive windows of fixed length.
///
/// A window starts with the first request after the previous one ended;
/// there is no background timer. Leases hold nothing and need no release.
pub struct FixedWindowRateLimiter {
    partition: PartitionKey,
    permit_limit: u32,
    window: Duration,
    custom_metadata: HashMap<String, String>,
    manager: FixedWindowManager,
    idle: IdleTracker,
    disposed: AtomicBool,
}

impl FixedWindowRateLimiter {
    pub fn new(partition: impl Into<PartitionKey>, options: FixedWindowOptions) -> Result<Self> {
        let store_factory = options.validate()?;
        let partition = partition.into();
        let manager = FixedWindowManager::new(
            &partition,
            store_factory(),
            options.permit_limit,
            as_millis(options.window),
        );

        debug!(
            partition = %partition,
            permit_limit = options.permit_limit,
            window = ?options.window,
            "Created fixed window rate limiter"
        );

        Ok(Self {
            partition,
            permit_limit: options.permit_limit,
            window: options.window,
            custom_metadata: options.custom_metadata,
            manager,
            idle: IdleTracker::new(),
            disposed: AtomicBool::new(false),
        })
    }

    async fn decide(&self, permit_count: u32) -> Result<Lease> {
        ensure_active(&self.disposed)?;
        check_permit_count(permit_count, self.permit_limit)?;
        let _in_flight = self.idle.begin();

        let response = self.manager.try_acquire(permit_count).await?;
        let remaining = (i64::from(self.permit_limit) - response.count).max(0);
        let context = LeaseContext {
            request_id: None,
            permit_count,
            limit: self.permit_limit,
            remaining: Some(remaining as u64),
            window: Some(self.window),
            retry_after: Some(millis(response.expires_at - response.now)),
            reset_at: timestamp(response.expires_at),
            custom: self.custom_metadata.clone(),
        };

        if response.allowed {
            Ok(Lease::acquired(context))
        } else {
            debug!(
                partition = %self.partition,
                permit_count = permit_count,
                count = response.count,
                limit = self.permit_limit,
                "Fixed window limit reached"
            );
            Ok(Lease::failed(context))
        }
    }
}

#[async_trait]
impl RateLimiter for FixedWindowRateLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::FixedWindow
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

impl fmt::Debug for FixedWindowRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedWindowRateLimiter")
            .field("partition", &self.partition)
            .field("permit_limit", &self.permit_limit)
            .field("window", &self.window)
            .finish()
    }
}
