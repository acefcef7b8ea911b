//! Per-partition limiter cache.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::keys::PartitionKey;
use super::lease::Lease;
use super::limiter::RateLimiter;
use crate::error::Result;

/// Builds the limiter of a partition on first use.
pub type LimiterFactory = Arc<dyn Fn(PartitionKey) -> Result<Arc<dyn RateLimiter>> + Send + Sync>;

/// Routes acquisitions to one limiter per partition key.
///
/// Limiters are created lazily and live until [`evict_idle`] removes them,
/// so hosting code should call it periodically with a threshold well above
/// the typical gap between requests of one partition.
///
/// [`evict_idle`]: PartitionedRateLimiter::evict_idle
pub struct PartitionedRateLimiter<K> {
    limiters: DashMap<K, Arc<dyn RateLimiter>>,
    factory: LimiterFactory,
}

impl<K> PartitionedRateLimiter<K>
where
    K: Eq + Hash + Clone + fmt::Display,
{
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(PartitionKey) -> Result<Arc<dyn RateLimiter>> + Send + Sync + 'static,
    {
        Self {
            limiters: DashMap::new(),
            factory: Arc::new(factory),
        }
    }

    /// The limiter of `key`, created if missing.
    pub fn limiter(&self, key: &K) -> Result<Arc<dyn RateLimiter>> {
        if let Some(limiter) = self.limiters.get(key) {
            return Ok(limiter.clone());
        }

        match self.limiters.entry(key.clone()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let limiter = (self.factory)(PartitionKey::new(key))?;
                debug!(
                    partition = %key,
                    algorithm = %limiter.algorithm(),
                    "Created partition rate limiter"
                );
                entry.insert(limiter.clone());
                Ok(limiter)
            }
        }
    }

    pub async fn attempt_acquire(&self, key: &K, permit_count: u32) -> Result<Lease> {
        let limiter = self.limiter(key)?;
        limiter.attempt_acquire(permit_count).await
    }

    pub async fn acquire(&self, key: &K, permit_count: u32) -> Result<Lease> {
        let limiter = self.limiter(key)?;
        limiter.acquire(permit_count).await
    }

    pub async fn acquire_with_cancellation(
        &self,
        key: &K,
        permit_count: u32,
        cancel: CancellationToken,
    ) -> Result<Lease> {
        let limiter = self.limiter(key)?;
        limiter.acquire_with_cancellation(permit_count, cancel).await
    }

    /// Dispose and forget limiters idle for at least `threshold`.
    ///
    /// Limiters still referenced outside the cache are kept. Returns the
    /// number of evicted limiters.
    pub fn evict_idle(&self, threshold: Duration) -> usize {
        let before = self.limiters.len();
        self.limiters.retain(|key, limiter| {
            let idle = limiter.idle_duration();
            if idle < threshold || Arc::strong_count(limiter) > 1 {
                return true;
            }
            debug!(partition = %key, idle = ?idle, "Evicting idle rate limiter");
            limiter.dispose();
            false
        });
        before.saturating_sub(self.limiters.len())
    }

    /// Dispose every cached limiter.
    pub fn dispose(&self) {
        self.limiters.retain(|_, limiter| {
            limiter.dispose();
            false
        });
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

impl<K: Eq + Hash> fmt::Debug for PartitionedRateLimiter<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionedRateLimiter")
            .field("partitions", &self.limiters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{FixedWindowOptions, FixedWindowRateLimiter};
    use crate::store::{MemoryStore, StoreFactory};

    fn per_client(store: &Arc<MemoryStore>, permit_limit: u32) -> PartitionedRateLimiter<u64> {
        let factory: StoreFactory = store.factory();
        PartitionedRateLimiter::new(move |partition| {
            let options = FixedWindowOptions::new(permit_limit, Duration::from_secs(10))
                .with_store(factory.clone());
            Ok(Arc::new(FixedWindowRateLimiter::new(partition, options)?) as Arc<dyn RateLimiter>)
        })
    }

    #[tokio::test]
    async fn test_limiters_are_created_per_partition() {
        let store = Arc::new(MemoryStore::new());
        let limiters = per_client(&store, 1);

        assert!(limiters.acquire(&1, 1).await.unwrap().is_acquired());
        assert!(!limiters.acquire(&1, 1).await.unwrap().is_acquired());
        assert!(limiters.attempt_acquire(&2, 1).await.unwrap().is_acquired());
        assert_eq!(limiters.len(), 2);

        let a = limiters.limiter(&1).unwrap();
        let b = limiters.limiter(&1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.partition().as_str(), "1");
        assert_eq!(format!("{:?}", limiters), "PartitionedRateLimiter { partitions: 2 }");
    }

    #[tokio::test]
    async fn test_evict_idle() {
        let store = Arc::new(MemoryStore::new());
        let limiters = per_client(&store, 5);

        limiters.acquire(&7, 1).await.unwrap();
        let held = limiters.limiter(&8).unwrap();
        assert_eq!(limiters.evict_idle(Duration::from_secs(60)), 0);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(limiters.evict_idle(Duration::from_millis(20)), 1);
        assert_eq!(limiters.len(), 1);

        drop(held);
        assert_eq!(limiters.evict_idle(Duration::from_millis(20)), 1);
        assert!(limiters.is_empty());

        // State lives in the store, so a recreated limiter continues the window
        let lease = limiters.acquire(&7, 1).await.unwrap();
        assert_eq!(lease.context().remaining, Some(3));
    }

    #[tokio::test]
    async fn test_dispose_clears_cache() {
        let store = Arc::new(MemoryStore::new());
        let limiters = per_client(&store, 1);
        let limiter = limiters.limiter(&3).unwrap();

        limiters.dispose();
        assert!(limiters.is_empty());
        assert!(limiter.acquire(1).await.is_err());
    }
}
