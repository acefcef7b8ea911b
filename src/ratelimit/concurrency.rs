//! Concurrency limiter with an optional FIFO wait queue.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::keys::{new_request_id, PartitionKey};
use super::lease::{Lease, LeaseContext, LeaseRelease};
use super::limiter::{
    check_permit_count, ensure_active, Algorithm, IdleTracker, RateLimiter, RateLimiterStatistics,
};
use super::manager::{AcquireMode, ConcurrencyManager, ConcurrencyResponse};
use super::queue::{QueuedRequest, RequestQueue};
use crate::error::{LimiterError, Result};
use crate::store::StoreFactory;

fn default_try_dequeue_period() -> Duration {
    Duration::from_secs(1)
}

/// Options of a [`ConcurrencyRateLimiter`].
#[derive(Clone)]
pub struct ConcurrencyOptions {
    /// Maximum simultaneously held permits
    pub permit_limit: u32,
    /// Maximum permits waiting in the queue, 0 disables queueing
    pub queue_limit: u32,
    /// Interval of the background dequeue pass
    pub try_dequeue_period: Duration,
    pub store_factory: Option<StoreFactory>,
}

impl ConcurrencyOptions {
    pub fn new(permit_limit: u32) -> Self {
        Self {
            permit_limit,
            queue_limit: 0,
            try_dequeue_period: default_try_dequeue_period(),
            store_factory: None,
        }
    }

    pub fn with_queue_limit(mut self, queue_limit: u32) -> Self {
        self.queue_limit = queue_limit;
        self
    }

    pub fn with_try_dequeue_period(mut self, period: Duration) -> Self {
        self.try_dequeue_period = period;
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
        if self.try_dequeue_period.is_zero() {
            return Err(LimiterError::Config(
                "try_dequeue_period must be greater than 0".to_string(),
            ));
        }
        self.store_factory
            .clone()
            .ok_or_else(|| LimiterError::Config("store_factory is required".to_string()))
    }
}

impl fmt::Debug for ConcurrencyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyOptions")
            .field("permit_limit", &self.permit_limit)
            .field("queue_limit", &self.queue_limit)
            .field("try_dequeue_period", &self.try_dequeue_period)
            .field("store_factory", &self.store_factory.is_some())
            .finish()
    }
}

struct Inner {
    this: Weak<Inner>,
    partition: PartitionKey,
    permit_limit: u32,
    queue_limit: u32,
    manager: Arc<ConcurrencyManager>,
    queue: RequestQueue,
    /// Serializes dequeue passes
    dequeue_lock: tokio::sync::Mutex<()>,
    idle: IdleTracker,
    disposed: AtomicBool,
    shutdown: CancellationToken,
}

impl Inner {
    fn context(&self, request_id: &str, permit_count: u32, held: i64) -> LeaseContext {
        let remaining = (i64::from(self.permit_limit) - held).max(0);
        LeaseContext {
            request_id: Some(request_id.to_string()),
            permit_count,
            limit: self.permit_limit,
            remaining: Some(remaining as u64),
            ..Default::default()
        }
    }

    fn granted(
        self: &Arc<Self>,
        request_id: &str,
        permit_count: u32,
        response: &ConcurrencyResponse,
    ) -> Lease {
        let context = self.context(request_id, permit_count, response.count + i64::from(permit_count));
        Lease::acquired_with_release(context, self.clone())
    }

    fn rejected(&self, request_id: &str, permit_count: u32, response: &ConcurrencyResponse) -> Lease {
        Lease::failed(self.context(request_id, permit_count, response.count))
    }

    async fn acquire(
        self: &Arc<Self>,
        permit_count: u32,
        cancel: CancellationToken,
    ) -> Result<Lease> {
        ensure_active(&self.disposed)?;
        check_permit_count(permit_count, self.permit_limit)?;
        let _in_flight = self.idle.begin();

        let request_id = new_request_id();
        let mode = if self.queue_limit > 0 {
            AcquireMode::Enqueue
        } else {
            AcquireMode::Direct
        };

        let response = self
            .manager
            .try_acquire(&request_id, permit_count, mode)
            .await?;

        if response.allowed {
            return Ok(self.granted(&request_id, permit_count, &response));
        }

        if !response.queued {
            debug!(
                partition = %self.partition,
                request_id = %request_id,
                permit_count = permit_count,
                count = response.count,
                queue_count = response.queue_count,
                "Concurrency limit reached"
            );
            return Ok(self.rejected(&request_id, permit_count, &response));
        }

        let (completion, waiter) = oneshot::channel();
        let request = QueuedRequest {
            request_id: request_id.clone(),
            permit_count,
            completion,
        };

        if self.queue.push(request).is_err() {
            // Disposed between the decision and the enqueue
            self.manager.remove_queued(&request_id, permit_count).await?;
            return Ok(self.rejected(&request_id, permit_count, &response));
        }

        debug!(
            partition = %self.partition,
            request_id = %request_id,
            permit_count = permit_count,
            queue_count = response.queue_count,
            "Request queued"
        );

        tokio::select! {
            biased;
            lease = waiter => match lease {
                Ok(lease) => Ok(lease),
                Err(_) => Ok(self.rejected(&request_id, permit_count, &response)),
            },
            _ = cancel.cancelled() => {
                debug!(partition = %self.partition, request_id = %request_id, "Queued request canceled");
                Err(LimiterError::Canceled { request_id })
            }
        }
    }

    async fn attempt_acquire(self: &Arc<Self>, permit_count: u32) -> Result<Lease> {
        ensure_active(&self.disposed)?;
        check_permit_count(permit_count, self.permit_limit)?;
        let _in_flight = self.idle.begin();

        if self.queue_limit > 0 {
            trace!(partition = %self.partition, "Attempted acquire on a queueing limiter");
            return Ok(Lease::failed(LeaseContext {
                permit_count,
                limit: self.permit_limit,
                ..Default::default()
            }));
        }

        let request_id = new_request_id();
        let response = self
            .manager
            .try_acquire(&request_id, permit_count, AcquireMode::Direct)
            .await?;

        if response.allowed {
            Ok(self.granted(&request_id, permit_count, &response))
        } else {
            debug!(
                partition = %self.partition,
                permit_count = permit_count,
                count = response.count,
                "Concurrency limit reached"
            );
            Ok(self.rejected(&request_id, permit_count, &response))
        }
    }

    async fn try_dequeue(self: &Arc<Self>) -> Result<usize> {
        let _pass = self.dequeue_lock.lock().await;
        self.dequeue_pass().await
    }

    /// Grant queued requests in arrival order until one does not fit.
    ///
    /// Must only run while holding `dequeue_lock`.
    async fn dequeue_pass(self: &Arc<Self>) -> Result<usize> {
        let mut granted = 0;

        while let Some(head) = self.queue.head() {
            if head.abandoned {
                self.manager
                    .remove_queued(&head.request_id, head.permit_count)
                    .await?;
                self.queue.remove(&head.request_id);
                trace!(request_id = %head.request_id, "Removed abandoned queued request");
                continue;
            }

            let response = self
                .manager
                .try_acquire(&head.request_id, head.permit_count, AcquireMode::Retry)
                .await?;
            if !response.allowed {
                break;
            }

            let lease = self.granted(&head.request_id, head.permit_count, &response);
            let delivered = match self.queue.remove(&head.request_id) {
                Some(request) => request.completion.send(lease),
                None => Err(lease),
            };

            match delivered {
                Ok(()) => {
                    granted += 1;
                    trace!(request_id = %head.request_id, "Granted queued request");
                }
                Err(mut lease) => {
                    // The caller left while the grant was in flight
                    lease.release().await?;
                }
            }
        }

        Ok(granted)
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        let waiting = self.queue.close();
        let mut abandoned = Vec::with_capacity(waiting.len());
        for request in waiting {
            let context = LeaseContext {
                request_id: Some(request.request_id.clone()),
                permit_count: request.permit_count,
                limit: self.permit_limit,
                ..Default::default()
            };
            abandoned.push((request.request_id, request.permit_count));
            let _ = request.completion.send(Lease::failed(context));
        }

        debug!(
            partition = %self.partition,
            queued = abandoned.len(),
            "Disposed concurrency rate limiter"
        );

        if abandoned.is_empty() {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let manager = self.manager.clone();
            runtime.spawn(async move {
                for (request_id, permit_count) in abandoned {
                    if let Err(e) = manager.remove_queued(&request_id, permit_count).await {
                        warn!(request_id = %request_id, error = %e, "Failed to remove queued request");
                    }
                }
            });
        }
    }
}

#[async_trait]
impl LeaseRelease for Inner {
    async fn release(&self, context: &LeaseContext) -> Result<()> {
        self.manager.release(context).await?;

        if self.queue.is_empty() {
            return Ok(());
        }
        // A pass already running picks the slot up on its next attempt
        if let Ok(_pass) = self.dequeue_lock.try_lock() {
            if let Some(inner) = self.this.upgrade() {
                inner.dequeue_pass().await?;
            }
        }
        Ok(())
    }
}

/// Bounds the number of permits held at once per partition.
///
/// With a queue limit, requests that find the partition full wait in a
/// per-limiter FIFO. A background task retries the head of the queue every
/// `try_dequeue_period`, and every release triggers an immediate pass.
pub struct ConcurrencyRateLimiter {
    inner: Arc<Inner>,
}

impl ConcurrencyRateLimiter {
    /// Create a limiter for `partition`.
    ///
    /// A queueing limiter spawns its dequeue task and therefore has to be
    /// created within a tokio runtime.
    pub fn new(partition: impl Into<PartitionKey>, options: ConcurrencyOptions) -> Result<Self> {
        let store_factory = options.validate()?;
        let partition = partition.into();

        let manager = ConcurrencyManager::new(
            &partition,
            store_factory(),
            options.permit_limit,
            options.queue_limit,
        );

        let inner = Arc::new_cyclic(|this| Inner {
            this: this.clone(),
            partition,
            permit_limit: options.permit_limit,
            queue_limit: options.queue_limit,
            manager: Arc::new(manager),
            queue: RequestQueue::new(),
            dequeue_lock: tokio::sync::Mutex::new(()),
            idle: IdleTracker::new(),
            disposed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        if options.queue_limit > 0 {
            let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
                LimiterError::Config(
                    "a queueing concurrency limiter must be created within a tokio runtime"
                        .to_string(),
                )
            })?;
            spawn_dequeue_worker(&runtime, inner.clone(), options.try_dequeue_period);
        }

        debug!(
            partition = %inner.partition,
            permit_limit = options.permit_limit,
            queue_limit = options.queue_limit,
            "Created concurrency rate limiter"
        );

        Ok(Self { inner })
    }

    /// Run one dequeue pass now, returning how many waiters were granted.
    pub async fn try_dequeue(&self) -> Result<usize> {
        self.inner.try_dequeue().await
    }

    /// Requests currently waiting in this process.
    pub fn queued_requests(&self) -> usize {
        self.inner.queue.len()
    }
}

fn spawn_dequeue_worker(runtime: &tokio::runtime::Handle, inner: Arc<Inner>, period: Duration) {
    let shutdown = inner.shutdown.clone();
    runtime.spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    trace!(partition = %inner.partition, "Dequeue worker stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if inner.queue.is_empty() {
                        continue;
                    }
                    if let Err(e) = inner.try_dequeue().await {
                        warn!(partition = %inner.partition, error = %e, "Dequeue pass failed");
                    }
                }
            }
        }
    });
}

#[async_trait]
impl RateLimiter for ConcurrencyRateLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Concurrency
    }

    fn partition(&self) -> &PartitionKey {
        &self.inner.partition
    }

    async fn attempt_acquire(&self, permit_count: u32) -> Result<Lease> {
        self.inner.attempt_acquire(permit_count).await
    }

    async fn acquire_with_cancellation(
        &self,
        permit_count: u32,
        cancel: CancellationToken,
    ) -> Result<Lease> {
        self.inner.acquire(permit_count, cancel).await
    }

    async fn statistics(&self) -> Result<Option<RateLimiterStatistics>> {
        ensure_active(&self.inner.disposed)?;
        Ok(Some(self.inner.manager.statistics().await?))
    }

    fn idle_duration(&self) -> Duration {
        // Queued requests stay in flight until granted or abandoned
        self.inner.idle.idle_duration()
    }

    fn dispose(&self) {
        self.inner.dispose();
    }
}

impl Drop for ConcurrencyRateLimiter {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

impl fmt::Debug for ConcurrencyRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyRateLimiter")
            .field("partition", &self.inner.partition)
            .field("permit_limit", &self.inner.permit_limit)
            .field("queue_limit", &self.inner.queue_limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::store::{shared_factory, MemoryStore, Script, ScriptArg, ScriptStore};
    use tokio_test::{assert_pending, assert_ready_err, assert_ready_ok, task};

    /// Store failing the next `failures` script evaluations.
    struct FlakyStore {
        inner: Arc<MemoryStore>,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl ScriptStore for FlakyStore {
        async fn eval(&self, script: &Script, keys: &[String], args: &[ScriptArg]) -> Result<Vec<i64>> {
            let fail = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(LimiterError::Backend("connection reset".to_string()));
            }
            self.inner.eval(script, keys, args).await
        }

        async fn remove_members(&self, key: &str, members: &[String]) -> Result<u64> {
            self.inner.remove_members(key, members).await
        }
    }

    fn limiter(
        store: &Arc<MemoryStore>,
        partition: &str,
        permit_limit: u32,
        queue_limit: u32,
    ) -> ConcurrencyRateLimiter {
        let options = ConcurrencyOptions::new(permit_limit)
            .with_queue_limit(queue_limit)
            .with_store(store.factory());
        ConcurrencyRateLimiter::new(partition, options).unwrap()
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_burst_admits_exactly_limit() {
        init_tracing();
        let store = Arc::new(MemoryStore::new());
        let limiter = Arc::new(limiter(&store, "burst", 5, 0));

        let attempts = (0..20).map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire(1).await })
        });
        let leases: Vec<Lease> = futures::future::join_all(attempts)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(leases.iter().filter(|lease| lease.is_acquired()).count(), 5);
        assert_eq!(store.member_count("rl:{burst}").unwrap(), 5);
    }

    #[tokio::test]
    async fn test_grants_up_to_permit_limit() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(&store, "grants", 3, 0);

        let first = limiter.acquire(1).await.unwrap();
        assert!(first.is_acquired());
        assert_eq!(first.context().remaining, Some(2));

        let _second = limiter.acquire(1).await.unwrap();
        let _third = limiter.attempt_acquire(1).await.unwrap();

        let fourth = limiter.acquire(1).await.unwrap();
        assert!(!fourth.is_acquired());
        assert_eq!(fourth.context().remaining, Some(0));
        assert!(!limiter.attempt_acquire(1).await.unwrap().is_acquired());
    }

    #[tokio::test]
    async fn test_release_frees_slot() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(&store, "reuse", 1, 0);

        let mut held = limiter.acquire(1).await.unwrap();
        assert!(!limiter.acquire(1).await.unwrap().is_acquired());

        held.release().await.unwrap();
        assert!(limiter.acquire(1).await.unwrap().is_acquired());
    }

    #[tokio::test]
    async fn test_dropped_lease_frees_slot() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(&store, "drop", 1, 0);

        let held = limiter.acquire(1).await.unwrap();
        drop(held);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(store.member_count("rl:{drop}").unwrap(), 0);
        assert!(limiter.acquire(1).await.unwrap().is_acquired());
    }

    #[tokio::test]
    async fn test_multi_permit_reservation() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(&store, "multi", 5, 0);

        let mut lease = limiter.acquire(3).await.unwrap();
        assert!(lease.is_acquired());
        assert_eq!(store.member_count("rl:{multi}").unwrap(), 3);
        assert!(!limiter.acquire(3).await.unwrap().is_acquired());

        lease.release().await.unwrap();
        assert_eq!(store.member_count("rl:{multi}").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_queue_limit_and_fifo_grants() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(&store, "fifo", 2, 2);

        let mut held_a = limiter.acquire(1).await.unwrap();
        let mut held_b = limiter.acquire(1).await.unwrap();

        let mut first = task::spawn(limiter.acquire(1));
        assert_pending!(first.poll());
        let mut second = task::spawn(limiter.acquire(1));
        assert_pending!(second.poll());

        let overflow = limiter.acquire(1).await.unwrap();
        assert!(!overflow.is_acquired());
        assert_eq!(limiter.queued_requests(), 2);

        held_a.release().await.unwrap();
        assert!(first.is_woken());
        let granted_first = assert_ready_ok!(first.poll());
        assert!(granted_first.is_acquired());
        assert_pending!(second.poll());

        held_b.release().await.unwrap();
        let granted_second = assert_ready_ok!(second.poll());
        assert!(granted_second.is_acquired());
        assert_eq!(limiter.queued_requests(), 0);
    }

    #[tokio::test]
    async fn test_new_arrival_does_not_overtake_queue() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(&store, "overtake", 1, 2);

        let held = limiter.acquire(1).await.unwrap();
        let mut waiter = task::spawn(limiter.acquire(1));
        assert_pending!(waiter.poll());

        // Free the slot behind the limiter's back so no dequeue pass runs
        store
            .remove_members("rl:{overtake}", &[format!("{}:1", held.context().request_id.clone().unwrap())])
            .await
            .unwrap();

        let mut newcomer = task::spawn(limiter.acquire(1));
        assert_pending!(newcomer.poll());

        assert_eq!(limiter.try_dequeue().await.unwrap(), 1);
        assert!(assert_ready_ok!(waiter.poll()).is_acquired());
        assert_pending!(newcomer.poll());
    }

    #[tokio::test]
    async fn test_cancel_queued_request() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(&store, "cancel", 1, 1);

        let _held = limiter.acquire(1).await.unwrap();

        let cancel = CancellationToken::new();
        let mut waiter = task::spawn(limiter.acquire_with_cancellation(1, cancel.clone()));
        assert_pending!(waiter.poll());

        // The queue is full
        assert!(!limiter.acquire(1).await.unwrap().is_acquired());

        cancel.cancel();
        assert!(waiter.is_woken());
        let err = assert_ready_err!(waiter.poll());
        assert!(matches!(err, LimiterError::Canceled { .. }));
        drop(waiter);

        // Cleanup of the remote queue entry is deferred to the dequeuer
        assert_eq!(store.member_count("rl:{cancel}:q").unwrap(), 1);
        assert_eq!(limiter.try_dequeue().await.unwrap(), 0);
        assert_eq!(store.member_count("rl:{cancel}:q").unwrap(), 0);
        assert_eq!(limiter.queued_requests(), 0);

        let mut next = task::spawn(limiter.acquire(1));
        assert_pending!(next.poll());
    }

    #[tokio::test]
    async fn test_dispose_fails_queued_requests() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(&store, "dispose", 1, 1);

        let _held = limiter.acquire(1).await.unwrap();
        let mut waiter = task::spawn(limiter.acquire(1));
        assert_pending!(waiter.poll());

        limiter.dispose();
        let lease = assert_ready_ok!(waiter.poll());
        assert!(!lease.is_acquired());

        limiter.dispose();
        assert!(matches!(limiter.acquire(1).await, Err(LimiterError::Disposed)));
        assert!(matches!(limiter.statistics().await, Err(LimiterError::Disposed)));
    }

    #[tokio::test]
    async fn test_worker_grants_after_release_elsewhere() {
        let store = Arc::new(MemoryStore::new());
        let options = ConcurrencyOptions::new(1)
            .with_queue_limit(1)
            .with_try_dequeue_period(Duration::from_millis(50))
            .with_store(store.factory());
        let holder = ConcurrencyRateLimiter::new("shared", options.clone()).unwrap();
        let waiter_limiter = ConcurrencyRateLimiter::new("shared", options).unwrap();

        let mut held = holder.acquire(1).await.unwrap();
        let mut waiter = task::spawn(waiter_limiter.acquire(1));
        assert_pending!(waiter.poll());

        held.release().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let lease = assert_ready_ok!(waiter.poll());
        assert!(lease.is_acquired());
    }

    #[tokio::test]
    async fn test_worker_survives_store_failures() {
        init_tracing();
        let store = Arc::new(MemoryStore::new());
        let flaky = Arc::new(FlakyStore {
            inner: store.clone(),
            failures: AtomicUsize::new(0),
        });

        let holder = ConcurrencyRateLimiter::new(
            "flaky",
            ConcurrencyOptions::new(1).with_store(store.factory()),
        )
        .unwrap();
        let waiter_limiter = ConcurrencyRateLimiter::new(
            "flaky",
            ConcurrencyOptions::new(1)
                .with_queue_limit(1)
                .with_try_dequeue_period(Duration::from_millis(50))
                .with_store(shared_factory(flaky.clone())),
        )
        .unwrap();

        let mut held = holder.acquire(1).await.unwrap();
        let mut waiter = task::spawn(waiter_limiter.acquire(1));
        assert_pending!(waiter.poll());

        flaky.failures.store(3, Ordering::SeqCst);
        held.release().await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(flaky.failures.load(Ordering::SeqCst), 0);
        let lease = assert_ready_ok!(waiter.poll());
        assert!(lease.is_acquired());
    }

    #[tokio::test]
    async fn test_worker_removes_abandoned_requests() {
        let store = Arc::new(MemoryStore::new());
        let options = ConcurrencyOptions::new(1)
            .with_queue_limit(1)
            .with_try_dequeue_period(Duration::from_millis(50))
            .with_store(store.factory());
        let limiter = ConcurrencyRateLimiter::new("abandon", options).unwrap();

        let _held = limiter.acquire(1).await.unwrap();
        let mut waiter = task::spawn(limiter.acquire(1));
        assert_pending!(waiter.poll());
        drop(waiter);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(limiter.queued_requests(), 0);
        assert_eq!(store.member_count("rl:{abandon}:q").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_attempt_acquire_on_queueing_limiter() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(&store, "attempt", 1, 1);

        let lease = limiter.attempt_acquire(1).await.unwrap();
        assert!(!lease.is_acquired());
        assert!(!store.contains_key("rl:{attempt}"));
    }

    #[tokio::test]
    async fn test_statistics() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(&store, "stats", 2, 0);

        let _a = limiter.acquire(1).await.unwrap();
        let _b = limiter.acquire(1).await.unwrap();
        let _c = limiter.acquire(1).await.unwrap();

        let stats = limiter.statistics().await.unwrap().unwrap();
        assert_eq!(stats.current_available_permits, 0);
        assert_eq!(stats.current_queued_count, 0);
        assert_eq!(stats.total_successful_leases, 2);
        assert_eq!(stats.total_failed_leases, 1);
    }

    #[tokio::test]
    async fn test_idle_duration_resets_after_acquire() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(&store, "idle", 1, 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let idle = limiter.idle_duration();
        assert!(idle >= Duration::from_millis(20));
        assert!(limiter.idle_duration() >= idle);

        let _lease = limiter.acquire(1).await.unwrap();
        assert!(limiter.idle_duration() < idle);
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let store = Arc::new(MemoryStore::new());

        let err = ConcurrencyRateLimiter::new("bad", ConcurrencyOptions::new(0).with_store(store.factory()))
            .unwrap_err();
        assert!(matches!(err, LimiterError::Config(_)));
        let err = ConcurrencyRateLimiter::new("bad", ConcurrencyOptions::new(1)).unwrap_err();
        assert!(matches!(err, LimiterError::Config(_)));

        let limiter = limiter(&store, "args", 1, 0);
        assert!(matches!(
            limiter.acquire(2).await,
            Err(LimiterError::PermitLimitExceeded { permit_count: 2, limit: 1 })
        ));
        assert!(matches!(limiter.acquire(0).await, Err(LimiterError::InvalidArgument(_))));
    }

    #[test]
    fn test_queueing_limiter_requires_runtime() {
        let store = Arc::new(MemoryStore::new());
        let options = ConcurrencyOptions::new(1)
            .with_queue_limit(1)
            .with_store(store.factory());
        assert!(matches!(
            ConcurrencyRateLimiter::new("no-runtime", options),
            Err(LimiterError::Config(_))
        ));
    }
}
