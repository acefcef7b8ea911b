//! The rate limiter interface shared by every algorithm.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::keys::PartitionKey;
use super::lease::Lease;
use crate::error::{LimiterError, Result};

/// Rate limiting algorithm of a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    Concurrency,
    FixedWindow,
    SlidingWindow,
    TokenBucket,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Algorithm::Concurrency => "concurrency",
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::TokenBucket => "token_bucket",
        };
        f.write_str(name)
    }
}

/// Point-in-time counters of a partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimiterStatistics {
    pub current_available_permits: i64,
    pub current_queued_count: i64,
    pub total_successful_leases: i64,
    pub total_failed_leases: i64,
}

/// Admission control for one partition.
///
/// All implementations make their decision in one atomic store script, so
/// any number of processes may share a partition.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Algorithm implemented by this limiter.
    fn algorithm(&self) -> Algorithm;

    /// Partition this limiter admits requests for.
    fn partition(&self) -> &PartitionKey;

    /// Make one admission decision without ever waiting in a queue.
    async fn attempt_acquire(&self, permit_count: u32) -> Result<Lease>;

    /// Acquire permits, waiting in the queue where the limiter has one.
    async fn acquire(&self, permit_count: u32) -> Result<Lease> {
        self.acquire_with_cancellation(permit_count, CancellationToken::new())
            .await
    }

    /// Like [`RateLimiter::acquire`], giving up with
    /// [`LimiterError::Canceled`] once `cancel` fires while queued.
    async fn acquire_with_cancellation(
        &self,
        permit_count: u32,
        cancel: CancellationToken,
    ) -> Result<Lease>;

    /// Current partition counters, if the algorithm keeps any.
    async fn statistics(&self) -> Result<Option<RateLimiterStatistics>>;

    /// Zero while an acquisition is in flight, otherwise the time since the
    /// last one finished.
    fn idle_duration(&self) -> Duration;

    /// Stop the limiter. Idempotent.
    fn dispose(&self);
}

/// Tracks in-flight acquisitions to report idle time.
#[derive(Debug)]
pub(crate) struct IdleTracker {
    in_flight: AtomicUsize,
    idle_since: Mutex<Instant>,
}

impl IdleTracker {
    pub(crate) fn new() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            idle_since: Mutex::new(Instant::now()),
        }
    }

    /// Mark an acquisition as started until the guard is dropped.
    pub(crate) fn begin(&self) -> InFlight<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlight { tracker: self }
    }

    pub(crate) fn idle_duration(&self) -> Duration {
        let idle_since = self.idle_since.lock();
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            Duration::ZERO
        } else {
            idle_since.elapsed()
        }
    }
}

pub(crate) struct InFlight<'a> {
    tracker: &'a IdleTracker,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut idle_since = self.tracker.idle_since.lock();
        if self.tracker.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            *idle_since = Instant::now();
        }
    }
}

/// Reject calls on a disposed limiter.
pub(crate) fn ensure_active(disposed: &AtomicBool) -> Result<()> {
    if disposed.load(Ordering::SeqCst) {
        return Err(LimiterError::Disposed);
    }
    Ok(())
}

/// Reject permit counts no decision could ever grant.
pub(crate) fn check_permit_count(permit_count: u32, limit: u32) -> Result<()> {
    if permit_count == 0 {
        return Err(LimiterError::InvalidArgument(
            "permit count must be at least 1".to_string(),
        ));
    }
    if permit_count > limit {
        return Err(LimiterError::PermitLimitExceeded {
            permit_count,
            limit,
        });
    }
    Ok(())
}

/// Milliseconds as a non-negative duration.
pub(crate) fn millis(ms: i64) -> Duration {
    Duration::from_millis(u64::try_from(ms).unwrap_or(0))
}

/// Unix milliseconds as a UTC timestamp.
pub(crate) fn timestamp(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}

/// Duration as whole milliseconds, saturating.
pub(crate) fn as_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_permit_count() {
        assert!(check_permit_count(1, 1).is_ok());
        assert!(matches!(
            check_permit_count(0, 5),
            Err(LimiterError::InvalidArgument(_))
        ));
        assert!(matches!(
            check_permit_count(6, 5),
            Err(LimiterError::PermitLimitExceeded { permit_count: 6, limit: 5 })
        ));
    }

    #[test]
    fn test_idle_tracker() {
        let tracker = IdleTracker::new();
        std::thread::sleep(Duration::from_millis(5));
        let before = tracker.idle_duration();
        assert!(before >= Duration::from_millis(5));

        let outer = tracker.begin();
        let inner = tracker.begin();
        assert_eq!(tracker.idle_duration(), Duration::ZERO);
        drop(inner);
        assert_eq!(tracker.idle_duration(), Duration::ZERO);
        drop(outer);

        assert!(tracker.idle_duration() < before);
    }

    #[test]
    fn test_millis_clamps_negative() {
        assert_eq!(millis(-5), Duration::ZERO);
        assert_eq!(millis(1500), Duration::from_millis(1500));
        assert_eq!(as_millis(Duration::from_secs(2)), 2000);
    }
}
