//! Leases returned by admission attempts.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{trace, warn};

use crate::error::Result;

/// Metadata name of the configured permit limit.
pub const RATELIMIT_LIMIT: &str = "RATELIMIT_LIMIT";
/// Metadata name of the permits left after the decision.
pub const RATELIMIT_REMAINING: &str = "RATELIMIT_REMAINING";
/// Metadata name of the time to wait before retrying.
pub const RATELIMIT_RETRYAFTER: &str = "RATELIMIT_RETRYAFTER";
/// Metadata name of the moment the limit resets.
pub const RATELIMIT_RESET: &str = "RATELIMIT_RESET";

/// Value of a single metadata entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    Count(u64),
    Duration(Duration),
    Timestamp(DateTime<Utc>),
    Text(String),
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Count(count) => write!(f, "{}", count),
            // Whole seconds, rounded up, as used by Retry-After style headers
            MetadataValue::Duration(duration) => {
                let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
                write!(f, "{}", secs)
            }
            MetadataValue::Timestamp(at) => write!(f, "{}", at.timestamp()),
            MetadataValue::Text(text) => f.write_str(text),
        }
    }
}

/// Everything known about one admission decision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseContext {
    /// Reservation id, for algorithms that track individual reservations
    pub request_id: Option<String>,
    /// Permits requested
    pub permit_count: u32,
    /// Configured permit or token limit
    pub limit: u32,
    /// Permits left in the partition after this decision
    pub remaining: Option<u64>,
    /// Window length for windowed algorithms
    pub window: Option<Duration>,
    /// Suggested wait before the next attempt
    pub retry_after: Option<Duration>,
    /// When the current window or bucket resets
    pub reset_at: Option<DateTime<Utc>>,
    /// Caller supplied metadata
    pub custom: HashMap<String, String>,
}

/// Releases what an acquired lease holds.
#[async_trait]
pub(crate) trait LeaseRelease: Send + Sync {
    async fn release(&self, context: &LeaseContext) -> Result<()>;
}

struct ReleaseHandle {
    releaser: Arc<dyn LeaseRelease>,
    runtime: Option<tokio::runtime::Handle>,
}

/// Outcome of an admission attempt.
///
/// A denied admission is a lease with `is_acquired() == false`, never an
/// error. Leases of the concurrency limiter hold a reservation in the store
/// which is released exactly once: explicitly through [`Lease::release`] or
/// [`Lease::dispose`], or implicitly when the lease is dropped.
pub struct Lease {
    acquired: bool,
    context: LeaseContext,
    release: Option<ReleaseHandle>,
}

impl Lease {
    /// A granted lease with nothing to release.
    pub fn acquired(context: LeaseContext) -> Self {
        Self {
            acquired: true,
            context,
            release: None,
        }
    }

    /// A denied lease.
    pub fn failed(context: LeaseContext) -> Self {
        Self {
            acquired: false,
            context,
            release: None,
        }
    }

    /// A granted lease whose reservation is released through `releaser`.
    pub(crate) fn acquired_with_release(
        context: LeaseContext,
        releaser: Arc<dyn LeaseRelease>,
    ) -> Self {
        Self {
            acquired: true,
            context,
            release: Some(ReleaseHandle {
                releaser,
                runtime: tokio::runtime::Handle::try_current().ok(),
            }),
        }
    }

    /// Whether the permits were granted.
    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    /// Details of the decision.
    pub fn context(&self) -> &LeaseContext {
        &self.context
    }

    /// Look up a metadata entry by name.
    pub fn metadata(&self, name: &str) -> Option<MetadataValue> {
        let context = &self.context;
        match name {
            RATELIMIT_LIMIT => Some(MetadataValue::Count(u64::from(context.limit))),
            RATELIMIT_REMAINING => context.remaining.map(MetadataValue::Count),
            RATELIMIT_RETRYAFTER => context.retry_after.map(MetadataValue::Duration),
            RATELIMIT_RESET => context.reset_at.map(MetadataValue::Timestamp),
            other => context.custom.get(other).cloned().map(MetadataValue::Text),
        }
    }

    /// Names of every metadata entry this lease carries.
    pub fn metadata_names(&self) -> Vec<String> {
        let mut names = vec![RATELIMIT_LIMIT.to_string()];
        if self.context.remaining.is_some() {
            names.push(RATELIMIT_REMAINING.to_string());
        }
        if self.context.retry_after.is_some() {
            names.push(RATELIMIT_RETRYAFTER.to_string());
        }
        if self.context.reset_at.is_some() {
            names.push(RATELIMIT_RESET.to_string());
        }
        let mut custom: Vec<String> = self.context.custom.keys().cloned().collect();
        custom.sort();
        names.extend(custom);
        names
    }

    /// Schedule the release on the runtime the lease was created on.
    ///
    /// Returns immediately. Calling it again, or dropping the lease
    /// afterwards, has no further effect.
    pub fn dispose(&mut self) {
        let Some(handle) = self.release.take() else {
            return;
        };

        let context = self.context.clone();
        match handle.runtime {
            Some(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = handle.releaser.release(&context).await {
                        warn!(
                            request_id = ?context.request_id,
                            error = %e,
                            "Failed to release lease"
                        );
                    }
                });
            }
            None => {
                warn!(
                    request_id = ?context.request_id,
                    "No runtime available to release lease, reservation will expire"
                );
            }
        }
    }

    /// Release the lease and wait for the store to confirm.
    pub async fn release(&mut self) -> Result<()> {
        let Some(handle) = self.release.take() else {
            return Ok(());
        };

        trace!(request_id = ?self.context.request_id, "Releasing lease");
        handle.releaser.release(&self.context).await
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("acquired", &self.acquired)
            .field("context", &self.context)
            .field("pending_release", &self.release.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingRelease {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LeaseRelease for CountingRelease {
        async fn release(&self, _context: &LeaseContext) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn context() -> LeaseContext {
        LeaseContext {
            request_id: Some("req".to_string()),
            permit_count: 1,
            limit: 10,
            remaining: Some(9),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let releaser = Arc::new(CountingRelease::default());
        let mut lease = Lease::acquired_with_release(context(), releaser.clone());

        lease.release().await.unwrap();
        lease.release().await.unwrap();
        lease.dispose();
        drop(lease);
        tokio::task::yield_now().await;

        assert_eq!(releaser.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_releases_once() {
        let releaser = Arc::new(CountingRelease::default());
        let mut lease = Lease::acquired_with_release(context(), releaser.clone());
        lease.dispose();
        lease.dispose();
        drop(lease);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(releaser.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_metadata_lookup() {
        let mut ctx = context();
        ctx.retry_after = Some(Duration::from_millis(1500));
        ctx.custom.insert("tier".to_string(), "gold".to_string());
        let lease = Lease::failed(ctx);

        assert!(!lease.is_acquired());
        assert_eq!(lease.metadata(RATELIMIT_LIMIT), Some(MetadataValue::Count(10)));
        assert_eq!(lease.metadata(RATELIMIT_REMAINING), Some(MetadataValue::Count(9)));
        assert_eq!(lease.metadata(RATELIMIT_RESET), None);
        assert_eq!(lease.metadata("tier"), Some(MetadataValue::Text("gold".to_string())));
        assert_eq!(lease.metadata(RATELIMIT_RETRYAFTER).unwrap().to_string(), "2");
        assert_eq!(
            lease.metadata_names(),
            vec![RATELIMIT_LIMIT, RATELIMIT_REMAINING, RATELIMIT_RETRYAFTER, "tier"]
        );
    }
}
