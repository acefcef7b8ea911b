//! Partition state managers.
//!
//! A manager owns the store keys of one partition, marshals the arguments of
//! its algorithm's script and unpacks the positional reply into a typed
//! response. Managers make no decisions of their own.

mod concurrency;
mod fixed_window;
mod sliding_window;
mod token_bucket;

pub(crate) use concurrency::{AcquireMode, ConcurrencyManager, ConcurrencyResponse};
pub(crate) use fixed_window::FixedWindowManager;
pub(crate) use sliding_window::SlidingWindowManager;
pub(crate) use token_bucket::TokenBucketManager;

use crate::error::{LimiterError, Result};
use crate::store::Script;

/// Age after which a concurrency reservation counts as abandoned.
pub(crate) const RESERVATION_TTL_MS: i64 = 60_000;

/// Lifetime of a partition's statistics hash, refreshed on every decision.
pub(crate) const STATS_TTL_MS: i64 = 24 * 60 * 60 * 1000;

/// Check the reply has the shape `script` promises.
fn expect_reply(script: Script, reply: Vec<i64>) -> Result<Vec<i64>> {
    if reply.len() != script.reply_len() {
        return Err(LimiterError::UnexpectedReply {
            script: script.name(),
            detail: format!("expected {} values, got {:?}", script.reply_len(), reply),
        });
    }
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::ratelimit::keys::PartitionKey;
    use crate::store::{ScriptArg, ScriptStore};

    /// Store replying with a fixed array to every script.
    struct CannedStore(Vec<i64>);

    #[async_trait]
    impl ScriptStore for CannedStore {
        async fn eval(&self, _script: &Script, _keys: &[String], _args: &[ScriptArg]) -> Result<Vec<i64>> {
            Ok(self.0.clone())
        }

        async fn remove_members(&self, _key: &str, _members: &[String]) -> Result<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_short_reply_is_rejected() {
        let partition = PartitionKey::new("short");
        let manager = FixedWindowManager::new(&partition, Arc::new(CannedStore(vec![1, 2])), 5, 1000);

        let err = manager.try_acquire(1).await.unwrap_err();
        assert!(matches!(
            err,
            LimiterError::UnexpectedReply { script: "fixed_window", .. }
        ));
    }

    #[tokio::test]
    async fn test_reply_fields_are_unpacked_by_position() {
        let partition = PartitionKey::new("positions");
        let manager = ConcurrencyManager::new(&partition, Arc::new(CannedStore(vec![0, 3, 1, 2])), 3, 2);

        let response = manager
            .try_acquire("req", 1, AcquireMode::Enqueue)
            .await
            .unwrap();
        assert_eq!(
            response,
            ConcurrencyResponse {
                allowed: false,
                count: 3,
                queued: true,
                queue_count: 2,
            }
        );

        let manager = TokenBucketManager::new(&partition, Arc::new(CannedStore(vec![0, 1, 250])), 5, 1, 1000);
        let response = manager.try_acquire(2).await.unwrap();
        assert!(!response.allowed);
        assert_eq!(response.tokens, 1);
        assert_eq!(response.retry_after_ms, 250);

        let manager = SlidingWindowManager::new(&partition, Arc::new(CannedStore(vec![2, 10, 7])), 5, 1000);
        let stats = manager.statistics().await.unwrap();
        assert_eq!(stats.current_available_permits, 3);
        assert_eq!(stats.total_successful_leases, 10);
        assert_eq!(stats.total_failed_leases, 7);
    }
}
