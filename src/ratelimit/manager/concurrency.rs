use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use super::{expect_reply, RESERVATION_TTL_MS, STATS_TTL_MS};
use crate::error::Result;
use crate::ratelimit::keys::{reservation_members, PartitionKey};
use crate::ratelimit::lease::{LeaseContext, LeaseRelease};
use crate::ratelimit::limiter::RateLimiterStatistics;
use crate::store::{unix_millis, Script, ScriptArg, ScriptStore};

/// How an acquisition attempt treats the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcquireMode {
    /// Fresh arrival: may be queued and never overtakes waiters.
    Enqueue,
    /// Fresh arrival going straight for a slot.
    Direct,
    /// Queued request retried by the dequeuer.
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConcurrencyResponse {
    pub allowed: bool,
    /// Active reservations before this attempt
    pub count: i64,
    pub queued: bool,
    pub queue_count: i64,
}

pub(crate) struct ConcurrencyManager {
    store: Arc<dyn ScriptStore>,
    active_key: String,
    queue_key: String,
    keys: Vec<String>,
    permit_limit: u32,
    queue_limit: u32,
}

impl ConcurrencyManager {
    pub(crate) fn new(
        partition: &PartitionKey,
        store: Arc<dyn ScriptStore>,
        permit_limit: u32,
        queue_limit: u32,
    ) -> Self {
        let keys = partition.concurrency_keys();
        Self {
            store,
            active_key: keys[0].clone(),
            queue_key: keys[1].clone(),
            keys,
            permit_limit,
            queue_limit,
        }
    }

    pub(crate) async fn try_acquire(
        &self,
        request_id: &str,
        permit_count: u32,
        mode: AcquireMode,
    ) -> Result<ConcurrencyResponse> {
        let args = [
            ScriptArg::from(self.permit_limit),
            ScriptArg::from(self.queue_limit),
            ScriptArg::from(mode == AcquireMode::Enqueue),
            ScriptArg::from(unix_millis()),
            ScriptArg::from(permit_count),
            ScriptArg::from(request_id),
            ScriptArg::from(RESERVATION_TTL_MS),
            ScriptArg::from(mode == AcquireMode::Retry),
            ScriptArg::from(STATS_TTL_MS),
        ];

        let reply = self
            .store
            .eval(&Script::ConcurrencyAcquire, &self.keys, &args)
            .await?;
        let reply = expect_reply(Script::ConcurrencyAcquire, reply)?;

        let response = ConcurrencyResponse {
            allowed: reply[0] == 1,
            count: reply[1],
            queued: reply[2] == 1,
            queue_count: reply[3],
        };
        trace!(
            key = %self.active_key,
            request_id = %request_id,
            mode = ?mode,
            response = ?response,
            "Concurrency decision"
        );
        Ok(response)
    }

    /// Remove a granted reservation from the active set.
    pub(crate) async fn release_reservation(&self, request_id: &str, permit_count: u32) -> Result<()> {
        let members = reservation_members(request_id, permit_count);
        self.store.remove_members(&self.active_key, &members).await?;
        Ok(())
    }

    /// Remove an abandoned reservation from the queue set.
    pub(crate) async fn remove_queued(&self, request_id: &str, permit_count: u32) -> Result<()> {
        let members = reservation_members(request_id, permit_count);
        self.store.remove_members(&self.queue_key, &members).await?;
        Ok(())
    }

    pub(crate) async fn statistics(&self) -> Result<RateLimiterStatistics> {
        let args = [ScriptArg::from(unix_millis()), ScriptArg::from(RESERVATION_TTL_MS)];
        let reply = self
            .store
            .eval(&Script::ConcurrencyStatistics, &self.keys, &args)
            .await?;
        let reply = expect_reply(Script::ConcurrencyStatistics, reply)?;

        Ok(RateLimiterStatistics {
            current_available_permits: (i64::from(self.permit_limit) - reply[0]).max(0),
            current_queued_count: reply[1],
            total_successful_leases: reply[2],
            total_failed_leases: reply[3],
        })
    }
}

#[async_trait]
impl LeaseRelease for ConcurrencyManager {
    async fn release(&self, context: &LeaseContext) -> Result<()> {
        match &context.request_id {
            Some(request_id) => {
                self.release_reservation(request_id, context.permit_count)
                    .await
            }
            None => Ok(()),
        }
    }
}
