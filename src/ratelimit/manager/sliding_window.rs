use std::sync::Arc;

use tracing::trace;

use super::{expect_reply, STATS_TTL_MS};
use crate::error::Result;
use crate::ratelimit::keys::PartitionKey;
use crate::ratelimit::limiter::RateLimiterStatistics;
use crate::store::{unix_millis, Script, ScriptArg, ScriptStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlidingWindowResponse {
    pub allowed: bool,
    /// Requests in the window before this decision
    pub count: i64,
    /// When the oldest logged request leaves the window, Unix milliseconds
    pub reset_at: i64,
    pub now: i64,
}

pub(crate) struct SlidingWindowManager {
    store: Arc<dyn ScriptStore>,
    keys: Vec<String>,
    permit_limit: u32,
    window_ms: i64,
}

impl SlidingWindowManager {
    pub(crate) fn new(
        partition: &PartitionKey,
        store: Arc<dyn ScriptStore>,
        permit_limit: u32,
        window_ms: i64,
    ) -> Self {
        Self {
            store,
            keys: partition.sliding_window_keys(),
            permit_limit,
            window_ms,
        }
    }

    pub(crate) async fn try_acquire(
        &self,
        request_id: &str,
        permit_count: u32,
    ) -> Result<SlidingWindowResponse> {
        let now = unix_millis();
        let args = [
            ScriptArg::from(self.permit_limit),
            ScriptArg::from(now),
            ScriptArg::from(self.window_ms),
            ScriptArg::from(permit_count),
            ScriptArg::from(request_id),
            ScriptArg::from(STATS_TTL_MS),
        ];

        let reply = self.store.eval(&Script::SlidingWindow, &self.keys, &args).await?;
        let reply = expect_reply(Script::SlidingWindow, reply)?;

        let response = SlidingWindowResponse {
            allowed: reply[0] == 1,
            count: reply[1],
            reset_at: reply[2],
            now,
        };
        trace!(key = %self.keys[0], request_id = %request_id, response = ?response, "Sliding window decision");
        Ok(response)
    }

    pub(crate) async fn statistics(&self) -> Result<RateLimiterStatistics> {
        let args = [ScriptArg::from(unix_millis()), ScriptArg::from(self.window_ms)];
        let reply = self
            .store
            .eval(&Script::SlidingWindowStatistics, &self.keys, &args)
            .await?;
        let reply = expect_reply(Script::SlidingWindowStatistics, reply)?;

        Ok(RateLimiterStatistics {
            current_available_permits: (i64::from(self.permit_limit) - reply[0]).max(0),
            current_queued_count: 0,
            total_successful_leases: reply[1],
            total_failed_leases: reply[2],
        })
    }
}
