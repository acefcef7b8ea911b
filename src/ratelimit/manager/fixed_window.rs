use std::sync::Arc;

use tracing::trace;

use super::expect_reply;
use crate::error::Result;
use crate::ratelimit::keys::PartitionKey;
use crate::store::{unix_millis, Script, ScriptArg, ScriptStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FixedWindowResponse {
    pub allowed: bool,
    /// Counter after the decision
    pub count: i64,
    /// End of the current window, Unix milliseconds
    pub expires_at: i64,
    /// Decision time, Unix milliseconds
    pub now: i64,
}

pub(crate) struct FixedWindowManager {
    store: Arc<dyn ScriptStore>,
    keys: Vec<String>,
    permit_limit: u32,
    window_ms: i64,
}

impl FixedWindowManager {
    pub(crate) fn new(
        partition: &PartitionKey,
        store: Arc<dyn ScriptStore>,
        permit_limit: u32,
        window_ms: i64,
    ) -> Self {
        Self {
            store,
            keys: partition.fixed_window_keys(),
            permit_limit,
            window_ms,
        }
    }

    pub(crate) async fn try_acquire(&self, permit_count: u32) -> Result<FixedWindowResponse> {
        let now = unix_millis();
        let args = [
            ScriptArg::from(self.permit_limit),
            ScriptArg::from(now),
            ScriptArg::from(self.window_ms),
            ScriptArg::from(permit_count),
        ];

        let reply = self.store.eval(&Script::FixedWindow, &self.keys, &args).await?;
        let reply = expect_reply(Script::FixedWindow, reply)?;

        let response = FixedWindowResponse {
            count: reply[0],
            expires_at: reply[1],
            allowed: reply[2] == 1,
            now,
        };
        trace!(key = %self.keys[0], response = ?response, "Fixed window decision");
        Ok(response)
    }
}
