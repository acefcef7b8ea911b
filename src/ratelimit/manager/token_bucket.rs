use std::sync::Arc;

use tracing::trace;

use super::expect_reply;
use crate::error::Result;
use crate::ratelimit::keys::PartitionKey;
use crate::store::{unix_millis, Script, ScriptArg, ScriptStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TokenBucketResponse {
    pub allowed: bool,
    /// Tokens left after the decision
    pub tokens: i64,
    /// Zero when allowed
    pub retry_after_ms: i64,
}

pub(crate) struct TokenBucketManager {
    store: Arc<dyn ScriptStore>,
    keys: Vec<String>,
    token_limit: u32,
    tokens_per_period: u32,
    period_ms: i64,
}

impl TokenBucketManager {
    pub(crate) fn new(
        partition: &PartitionKey,
        store: Arc<dyn ScriptStore>,
        token_limit: u32,
        tokens_per_period: u32,
        period_ms: i64,
    ) -> Self {
        Self {
            store,
            keys: partition.token_bucket_keys(),
            token_limit,
            tokens_per_period,
            period_ms,
        }
    }

    pub(crate) async fn try_acquire(&self, permit_count: u32) -> Result<TokenBucketResponse> {
        let now = unix_millis();
        let args = [
            ScriptArg::from(self.token_limit),
            ScriptArg::from(self.tokens_per_period),
            ScriptArg::from(self.period_ms),
            ScriptArg::from(now),
            ScriptArg::from(permit_count),
        ];

        let reply = self.store.eval(&Script::TokenBucket, &self.keys, &args).await?;
        let reply = expect_reply(Script::TokenBucket, reply)?;

        let response = TokenBucketResponse {
            allowed: reply[0] == 1,
            tokens: reply[1],
            retry_after_ms: reply[2],
        };
        trace!(key = %self.keys[0], response = ?response, "Token bucket decision");
        Ok(response)
    }
}
