//! Redis-backed store.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{RedisWrite, ToRedisArgs};
use tracing::{debug, trace, warn};

use super::{Script, ScriptArg, ScriptStore};
use crate::error::{LimiterError, Result};

impl ToRedisArgs for ScriptArg {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        match self {
            ScriptArg::Int(value) => value.write_redis_args(out),
            ScriptArg::Text(text) => text.write_redis_args(out),
        }
    }
}

/// Store handle over a multiplexed, auto-reconnecting Redis connection.
///
/// Scripts are hashed once at construction and invoked with `EVALSHA`;
/// `redis::Script` reloads them transparently after a server restart.
pub struct RedisStore {
    connection: ConnectionManager,
    scripts: HashMap<Script, redis::Script>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("scripts", &self.scripts.len())
            .finish()
    }
}

impl RedisStore {
    /// Connect to the Redis server at `url` and verify it answers `PING`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            warn!(error = %e, "Failed to create Redis client for rate limiting");
            LimiterError::Store(e)
        })?;

        let connection = ConnectionManager::new(client).await.map_err(|e| {
            warn!(error = %e, "Failed to create connection manager for rate limiting");
            LimiterError::Store(e)
        })?;

        let mut conn = connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        debug!("Connected to Redis for rate limiting");
        Ok(Self::from_connection(connection))
    }

    /// Build a store over an already established connection manager.
    pub fn from_connection(connection: ConnectionManager) -> Self {
        let scripts = Script::ALL
            .iter()
            .map(|script| (*script, redis::Script::new(script.source())))
            .collect();

        Self {
            connection,
            scripts,
        }
    }

    fn prepared(&self, script: &Script) -> Result<&redis::Script> {
        self.scripts.get(script).ok_or_else(|| LimiterError::UnexpectedReply {
            script: script.name(),
            detail: "script was not prepared".to_string(),
        })
    }
}

#[async_trait]
impl ScriptStore for RedisStore {
    async fn eval(&self, script: &Script, keys: &[String], args: &[ScriptArg]) -> Result<Vec<i64>> {
        let prepared = self.prepared(script)?;
        let mut invocation = prepared.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg);
        }

        trace!(script = %script, keys = ?keys, "Evaluating rate limit script");

        let mut conn = self.connection.clone();
        let reply: Vec<i64> = invocation.invoke_async(&mut conn).await?;
        Ok(reply)
    }

    async fn remove_members(&self, key: &str, members: &[String]) -> Result<u64> {
        if members.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connection.clone();
        let removed: u64 = redis::cmd("ZREM")
            .arg(key)
            .arg(members)
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::shared_factory;
    use std::sync::Arc;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    fn unique(prefix: &str) -> String {
        format!("{}-{}", prefix, uuid::Uuid::new_v4())
    }

    fn concurrency_keys(partition: &str) -> Vec<String> {
        let base = format!("rl:{{{}}}", partition);
        vec![base.clone(), format!("{}:q", base), format!("{}:stats", base)]
    }

    fn concurrency_args(
        limit: i64,
        queue_limit: i64,
        try_enqueue: bool,
        now: i64,
        request_id: &str,
    ) -> Vec<ScriptArg> {
        vec![
            limit.into(),
            queue_limit.into(),
            try_enqueue.into(),
            now.into(),
            1i64.into(),
            request_id.into(),
            60_000i64.into(),
            false.into(),
            3_600_000i64.into(),
        ]
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server (REDIS_URL)"]
    async fn test_redis_fixed_window_round_trip() {
        let store = RedisStore::connect(&redis_url()).await.unwrap();
        let factory = shared_factory(Arc::new(store));
        let store = factory();

        let partition = format!("redis-smoke-{}", uuid::Uuid::new_v4());
        let keys = vec![format!("rl:{{{}}}", partition), format!("rl:{{{}}}:exp", partition)];
        let now = chrono::Utc::now().timestamp_millis();
        let args = vec![
            ScriptArg::from(1u32),
            ScriptArg::from(now),
            ScriptArg::from(10_000i64),
            ScriptArg::from(1u32),
        ];

        let first = store.eval(&Script::FixedWindow, &keys, &args).await.unwrap();
        assert_eq!(first, vec![1, now + 10_000, 1]);

        let second = store.eval(&Script::FixedWindow, &keys, &args).await.unwrap();
        assert_eq!(second, vec![1, now + 10_000, 0]);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server (REDIS_URL)"]
    async fn test_redis_concurrency_grants_until_full() {
        let store = RedisStore::connect(&redis_url()).await.unwrap();
        let k = concurrency_keys(&unique("redis-conc"));
        let now = now();

        let first = store
            .eval(&Script::ConcurrencyAcquire, &k, &concurrency_args(2, 0, true, now, "a"))
            .await
            .unwrap();
        assert_eq!(first, vec![1, 0, 0, 0]);
        let second = store
            .eval(&Script::ConcurrencyAcquire, &k, &concurrency_args(2, 0, true, now, "b"))
            .await
            .unwrap();
        assert_eq!(second, vec![1, 1, 0, 0]);
        let third = store
            .eval(&Script::ConcurrencyAcquire, &k, &concurrency_args(2, 0, true, now, "c"))
            .await
            .unwrap();
        assert_eq!(third, vec![0, 2, 0, 0]);

        let stats_args = vec![ScriptArg::from(now), ScriptArg::from(60_000i64)];
        let stats = store.eval(&Script::ConcurrencyStatistics, &k, &stats_args).await.unwrap();
        assert_eq!(stats, vec![2, 0, 2, 1]);

        let mut conn = store.connection.clone();
        let ttl: i64 = redis::cmd("PTTL").arg(&k[2]).query_async(&mut conn).await.unwrap();
        assert!(ttl > 3_500_000 && ttl <= 3_600_000, "ttl was {}", ttl);

        assert_eq!(store.remove_members(&k[0], &["a:1".to_string()]).await.unwrap(), 1);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server (REDIS_URL)"]
    async fn test_redis_concurrency_statistics_ignore_abandoned_reservations() {
        let store = RedisStore::connect(&redis_url()).await.unwrap();
        let k = concurrency_keys(&unique("redis-gone"));
        let now = now();

        store
            .eval(&Script::ConcurrencyAcquire, &k, &concurrency_args(1, 0, true, now - 61_000, "crashed"))
            .await
            .unwrap();

        let stats_args = vec![ScriptArg::from(now), ScriptArg::from(60_000i64)];
        let stats = store.eval(&Script::ConcurrencyStatistics, &k, &stats_args).await.unwrap();
        assert_eq!(stats[0], 0);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server (REDIS_URL)"]
    async fn test_redis_concurrency_queue_fairness() {
        let store = RedisStore::connect(&redis_url()).await.unwrap();
        let k = concurrency_keys(&unique("redis-fair"));
        let now = now();
        let acquire = |id: &str| concurrency_args(2, 1, true, now, id);

        store.eval(&Script::ConcurrencyAcquire, &k, &acquire("a")).await.unwrap();
        store.eval(&Script::ConcurrencyAcquire, &k, &acquire("b")).await.unwrap();
        let c = store.eval(&Script::ConcurrencyAcquire, &k, &acquire("c")).await.unwrap();
        assert_eq!(c, vec![0, 2, 1, 0]);

        store.remove_members(&k[0], &["a:1".to_string()]).await.unwrap();

        // A slot is free, but the waiter comes first and the queue is full
        let d = store.eval(&Script::ConcurrencyAcquire, &k, &acquire("d")).await.unwrap();
        assert_eq!(d, vec![0, 1, 0, 1]);

        let retry = store
            .eval(&Script::ConcurrencyAcquire, &k, &concurrency_args(2, 1, false, now, "c"))
            .await
            .unwrap();
        assert_eq!(retry, vec![1, 1, 0, 1]);
        assert_eq!(store.remove_members(&k[1], &["c:1".to_string()]).await.unwrap(), 0);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server (REDIS_URL)"]
    async fn test_redis_sliding_window_round_trip() {
        let store = RedisStore::connect(&redis_url()).await.unwrap();
        let partition = unique("redis-sw");
        let keys = vec![format!("rl:{{{}}}", partition), format!("rl:{{{}}}:stats", partition)];
        let now = now();
        let args = |id: &str| -> Vec<ScriptArg> {
            vec![
                ScriptArg::from(2i64),
                ScriptArg::from(now),
                ScriptArg::from(10_000i64),
                ScriptArg::from(1i64),
                ScriptArg::from(id),
                ScriptArg::from(3_600_000i64),
            ]
        };

        assert_eq!(store.eval(&Script::SlidingWindow, &keys, &args("a")).await.unwrap(), vec![1, 0, now + 10_000]);
        assert_eq!(store.eval(&Script::SlidingWindow, &keys, &args("b")).await.unwrap(), vec![1, 1, now + 10_000]);
        assert_eq!(store.eval(&Script::SlidingWindow, &keys, &args("c")).await.unwrap(), vec![0, 2, now + 10_000]);

        let stats_args = vec![ScriptArg::from(now), ScriptArg::from(10_000i64)];
        let stats = store
            .eval(&Script::SlidingWindowStatistics, &keys, &stats_args)
            .await
            .unwrap();
        assert_eq!(stats, vec![2, 2, 1]);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server (REDIS_URL)"]
    async fn test_redis_token_bucket_does_not_persist_rejections() {
        let store = RedisStore::connect(&redis_url()).await.unwrap();
        let partition = unique("redis-tb");
        let keys = vec![format!("rl:tb:{{{}}}", partition), format!("rl:tb:{{{}}}:ts", partition)];
        let now = now();
        let args = |requested: i64| -> Vec<ScriptArg> {
            vec![
                ScriptArg::from(2i64),
                ScriptArg::from(1i64),
                ScriptArg::from(60_000i64),
                ScriptArg::from(now),
                ScriptArg::from(requested),
            ]
        };

        assert_eq!(store.eval(&Script::TokenBucket, &keys, &args(2)).await.unwrap(), vec![1, 0, 0]);

        let mut conn = store.connection.clone();
        let ttl: i64 = redis::cmd("PTTL").arg(&keys[0]).query_async(&mut conn).await.unwrap();
        assert!(ttl > 100_000 && ttl <= 120_000, "ttl was {}", ttl);

        assert_eq!(store.eval(&Script::TokenBucket, &keys, &args(1)).await.unwrap(), vec![0, 0, 60_000]);
        let ttl_after: i64 = redis::cmd("PTTL").arg(&keys[0]).query_async(&mut conn).await.unwrap();
        assert!(ttl_after <= ttl);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server (REDIS_URL)"]
    async fn test_redis_remove_members() {
        let store = RedisStore::connect(&redis_url()).await.unwrap();
        let removed = store
            .remove_members("rl:{redis-smoke-missing}", &["nope:1".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }
}
