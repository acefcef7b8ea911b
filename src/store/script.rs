//! Atomic decision scripts.
//!
//! Each script reads, decides and mutates partition state in one step and
//! replies with a flat array of integers (booleans as 0/1). Times are Unix
//! milliseconds sampled once by the caller and passed in `ARGV`.

/// Identity of an atomic script understood by every [`ScriptStore`](super::ScriptStore).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Script {
    /// KEYS `[active, queue, stats]`, ARGV `[permit_limit, queue_limit,
    /// try_enqueue, now_ms, permit_count, request_id, ttl_ms, is_retry,
    /// stats_ttl_ms]`. Reply `[allowed, active_count, queued, queue_count]`.
    ConcurrencyAcquire,
    /// KEYS `[active, queue, stats]`, ARGV `[now_ms, ttl_ms]`.
    /// Reply `[active_count, queue_count, total_successful, total_failed]`.
    ConcurrencyStatistics,
    /// KEYS `[counter, expiry]`, ARGV `[permit_limit, now_ms, window_ms, permit_count]`.
    /// Reply `[counter, expires_at_ms, allowed]`.
    FixedWindow,
    /// KEYS `[active, stats]`, ARGV `[permit_limit, now_ms, window_ms,
    /// permit_count, request_id, stats_ttl_ms]`. Reply `[allowed, count, reset_at_ms]`.
    SlidingWindow,
    /// KEYS `[active, stats]`, ARGV `[now_ms, window_ms]`.
    /// Reply `[count, total_successful, total_failed]`.
    SlidingWindowStatistics,
    /// KEYS `[tokens, timestamp]`, ARGV `[token_limit, tokens_per_period,
    /// period_ms, now_ms, permit_count]`. Reply `[allowed, tokens, retry_after_ms]`.
    TokenBucket,
}

impl Script {
    /// Every script, in a stable order.
    pub const ALL: [Script; 6] = [
        Script::ConcurrencyAcquire,
        Script::ConcurrencyStatistics,
        Script::FixedWindow,
        Script::SlidingWindow,
        Script::SlidingWindowStatistics,
        Script::TokenBucket,
    ];

    /// Short name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Script::ConcurrencyAcquire => "concurrency_acquire",
            Script::ConcurrencyStatistics => "concurrency_statistics",
            Script::FixedWindow => "fixed_window",
            Script::SlidingWindow => "sliding_window",
            Script::SlidingWindowStatistics => "sliding_window_statistics",
            Script::TokenBucket => "token_bucket",
        }
    }

    /// Number of entries in a well-formed reply.
    pub fn reply_len(&self) -> usize {
        match self {
            Script::ConcurrencyAcquire | Script::ConcurrencyStatistics => 4,
            Script::FixedWindow | Script::SlidingWindow => 3,
            Script::SlidingWindowStatistics | Script::TokenBucket => 3,
        }
    }

    /// Lua source evaluated by Redis.
    pub fn source(&self) -> &'static str {
        match self {
            Script::ConcurrencyAcquire => CONCURRENCY_ACQUIRE,
            Script::ConcurrencyStatistics => CONCURRENCY_STATISTICS,
            Script::FixedWindow => FIXED_WINDOW,
            Script::SlidingWindow => SLIDING_WINDOW,
            Script::SlidingWindowStatistics => SLIDING_WINDOW_STATISTICS,
            Script::TokenBucket => TOKEN_BUCKET,
        }
    }
}

impl std::fmt::Display for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

const CONCURRENCY_ACQUIRE: &str = r#"
local limit = tonumber(ARGV[1])
local queue_limit = tonumber(ARGV[2])
local try_enqueue = tonumber(ARGV[3])
local timestamp = tonumber(ARGV[4])
local requested = tonumber(ARGV[5])
local request_id = ARGV[6]
local ttl = tonumber(ARGV[7])
local is_retry = tonumber(ARGV[8])
local stats_ttl = tonumber(ARGV[9])

-- reservations older than the ttl belong to crashed holders
redis.call("zremrangebyscore", KEYS[1], "-inf", timestamp - ttl)
redis.call("zremrangebyscore", KEYS[2], "-inf", timestamp - ttl)

local count = redis.call("zcard", KEYS[1])
local queue_count = 0
if queue_limit > 0 then
    queue_count = redis.call("zcard", KEYS[2])
end

local allowed = count + requested <= limit
local queued = false

local members = {}
local scored = {}
for i = 1, requested do
    local member = request_id .. ":" .. i
    members[i] = member
    scored[i * 2 - 1] = timestamp
    scored[i * 2] = member
end

if allowed then
    if queue_count > 0 and try_enqueue == 1 then
        -- a fresh arrival never jumps ahead of existing waiters
        allowed = false
        queued = queue_count + requested <= queue_limit
    else
        redis.call("zadd", KEYS[1], unpack(scored))
        redis.call("pexpire", KEYS[1], ttl)
        redis.call("zrem", KEYS[2], unpack(members))
    end
elseif queue_limit > 0 and try_enqueue == 1 then
    queued = queue_count + requested <= queue_limit
end

if queued then
    redis.call("zadd", KEYS[2], unpack(scored))
    redis.call("pexpire", KEYS[2], ttl)
end

if allowed then
    redis.call("hincrby", KEYS[3], "total_successful", requested)
elseif not queued and is_retry == 0 then
    redis.call("hincrby", KEYS[3], "total_failed", requested)
end
if redis.call("exists", KEYS[3]) == 1 then
    redis.call("pexpire", KEYS[3], stats_ttl)
end

return { allowed and 1 or 0, count, queued and 1 or 0, queue_count }
"#;

const CONCURRENCY_STATISTICS: &str = r#"
local now = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])

redis.call("zremrangebyscore", KEYS[1], "-inf", now - ttl)
redis.call("zremrangebyscore", KEYS[2], "-inf", now - ttl)

local count = redis.call("zcard", KEYS[1])
local queue_count = redis.call("zcard", KEYS[2])
local successful = tonumber(redis.call("hget", KEYS[3], "total_successful")) or 0
local failed = tonumber(redis.call("hget", KEYS[3], "total_failed")) or 0

return { count, queue_count, successful, failed }
"#;

const FIXED_WINDOW: &str = r#"
local limit = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local window = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])

local expires_at = tonumber(redis.call("get", KEYS[2]))

if not expires_at or expires_at <= now then
    -- lazy rollover: the only place a window boundary advances
    expires_at = now + window
    redis.call("set", KEYS[1], 0)
    redis.call("set", KEYS[2], expires_at)
    redis.call("pexpireat", KEYS[1], expires_at + 1000)
    redis.call("pexpireat", KEYS[2], expires_at + 1000)
end

local current = tonumber(redis.call("get", KEYS[1])) or 0
local allowed = current + requested <= limit

if allowed then
    current = redis.call("incrby", KEYS[1], requested)
end

return { current, expires_at, allowed and 1 or 0 }
"#;

const SLIDING_WINDOW: &str = r#"
local limit = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local window = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])
local request_id = ARGV[5]
local stats_ttl = tonumber(ARGV[6])

redis.call("zremrangebyscore", KEYS[1], "-inf", now - window)

local count = redis.call("zcard", KEYS[1])
local allowed = count + requested <= limit

if allowed then
    local scored = {}
    for i = 1, requested do
        scored[i * 2 - 1] = now
        scored[i * 2] = request_id .. ":" .. i
    end
    redis.call("zadd", KEYS[1], unpack(scored))
end

redis.call("pexpireat", KEYS[1], now + window + 1000)

local reset_at = now + window
local oldest = redis.call("zrange", KEYS[1], 0, 0, "WITHSCORES")
if oldest[2] then
    reset_at = tonumber(oldest[2]) + window
end

if allowed then
    redis.call("hincrby", KEYS[2], "total_successful", requested)
else
    redis.call("hincrby", KEYS[2], "total_failed", requested)
end
redis.call("pexpire", KEYS[2], stats_ttl)

return { allowed and 1 or 0, count, reset_at }
"#;

const SLIDING_WINDOW_STATISTICS: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])

local count = redis.call("zcount", KEYS[1], "(" .. (now - window), "+inf")
local successful = tonumber(redis.call("hget", KEYS[2], "total_successful")) or 0
local failed = tonumber(redis.call("hget", KEYS[2], "total_failed")) or 0

return { count, successful, failed }
"#;

const TOKEN_BUCKET: &str = r#"
local limit = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local period = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local requested = tonumber(ARGV[5])

local state = redis.call("mget", KEYS[1], KEYS[2])

local current_tokens = tonumber(state[1])
if current_tokens == nil then
    current_tokens = limit
end

local last_refreshed = tonumber(state[2])
if last_refreshed == nil then
    last_refreshed = 0
end

local elapsed_periods = math.floor(math.max(0, now - last_refreshed) / period)
current_tokens = math.min(limit, current_tokens + elapsed_periods * rate)

-- keep the sub-period remainder so the refill cadence stays exact
local last_replenished = last_refreshed + elapsed_periods * period
if last_refreshed == 0 then
    last_replenished = now
end

local allowed = current_tokens >= requested
local retry_after = 0

if allowed then
    current_tokens = current_tokens - requested
    local ttl = math.ceil(limit / rate) * period
    redis.call("set", KEYS[1], current_tokens, "PX", ttl)
    redis.call("set", KEYS[2], last_replenished, "PX", ttl)
else
    retry_after = period - (now - last_replenished)
end

return { allowed and 1 or 0, current_tokens, retry_after }
"#;
