//! In-process store.
//!
//! Executes the same scripts as Redis over a small keyspace of integers,
//! sorted sets and hashes. A single mutex serializes every script, which
//! gives the same atomicity guarantee Redis gives `EVAL`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{unix_millis, Script, ScriptArg, ScriptStore, StoreFactory};
use crate::error::{LimiterError, Result};

#[derive(Debug, Clone)]
enum Value {
    Int(i64),
    SortedSet(HashMap<String, i64>),
    Hash(HashMap<String, i64>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "string",
            Value::SortedSet(_) => "zset",
            Value::Hash(_) => "hash",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    /// Unix milliseconds after which the key no longer exists
    expires_at: Option<i64>,
}

fn wrong_type(key: &str, found: &Value) -> LimiterError {
    LimiterError::Backend(format!(
        "WRONGTYPE operation against key {} holding a {}",
        key,
        found.type_name()
    ))
}

/// Keyspace with Redis-like commands, evaluated at a fixed `now`.
#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
    now: i64,
}

impl Keyspace {
    fn purge_if_expired(&mut self, key: &str) {
        let expired = self
            .entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .is_some_and(|at| at <= self.now);
        if expired {
            self.entries.remove(key);
        }
    }

    fn get_int(&mut self, key: &str) -> Result<Option<i64>> {
        self.purge_if_expired(key);
        match self.entries.get(key) {
            None => Ok(None),
            Some(Entry { value: Value::Int(v), .. }) => Ok(Some(*v)),
            Some(entry) => Err(wrong_type(key, &entry.value)),
        }
    }

    /// `SET key value [PX ttl]`; a plain SET discards any previous expiry.
    fn set_int(&mut self, key: &str, value: i64, ttl: Option<i64>) {
        let expires_at = ttl.map(|ttl| self.now + ttl);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Int(value),
                expires_at,
            },
        );
    }

    fn incr_by(&mut self, key: &str, by: i64) -> Result<i64> {
        self.purge_if_expired(key);
        match self.entries.get_mut(key) {
            None => {
                self.set_int(key, by, None);
                Ok(by)
            }
            Some(Entry { value: Value::Int(v), .. }) => {
                *v += by;
                Ok(*v)
            }
            Some(entry) => Err(wrong_type(key, &entry.value)),
        }
    }

    fn pexpire_at(&mut self, key: &str, at: i64) {
        self.purge_if_expired(key);
        if let Some(entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(at);
        }
        self.purge_if_expired(key);
    }

    fn pexpire(&mut self, key: &str, ttl: i64) {
        let at = self.now + ttl;
        self.pexpire_at(key, at);
    }

    fn zset(&mut self, key: &str) -> Result<Option<&mut HashMap<String, i64>>> {
        self.purge_if_expired(key);
        match self.entries.get_mut(key) {
            None => Ok(None),
            Some(Entry { value: Value::SortedSet(set), .. }) => Ok(Some(set)),
            Some(entry) => Err(wrong_type(key, &entry.value)),
        }
    }

    fn drop_if_empty(&mut self, key: &str) {
        let empty = match self.entries.get(key) {
            Some(Entry { value: Value::SortedSet(set), .. }) => set.is_empty(),
            Some(Entry { value: Value::Hash(hash), .. }) => hash.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }

    fn zadd(&mut self, key: &str, score: i64, members: &[String]) -> Result<()> {
        if self.zset(key)?.is_none() {
            self.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::SortedSet(HashMap::new()),
                    expires_at: None,
                },
            );
        }
        if let Some(set) = self.zset(key)? {
            for member in members {
                set.insert(member.clone(), score);
            }
        }
        Ok(())
    }

    fn zrem(&mut self, key: &str, members: &[String]) -> Result<u64> {
        let removed = match self.zset(key)? {
            None => 0,
            Some(set) => members.iter().filter(|m| set.remove(*m).is_some()).count() as u64,
        };
        self.drop_if_empty(key);
        Ok(removed)
    }

    /// `ZREMRANGEBYSCORE key -inf max`
    fn zrem_range_by_score(&mut self, key: &str, max: i64) -> Result<()> {
        if let Some(set) = self.zset(key)? {
            set.retain(|_, score| *score > max);
        }
        self.drop_if_empty(key);
        Ok(())
    }

    fn zcard(&mut self, key: &str) -> Result<i64> {
        Ok(self.zset(key)?.map_or(0, |set| set.len() as i64))
    }

    /// `ZCOUNT key (min +inf`
    fn zcount_above(&mut self, key: &str, min: i64) -> Result<i64> {
        Ok(self
            .zset(key)?
            .map_or(0, |set| set.values().filter(|score| **score > min).count() as i64))
    }

    fn zmin_score(&mut self, key: &str) -> Result<Option<i64>> {
        Ok(self.zset(key)?.and_then(|set| set.values().min().copied()))
    }

    fn hash(&mut self, key: &str) -> Result<Option<&mut HashMap<String, i64>>> {
        self.purge_if_expired(key);
        match self.entries.get_mut(key) {
            None => Ok(None),
            Some(Entry { value: Value::Hash(hash), .. }) => Ok(Some(hash)),
            Some(entry) => Err(wrong_type(key, &entry.value)),
        }
    }

    fn hget(&mut self, key: &str, field: &str) -> Result<Option<i64>> {
        Ok(self.hash(key)?.and_then(|hash| hash.get(field).copied()))
    }

    fn hincr_by(&mut self, key: &str, field: &str, by: i64) -> Result<i64> {
        if self.hash(key)?.is_none() {
            self.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Hash(HashMap::new()),
                    expires_at: None,
                },
            );
        }
        let hash = self
            .hash(key)?
            .ok_or_else(|| LimiterError::Backend(format!("hash {} vanished", key)))?;
        let value = hash.entry(field.to_string()).or_insert(0);
        *value += by;
        Ok(*value)
    }
}

struct ScriptCall<'a> {
    script: Script,
    keys: &'a [String],
    args: &'a [ScriptArg],
}

impl<'a> ScriptCall<'a> {
    fn key(&self, index: usize) -> Result<&'a str> {
        self.keys.get(index).map(String::as_str).ok_or_else(|| {
            LimiterError::Backend(format!("{} script expects KEYS[{}]", self.script, index + 1))
        })
    }

    fn int(&self, index: usize) -> Result<i64> {
        self.args.get(index).and_then(ScriptArg::as_i64).ok_or_else(|| {
            LimiterError::Backend(format!(
                "{} script expects a numeric ARGV[{}]",
                self.script,
                index + 1
            ))
        })
    }

    fn text(&self, index: usize) -> Result<String> {
        self.args.get(index).map(ScriptArg::as_text).ok_or_else(|| {
            LimiterError::Backend(format!("{} script expects ARGV[{}]", self.script, index + 1))
        })
    }
}

fn reservation_members(request_id: &str, requested: i64) -> Vec<String> {
    (1..=requested).map(|i| format!("{}:{}", request_id, i)).collect()
}

fn concurrency_acquire(ks: &mut Keyspace, call: &ScriptCall<'_>) -> Result<Vec<i64>> {
    let (active, queue, stats) = (call.key(0)?, call.key(1)?, call.key(2)?);
    let limit = call.int(0)?;
    let queue_limit = call.int(1)?;
    let try_enqueue = call.int(2)? == 1;
    let timestamp = call.int(3)?;
    let requested = call.int(4)?;
    let request_id = call.text(5)?;
    let ttl = call.int(6)?;
    let is_retry = call.int(7)? == 1;
    let stats_ttl = call.int(8)?;

    ks.zrem_range_by_score(active, timestamp - ttl)?;
    ks.zrem_range_by_score(queue, timestamp - ttl)?;

    let count = ks.zcard(active)?;
    let queue_count = if queue_limit > 0 { ks.zcard(queue)? } else { 0 };

    let mut allowed = count + requested <= limit;
    let mut queued = false;
    let members = reservation_members(&request_id, requested);

    if allowed {
        if queue_count > 0 && try_enqueue {
            allowed = false;
            queued = queue_count + requested <= queue_limit;
        } else {
            ks.zadd(active, timestamp, &members)?;
            ks.pexpire(active, ttl);
            ks.zrem(queue, &members)?;
        }
    } else if queue_limit > 0 && try_enqueue {
        queued = queue_count + requested <= queue_limit;
    }

    if queued {
        ks.zadd(queue, timestamp, &members)?;
        ks.pexpire(queue, ttl);
    }

    if allowed {
        ks.hincr_by(stats, "total_successful", requested)?;
    } else if !queued && !is_retry {
        ks.hincr_by(stats, "total_failed", requested)?;
    }
    ks.pexpire(stats, stats_ttl);

    Ok(vec![i64::from(allowed), count, i64::from(queued), queue_count])
}

fn concurrency_statistics(ks: &mut Keyspace, call: &ScriptCall<'_>) -> Result<Vec<i64>> {
    let (active, queue, stats) = (call.key(0)?, call.key(1)?, call.key(2)?);
    let now = call.int(0)?;
    let ttl = call.int(1)?;

    ks.zrem_range_by_score(active, now - ttl)?;
    ks.zrem_range_by_score(queue, now - ttl)?;

    let count = ks.zcard(active)?;
    let queue_count = ks.zcard(queue)?;
    let successful = ks.hget(stats, "total_successful")?.unwrap_or(0);
    let failed = ks.hget(stats, "total_failed")?.unwrap_or(0);
    Ok(vec![count, queue_count, successful, failed])
}

fn fixed_window(ks: &mut Keyspace, call: &ScriptCall<'_>) -> Result<Vec<i64>> {
    let (counter, expiry) = (call.key(0)?, call.key(1)?);
    let limit = call.int(0)?;
    let now = call.int(1)?;
    let window = call.int(2)?;
    let requested = call.int(3)?;

    let expires_at = match ks.get_int(expiry)? {
        Some(at) if at > now => at,
        _ => {
            let at = now + window;
            ks.set_int(counter, 0, None);
            ks.set_int(expiry, at, None);
            ks.pexpire_at(counter, at + 1000);
            ks.pexpire_at(expiry, at + 1000);
            at
        }
    };

    let mut current = ks.get_int(counter)?.unwrap_or(0);
    let allowed = current + requested <= limit;
    if allowed {
        current = ks.incr_by(counter, requested)?;
    }

    Ok(vec![current, expires_at, i64::from(allowed)])
}

fn sliding_window(ks: &mut Keyspace, call: &ScriptCall<'_>) -> Result<Vec<i64>> {
    let (active, stats) = (call.key(0)?, call.key(1)?);
    let limit = call.int(0)?;
    let now = call.int(1)?;
    let window = call.int(2)?;
    let requested = call.int(3)?;
    let request_id = call.text(4)?;
    let stats_ttl = call.int(5)?;

    ks.zrem_range_by_score(active, now - window)?;

    let count = ks.zcard(active)?;
    let allowed = count + requested <= limit;
    if allowed {
        ks.zadd(active, now, &reservation_members(&request_id, requested))?;
    }

    ks.pexpire_at(active, now + window + 1000);

    let reset_at = ks
        .zmin_score(active)?
        .map_or(now + window, |oldest| oldest + window);

    if allowed {
        ks.hincr_by(stats, "total_successful", requested)?;
    } else {
        ks.hincr_by(stats, "total_failed", requested)?;
    }
    ks.pexpire(stats, stats_ttl);

    Ok(vec![i64::from(allowed), count, reset_at])
}

fn sliding_window_statistics(ks: &mut Keyspace, call: &ScriptCall<'_>) -> Result<Vec<i64>> {
    let (active, stats) = (call.key(0)?, call.key(1)?);
    let now = call.int(0)?;
    let window = call.int(1)?;

    let count = ks.zcount_above(active, now - window)?;
    let successful = ks.hget(stats, "total_successful")?.unwrap_or(0);
    let failed = ks.hget(stats, "total_failed")?.unwrap_or(0);
    Ok(vec![count, successful, failed])
}

fn token_bucket(ks: &mut Keyspace, call: &ScriptCall<'_>) -> Result<Vec<i64>> {
    let (tokens_key, timestamp_key) = (call.key(0)?, call.key(1)?);
    let limit = call.int(0)?;
    let rate = call.int(1)?;
    let period = call.int(2)?;
    let now = call.int(3)?;
    let requested = call.int(4)?;

    let stored_tokens = ks.get_int(tokens_key)?;
    let stored_timestamp = ks.get_int(timestamp_key)?;

    let last_refreshed = stored_timestamp.unwrap_or(0);
    let elapsed_periods = (now - last_refreshed).max(0) / period;
    let mut current_tokens = stored_tokens
        .unwrap_or(limit)
        .saturating_add(elapsed_periods.saturating_mul(rate))
        .min(limit);

    let last_replenished = if last_refreshed == 0 {
        now
    } else {
        last_refreshed + elapsed_periods * period
    };

    let allowed = current_tokens >= requested;
    let mut retry_after = 0;

    if allowed {
        current_tokens -= requested;
        let ttl = ((limit + rate - 1) / rate) * period;
        ks.set_int(tokens_key, current_tokens, Some(ttl));
        ks.set_int(timestamp_key, last_replenished, Some(ttl));
    } else {
        retry_after = period - (now - last_replenished);
    }

    Ok(vec![i64::from(allowed), current_tokens, retry_after])
}

/// Store living in the current process.
///
/// Every limiter sharing one `MemoryStore` sees the same partition state, so
/// it stands in for Redis in tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory handing out this store to every limiter built from it.
    pub fn factory(self: &Arc<Self>) -> StoreFactory {
        let store = self.clone();
        Arc::new(move || store.clone() as Arc<dyn ScriptStore>)
    }

    /// Whether `key` currently exists.
    pub fn contains_key(&self, key: &str) -> bool {
        let mut keyspace = self.keyspace.lock();
        keyspace.now = unix_millis();
        keyspace.purge_if_expired(key);
        keyspace.entries.contains_key(key)
    }

    /// Remaining time to live of `key` in milliseconds, if it has one.
    pub fn pttl(&self, key: &str) -> Option<i64> {
        let mut keyspace = self.keyspace.lock();
        let now = unix_millis();
        keyspace.now = now;
        keyspace.purge_if_expired(key);
        keyspace
            .entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at - now)
    }

    /// Number of sorted-set members stored at `key`.
    pub fn member_count(&self, key: &str) -> Result<i64> {
        let mut keyspace = self.keyspace.lock();
        keyspace.now = unix_millis();
        keyspace.zcard(key)
    }
}

#[async_trait]
impl ScriptStore for MemoryStore {
    async fn eval(&self, script: &Script, keys: &[String], args: &[ScriptArg]) -> Result<Vec<i64>> {
        let call = ScriptCall {
            script: *script,
            keys,
            args,
        };

        let mut keyspace = self.keyspace.lock();
        keyspace.now = unix_millis();

        match script {
            Script::ConcurrencyAcquire => concurrency_acquire(&mut keyspace, &call),
            Script::ConcurrencyStatistics => concurrency_statistics(&mut keyspace, &call),
            Script::FixedWindow => fixed_window(&mut keyspace, &call),
            Script::SlidingWindow => sliding_window(&mut keyspace, &call),
            Script::SlidingWindowStatistics => sliding_window_statistics(&mut keyspace, &call),
            Script::TokenBucket => token_bucket(&mut keyspace, &call),
        }
    }

    async fn remove_members(&self, key: &str, members: &[String]) -> Result<u64> {
        let mut keyspace = self.keyspace.lock();
        keyspace.now = unix_millis();
        keyspace.zrem(key, members)
    }
}
