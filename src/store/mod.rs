//! Shared store access.
//!
//! Limiters never talk to the store directly. Every admission decision is a
//! single atomic script evaluated by a [`ScriptStore`]; the only other
//! operation is sorted-set member removal, used to release concurrency
//! reservations. Correctness across processes rests entirely on the store
//! running each script without interleaving.

mod memory;
mod redis_store;
mod script;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;
pub use self::script::Script;

/// A single script argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptArg {
    Int(i64),
    Text(String),
}

impl ScriptArg {
    /// Integer view of the argument, parsing text the way Lua's `tonumber` would.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ScriptArg::Int(value) => Some(*value),
            ScriptArg::Text(text) => text.parse().ok(),
        }
    }

    /// Text view of the argument.
    pub fn as_text(&self) -> String {
        match self {
            ScriptArg::Int(value) => value.to_string(),
            ScriptArg::Text(text) => text.clone(),
        }
    }
}

impl From<i64> for ScriptArg {
    fn from(value: i64) -> Self {
        ScriptArg::Int(value)
    }
}

impl From<u32> for ScriptArg {
    fn from(value: u32) -> Self {
        ScriptArg::Int(i64::from(value))
    }
}

impl From<bool> for ScriptArg {
    fn from(value: bool) -> Self {
        ScriptArg::Int(i64::from(value))
    }
}

impl From<&str> for ScriptArg {
    fn from(value: &str) -> Self {
        ScriptArg::Text(value.to_string())
    }
}

impl From<String> for ScriptArg {
    fn from(value: String) -> Self {
        ScriptArg::Text(value)
    }
}

impl fmt::Display for ScriptArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_text())
    }
}

/// Handle to the shared key-value store.
///
/// Implementations must evaluate each script atomically: no other command
/// may observe or modify the script's keys while it runs.
#[async_trait]
pub trait ScriptStore: Send + Sync {
    /// Evaluate `script` against `keys` with positional `args`.
    ///
    /// Every script replies with a flat array of integers.
    async fn eval(&self, script: &Script, keys: &[String], args: &[ScriptArg]) -> Result<Vec<i64>>;

    /// Remove `members` from the sorted set at `key`, returning how many were present.
    async fn remove_members(&self, key: &str, members: &[String]) -> Result<u64>;
}

/// Current wall-clock time in Unix milliseconds.
pub(crate) fn unix_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Factory producing store handles for newly constructed limiters.
pub type StoreFactory = Arc<dyn Fn() -> Arc<dyn ScriptStore> + Send + Sync>;

/// Wrap an existing store handle in a factory that always returns it.
pub fn shared_factory(store: Arc<dyn ScriptStore>) -> StoreFactory {
    Arc::new(move || store.clone())
}
