//! Partition key handling and store key naming.

use std::fmt;

/// Identifies the logical entity a limit applies to.
///
/// Any displayable value can serve as a partition key; its string form is
/// embedded between hash-tag braces so that all keys of one partition land
/// on the same Redis cluster slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey(String);

impl PartitionKey {
    /// Create a partition key from any displayable value.
    pub fn new(partition: impl fmt::Display) -> Self {
        Self(partition.to_string())
    }

    /// The stringified partition.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn tagged(&self) -> String {
        format!("rl:{{{}}}", self.0)
    }

    /// Active-set, queue-set and statistics keys of a concurrency limiter.
    pub fn concurrency_keys(&self) -> Vec<String> {
        let base = self.tagged();
        vec![base.clone(), format!("{}:q", base), format!("{}:stats", base)]
    }

    /// Counter and expiry keys of a fixed window limiter.
    pub fn fixed_window_keys(&self) -> Vec<String> {
        let base = self.tagged();
        vec![base.clone(), format!("{}:exp", base)]
    }

    /// Request log and statistics keys of a sliding window limiter.
    pub fn sliding_window_keys(&self) -> Vec<String> {
        let base = self.tagged();
        vec![base.clone(), format!("{}:stats", base)]
    }

    /// Token count and replenishment timestamp keys of a token bucket limiter.
    pub fn token_bucket_keys(&self) -> Vec<String> {
        let base = format!("rl:tb:{{{}}}", self.0);
        vec![base.clone(), format!("{}:ts", base)]
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionKey {
    fn from(partition: &str) -> Self {
        Self(partition.to_string())
    }
}

impl From<String> for PartitionKey {
    fn from(partition: String) -> Self {
        Self(partition)
    }
}

/// Fresh, process-unique reservation id.
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Sorted-set members a reservation of `permit_count` permits occupies.
pub fn reservation_members(request_id: &str, permit_count: u32) -> Vec<String> {
    (1..=permit_count)
        .map(|i| format!("{}:{}", request_id, i))
        .collect()
}
