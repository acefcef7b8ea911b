//! Rate limiting algorithms and their client-side orchestration.
//!
//! Four limiters share the [`RateLimiter`] interface:
//!
//! - [`ConcurrencyRateLimiter`]: bounds permits held at once, with an
//!   optional FIFO wait queue
//! - [`FixedWindowRateLimiter`]: counts permits per fixed window
//! - [`SlidingWindowRateLimiter`]: counts permits over a moving window
//! - [`TokenBucketRateLimiter`]: spends tokens that refill over time
//!
//! Each decision is a single atomic script against the shared store, which
//! makes the limiters safe to use from any number of processes.

mod concurrency;
mod fixed_window;
mod keys;
mod lease;
mod limiter;
mod manager;
mod partitioned;
mod queue;
mod sliding_window;
mod token_bucket;

pub use concurrency::{ConcurrencyOptions, ConcurrencyRateLimiter};
pub use fixed_window::{FixedWindowOptions, FixedWindowRateLimiter};
pub use keys::{new_request_id, reservation_members, PartitionKey};
pub use lease::{
    Lease, LeaseContext, MetadataValue, RATELIMIT_LIMIT, RATELIMIT_REMAINING, RATELIMIT_RESET,
    RATELIMIT_RETRYAFTER,
};
pub use limiter::{Algorithm, RateLimiter, RateLimiterStatistics};
pub use partitioned::{LimiterFactory, PartitionedRateLimiter};
pub use sliding_window::{SlidingWindowOptions, SlidingWindowRateLimiter};
pub use token_bucket::{TokenBucketOptions, TokenBucketRateLimiter};
