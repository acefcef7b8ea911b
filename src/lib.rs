//! Distributed rate limiting backed by Redis.
//!
//! This crate provides concurrency, fixed window, sliding window and token
//! bucket limiters whose admission decisions run as atomic scripts inside a
//! shared store. Any number of processes pointing at the same store enforce
//! one global limit per partition.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use redis_rate_limiting::ratelimit::{FixedWindowOptions, FixedWindowRateLimiter, RateLimiter};
//! use redis_rate_limiting::store::{shared_factory, RedisStore};
//!
//! # async fn run() -> redis_rate_limiting::error::Result<()> {
//! let store = shared_factory(Arc::new(RedisStore::connect("redis://127.0.0.1:6379").await?));
//! let options = FixedWindowOptions::new(100, Duration::from_secs(60)).with_store(store);
//! let limiter = FixedWindowRateLimiter::new("client-42", options)?;
//!
//! let lease = limiter.acquire(1).await?;
//! if !lease.is_acquired() {
//!     // reject the request, lease.context().retry_after says when to come back
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
