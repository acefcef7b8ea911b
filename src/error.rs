//! Error types for the rate limiting crate.

use thiserror::Error;

/// Main error type for rate limiting operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Invalid limiter options or configuration file
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid call arguments
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// More permits requested than the limiter can ever grant
    #[error("{permit_count} permit(s) exceeds the permit limit of {limit}")]
    PermitLimitExceeded { permit_count: u32, limit: u32 },

    /// Redis errors
    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    /// Errors raised by a non-Redis store backend
    #[error("Store backend error: {0}")]
    Backend(String),

    /// A script replied with a shape the caller cannot unpack
    #[error("Unexpected reply from {script} script: {detail}")]
    UnexpectedReply { script: &'static str, detail: String },

    /// The caller cancelled a pending acquisition
    #[error("Acquisition {request_id} was canceled")]
    Canceled { request_id: String },

    /// The limiter has already been disposed
    #[error("Rate limiter has been disposed")]
    Disposed,
}

/// Result type alias for rate limiting operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
