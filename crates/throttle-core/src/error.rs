//! Error type shared by the throttler, its configuration and the registry.
//!
//! Shutdown is not an error: operations on a shut-down bin or destroyed pool
//! report an "unavailable" outcome instead. Contract violations (clearing a
//! reservation that was never taken, committing a connection nobody reserved)
//! panic.

use std::path::PathBuf;

/// Errors reported by throttler operations.
#[derive(Debug, thiserror::Error)]
pub enum ThrottleError {
    /// A quota value could not be parsed as a number.
    #[error("bad number for {field}: {value:?}")]
    BadNumber { field: &'static str, value: String },

    /// A bin-matching regular expression is invalid.
    #[error("bin regular expression '{pattern}' is illegal: {source}")]
    BadPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// A numeric limit parsed fine but is out of range (negative, NaN, ...).
    #[error("invalid {field}: {reason}")]
    InvalidLimit { field: &'static str, reason: String },

    /// A blocking wait was broken off by its abort flag.
    #[error("wait interrupted")]
    Interrupted,

    /// A blocking wait ran past its deadline.
    #[error("wait timed out")]
    TimedOut,

    /// The service registry rejected an operation.
    #[error("service registry: {0}")]
    Registry(String),

    /// The configuration file could not be read or parsed.
    #[error("config {path}: {message}")]
    Config { path: PathBuf, message: String },
}

impl ThrottleError {
    /// True for the two cancellation outcomes of a blocking wait.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ThrottleError::Interrupted | ThrottleError::TimedOut)
    }
}

pub type Result<T> = std::result::Result<T, ThrottleError>;
