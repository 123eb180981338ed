//! Custom error types for the relay and instrument sessions.
//!
//! `RelayError` is the single error type of the library. Instrument sessions,
//! the relay dispatcher and the relay client all report failures through it,
//! so a caller always gets an explicit `Err` instead of a sentinel value.
//!
//! ## Error Hierarchy
//!
//! - **`Io`**: socket and file I/O failures.
//! - **`Timeout`**: an acquisition, device call, bus query or connect exceeded
//!   its deadline.
//! - **`Unrecognized`**: a relay request whose token is not in the command table,
//!   or a channel the instrument has no binding for.
//! - **`InvalidArgument`**: a write request whose value is missing or unparsable.
//! - **`DeviceFault`**: the instrument or bus reported an error, or replied with
//!   something that is not a number.
//! - **`Protocol`** / **`EmptyReply`**: the relay reply could not be decoded.
//! - **`RetriesExhausted`**: the client gave up after its configured attempts.
//! - **`FeatureNotEnabled`**: a bus backend that was not compiled in.

use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type RelayResult<T> = std::result::Result<T, RelayError>;

/// Errors reported by buses, instruments, sessions and the relay.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Socket or file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A deadline expired; the message names the operation.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Unknown relay token, or a channel without a binding.
    #[error("Unrecognized command: {0}")]
    Unrecognized(String),

    /// A write value was missing or not a number.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The instrument reported an error or answered with something unparsable.
    #[error("Device fault: {0}")]
    DeviceFault(String),

    /// A relay reply could not be decoded.
    #[error("Malformed reply: {0}")]
    Protocol(String),

    /// The relay closed without replying.
    #[error("Empty reply from relay")]
    EmptyReply,

    /// The client gave up; `last_value` is the last rejected reading.
    #[error("No valid reading after {attempts} attempts (last value: {last_value:?})")]
    RetriesExhausted {
        attempts: u32,
        last_value: Option<f32>,
    },

    /// The dispatcher task has stopped.
    #[error("Device dispatcher is not running")]
    DispatcherClosed,

    /// Settings that cannot work.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A bus backend that was not compiled in.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// Writing the sample file failed.
    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Serializing sample metadata failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RelayError {
    /// Classify an I/O error from a blocking bus call. A timed-out read
    /// becomes [`RelayError::Timeout`] with `context`.
    pub fn from_io(err: std::io::Error, context: impl Into<String>) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => RelayError::Timeout(context.into()),
            _ => RelayError::Io(err),
        }
    }

    /// Whether the relay client should retry after this error.
    ///
    /// Transport hiccups are transient; anything the relay answered with
    /// deliberately (unknown token, bad value, device fault) is not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::Io(_) | RelayError::Timeout(_) | RelayError::EmptyReply
        )
    }
}
