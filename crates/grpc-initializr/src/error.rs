//! Error types for server bootstrap and request handling.
//!
//! This module defines the central `Error` enum, which captures every failure
//! the bootstrap layer can report. It implements `From<Error>` for
//! `tonic::Status` so errors raised inside a handler can be returned to
//! clients with an appropriate status code.
//!
//! ## Error Cases
//! - `Configuration`: Startup configuration is invalid or incomplete (e.g. no
//!   handler registered for the selected concurrency mode). Raised before any
//!   network resource is acquired.
//! - `IllegalState`: A lifecycle operation was invoked from the wrong state.
//! - `InvalidArgument`: A value violates a documented constraint (retry
//!   policy invariants, malformed durations, untyped payloads).
//! - `RequestDecoding`: An inbound message could not be converted into a
//!   loggable structured form. Only the affected call is aborted.
//! - `Bind` / `Transport`: The underlying listener or transport failed. These
//!   are propagated unchanged and never retried.

use crate::server::LifecycleState;
use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the bootstrap layer.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Invalid or incomplete startup configuration.
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// A lifecycle method was called from a state that does not allow it.
    #[error("Illegal state: cannot {operation} while server is {state}")]
    IllegalState {
        operation: &'static str,
        state: LifecycleState,
    },

    /// A value violated a documented constraint.
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// An inbound message could not be converted to a structured form.
    #[error("Request decoding failed: {reason}")]
    RequestDecoding { reason: String },

    /// The listener could not be bound to the requested endpoint.
    #[error("Failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// The transport failed while serving.
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Configuration { reason } => Status::failed_precondition(reason),
            Error::IllegalState { .. } => Status::failed_precondition(err.to_string()),
            Error::InvalidArgument { reason } => Status::invalid_argument(reason),
            Error::RequestDecoding { reason } => Status::unknown(reason),
            Error::Bind { .. } | Error::Transport(_) => Status::unavailable(err.to_string()),
            Error::Io(e) => Status::internal(format!("I/O error: {e}")),
            Error::Serialization(e) => Status::internal(format!("Serialization error: {e}")),
        }
    }
}
