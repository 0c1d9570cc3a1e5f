//! Unified error type for the serving core.
//!
//! One taxonomy propagated unchanged across layers: request validation,
//! repository lifecycle, scheduling, and response construction all speak
//! [`Error`]. Callers that only care about classification use [`Error::code`].

use kiln_types::ShapeError;
use thiserror::Error;

/// Coarse error classification, stable across layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    InvalidArg,
    NotFound,
    Unavailable,
    AlreadyExists,
    DeadlineExceeded,
    Timeout,
    Internal,
    Unknown,
}

/// All errors produced by the serving core.
///
/// Errors raised before a request is enqueued return synchronously to the
/// caller; errors discovered afterwards surface through the per-request
/// completion. Backend errors during a batch run are per-request: a batch
/// may complete partially.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Request or configuration malformed: shape mismatch, unknown tensor,
    /// batch bounds, duplicate input.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// Model configuration rejected; names the first offending field.
    #[error("invalid model configuration: field '{field}': {reason}")]
    InvalidConfig { field: String, reason: String },

    /// Unknown model, input, or output name.
    #[error("not found: {0}")]
    NotFound(String),

    /// Model not ready: never loaded, load failed, or being unloaded.
    #[error("unavailable: {reason}")]
    Unavailable { reason: String },

    /// Duplicate response buffer allocation for one output name.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The request timed out in the queue before batch dispatch.
    #[error("deadline exceeded before dispatch")]
    DeadlineExceeded,

    /// A server-level deadline elapsed (e.g. shutdown drain).
    #[error("operation timed out")]
    Timeout,

    /// Backend crash, allocator failure, or pool bookkeeping gone wrong.
    #[error("internal error: {0}")]
    Internal(String),

    /// Catch-all mapped from unexpected backend errors.
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl Error {
    /// Classification code for this error.
    pub fn code(&self) -> Code {
        match self {
            Error::InvalidArg(_) | Error::InvalidConfig { .. } => Code::InvalidArg,
            Error::NotFound(_) => Code::NotFound,
            Error::Unavailable { .. } => Code::Unavailable,
            Error::AlreadyExists(_) => Code::AlreadyExists,
            Error::DeadlineExceeded => Code::DeadlineExceeded,
            Error::Timeout => Code::Timeout,
            Error::Internal(_) => Code::Internal,
            Error::Unknown(_) => Code::Unknown,
        }
    }

    /// Shorthand for an [`Error::Unavailable`] with a formatted reason.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Error::Unavailable {
            reason: reason.into(),
        }
    }

    /// Shorthand for an [`Error::InvalidConfig`] naming the offending field.
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<ShapeError> for Error {
    fn from(e: ShapeError) -> Self {
        Error::InvalidArg(e.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_classify_variants() {
        assert_eq!(Error::InvalidArg("x".into()).code(), Code::InvalidArg);
        assert_eq!(
            Error::invalid_config("dims", "empty").code(),
            Code::InvalidArg
        );
        assert_eq!(Error::unavailable("loading").code(), Code::Unavailable);
        assert_eq!(Error::DeadlineExceeded.code(), Code::DeadlineExceeded);
    }

    #[test]
    fn shape_errors_map_to_invalid_arg() {
        let shape_err = ShapeError::Mismatch {
            dims: vec![2],
            shape: vec![3],
        };
        assert_eq!(Error::from(shape_err).code(), Code::InvalidArg);
    }
}
