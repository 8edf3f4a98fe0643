//! Error types for the Magnetite vector store
//!
//! `Error` is the unified error type for all Magnetite APIs. We use
//! `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! ## Canonical error codes
//!
//! Every variant maps onto one of the frozen wire codes:
//!
//! | Code | Description |
//! |------|-------------|
//! | Ok | Success (never carried by an `Error`) |
//! | NotFound | Collection, partition, segment or vector not found |
//! | AlreadyExists | Collection or partition id already taken |
//! | InvalidArgument | Bad input that retrying cannot fix |
//! | DimensionMismatch | Vector dimension differs from the collection's |
//! | TransactionFailed | A catalog transaction did not commit |
//! | IncompatibleMeta | Stored catalog schema predates this build |
//! | Io | Disk, filesystem or WAL failure |
//! | Cancelled | Deadline or cancellation hit before completion |
//! | Internal | Bug or invariant violation |
//!
//! ## Classification
//!
//! - Transient I/O failures are retryable: background workers retry with
//!   backoff, foreground calls retry once and then surface the error.
//! - Validation failures require input changes and are never retried.
//! - `IncompatibleMeta` and `Corruption` are fatal at startup.

use std::io;
use thiserror::Error;

/// Result type alias for Magnetite operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Canonical error codes for the wire surface.
///
/// These ten codes are the stable representation of all Magnetite errors
/// and are frozen; new variants must map onto one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Success.
    Ok,
    /// Entity not found.
    NotFound,
    /// Entity already exists.
    AlreadyExists,
    /// Invalid input.
    InvalidArgument,
    /// Vector dimension mismatch.
    DimensionMismatch,
    /// Catalog transaction failed.
    TransactionFailed,
    /// Stored catalog schema is incompatible.
    IncompatibleMeta,
    /// Disk, filesystem or WAL failure.
    Io,
    /// Operation cancelled or timed out.
    Cancelled,
    /// Bug or invariant violation.
    Internal,
}

impl ErrorCode {
    /// Canonical string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Ok => "OK",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::InvalidArgument => "INVALID_ARG",
            ErrorCode::DimensionMismatch => "DIMENSION_MISMATCH",
            ErrorCode::TransactionFailed => "TRANSACTION_FAILED",
            ErrorCode::IncompatibleMeta => "INCOMPATIBLE_META",
            ErrorCode::Io => "IO",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// Parse the canonical string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OK" => Some(ErrorCode::Ok),
            "NOT_FOUND" => Some(ErrorCode::NotFound),
            "ALREADY_EXISTS" => Some(ErrorCode::AlreadyExists),
            "INVALID_ARG" => Some(ErrorCode::InvalidArgument),
            "DIMENSION_MISMATCH" => Some(ErrorCode::DimensionMismatch),
            "TRANSACTION_FAILED" => Some(ErrorCode::TransactionFailed),
            "INCOMPATIBLE_META" => Some(ErrorCode::IncompatibleMeta),
            "IO" => Some(ErrorCode::Io),
            "CANCELLED" => Some(ErrorCode::Cancelled),
            "INTERNAL" => Some(ErrorCode::Internal),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Unified error type for all Magnetite operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Collection, partition, segment or vector not found.
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// A collection or partition with this id already exists.
    #[error("already exists: {what}")]
    AlreadyExists {
        /// The conflicting id.
        what: String,
    },

    /// The target exists but is in a state that rejects the operation.
    ///
    /// Creating a collection whose previous incarnation is still in its
    /// TO_DELETE grace period reports this; the caller waits for the TTL
    /// cleaner and retries.
    #[error("conflict: {reason}")]
    Conflict {
        /// Why the operation cannot proceed right now.
        reason: String,
    },

    /// Invalid input; fix the arguments, retrying will not help.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// What is wrong with the input.
        message: String,
    },

    /// Vector dimension differs from the collection's configured dimension.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// The collection's dimension.
        expected: usize,
        /// The dimension provided.
        got: usize,
    },

    /// A catalog transaction failed to commit; no partial state is visible.
    #[error("meta transaction failed: {message}")]
    TransactionFailed {
        /// Underlying failure description.
        message: String,
    },

    /// The stored catalog schema was written by an incompatible version.
    ///
    /// Fatal at startup: recreating the tables would silently lose data.
    #[error("incompatible meta schema: {message}")]
    IncompatibleMeta {
        /// Which table drifted and how.
        message: String,
    },

    /// I/O error from disk, filesystem or WAL operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to encode or decode a record or blob.
    #[error("serialization error: {message}")]
    Serialization {
        /// What went wrong.
        message: String,
    },

    /// Data integrity check failed.
    #[error("corruption detected: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// The operation's deadline elapsed or its context was cancelled.
    #[error("cancelled: {operation}")]
    Cancelled {
        /// The operation that was cut short.
        operation: String,
    },

    /// Unexpected internal error; indicates a bug.
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl Error {
    /// Create a NotFound error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound { what: what.into() }
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(what: impl Into<String>) -> Self {
        Error::AlreadyExists { what: what.into() }
    }

    /// Create a Conflict error.
    pub fn conflict(reason: impl Into<String>) -> Self {
        Error::Conflict {
            reason: reason.into(),
        }
    }

    /// Create an InvalidArgument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a DimensionMismatch error.
    pub fn dimension_mismatch(expected: usize, got: usize) -> Self {
        Error::DimensionMismatch { expected, got }
    }

    /// Create a TransactionFailed error.
    pub fn transaction_failed(message: impl Into<String>) -> Self {
        Error::TransactionFailed {
            message: message.into(),
        }
    }

    /// Create an IncompatibleMeta error.
    pub fn incompatible_meta(message: impl Into<String>) -> Self {
        Error::IncompatibleMeta {
            message: message.into(),
        }
    }

    /// Create a Serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Error::Serialization {
            message: message.into(),
        }
    }

    /// Create a Corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Error::Corruption {
            message: message.into(),
        }
    }

    /// Create a Cancelled error.
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Error::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    /// The canonical wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NotFound { .. } => ErrorCode::NotFound,
            Error::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            Error::Conflict { .. } => ErrorCode::TransactionFailed,
            Error::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Error::DimensionMismatch { .. } => ErrorCode::DimensionMismatch,
            Error::TransactionFailed { .. } => ErrorCode::TransactionFailed,
            Error::IncompatibleMeta { .. } => ErrorCode::IncompatibleMeta,
            Error::Io(_) => ErrorCode::Io,
            Error::Serialization { .. } => ErrorCode::Io,
            Error::Corruption { .. } => ErrorCode::Io,
            Error::Cancelled { .. } => ErrorCode::Cancelled,
            Error::Internal { .. } => ErrorCode::Internal,
        }
    }

    /// Whether this is a "not found" lookup result.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Whether this is an "already exists" lookup result.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    /// Whether this error is a validation failure.
    ///
    /// Validation failures indicate bad input; they are surfaced to the
    /// caller and never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidArgument { .. } | Error::DimensionMismatch { .. }
        )
    }

    /// Whether retrying the operation may succeed.
    ///
    /// Transient I/O and transaction failures qualify; background workers
    /// retry them with backoff, foreground calls retry once.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::TransactionFailed { .. } | Error::Conflict { .. }
        )
    }

    /// Whether this error is fatal at startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::IncompatibleMeta { .. } | Error::Corruption { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let err = Error::not_found("collection c1");
        assert!(err.to_string().contains("collection c1"));

        let err = Error::dimension_mismatch(128, 64);
        let msg = err.to_string();
        assert!(msg.contains("128"));
        assert!(msg.contains("64"));
    }

    #[test]
    fn codes_round_trip() {
        for code in [
            ErrorCode::Ok,
            ErrorCode::NotFound,
            ErrorCode::AlreadyExists,
            ErrorCode::InvalidArgument,
            ErrorCode::DimensionMismatch,
            ErrorCode::TransactionFailed,
            ErrorCode::IncompatibleMeta,
            ErrorCode::Io,
            ErrorCode::Cancelled,
            ErrorCode::Internal,
        ] {
            assert_eq!(ErrorCode::parse(code.as_str()), Some(code));
        }
        assert_eq!(ErrorCode::parse("BOGUS"), None);
    }

    #[test]
    fn variant_code_mapping() {
        assert_eq!(Error::not_found("x").code(), ErrorCode::NotFound);
        assert_eq!(Error::already_exists("x").code(), ErrorCode::AlreadyExists);
        assert_eq!(
            Error::dimension_mismatch(4, 8).code(),
            ErrorCode::DimensionMismatch
        );
        assert_eq!(
            Error::incompatible_meta("x").code(),
            ErrorCode::IncompatibleMeta
        );
        assert_eq!(Error::cancelled("query").code(), ErrorCode::Cancelled);
        let io: Error = io::Error::new(io::ErrorKind::Other, "disk").into();
        assert_eq!(io.code(), ErrorCode::Io);
    }

    #[test]
    fn classification() {
        assert!(Error::invalid_argument("x").is_validation());
        assert!(Error::dimension_mismatch(1, 2).is_validation());
        assert!(!Error::not_found("x").is_validation());

        assert!(Error::transaction_failed("x").is_retryable());
        assert!(!Error::invalid_argument("x").is_retryable());

        assert!(Error::incompatible_meta("x").is_fatal());
        assert!(Error::corruption("x").is_fatal());
        assert!(!Error::not_found("x").is_fatal());
    }

    #[test]
    fn from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
