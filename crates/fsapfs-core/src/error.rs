//! Error types
//!
//! Every failure is reported through [`Error`]. Callers that need to react
//! to the kind of failure rather than its message use [`Error::kind`] or the
//! coarser [`Error::category`].

use thiserror::Error;

/// The main error type for APFS operations
#[derive(Error, Debug)]
pub enum Error {
    /// Underlying byte source failure or truncated read mid-structure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Container or volume magic did not match
    #[error("Invalid signature: {0}")]
    Signature(String),

    /// A structure decoded but its contents are inconsistent
    #[error("Corrupt structure: {0}")]
    Corrupt(String),

    /// Object checksum verification failed
    #[error("Checksum verification failed: {0}")]
    ChecksumVerification(String),

    /// Handle is already open
    #[error("Already open: {0}")]
    AlreadyOpen(String),

    /// Handle was never opened or has been closed
    #[error("Not open: {0}")]
    NotOpen(String),

    /// Index outside of the valid range
    #[error("Index out of bounds: {0}")]
    IndexOutOfBounds(String),

    /// Wrong or malformed caller input
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Recognized but unimplemented accessor or format feature
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Byte range with a negative offset or size
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    /// Seek to a negative absolute offset
    #[error("Invalid offset: {0}")]
    InvalidOffset(String),

    /// Data is encrypted and the volume has not been unlocked
    #[error("Locked: {0}")]
    Locked(String),

    /// File entry or key bag record not found
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Result type alias for APFS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Categorical error kind
///
/// Corrupt metadata and checksum failures report as [`ErrorKind::Io`]:
/// both mean the bytes on the source cannot be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Signature,
    Io,
    AlreadyOpen,
    NotOpen,
    IndexOutOfBounds,
    InvalidArgument,
    NotSupported,
    InvalidRange,
    InvalidOffset,
    Locked,
    NotFound,
}

/// User-facing split of error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Bad usage: the calling code must change
    Usage,
    /// Not found or not a match: the input must change
    NoMatch,
    /// I/O problem: retry or report
    Io,
    /// Feature gap, not a bug
    Unsupported,
}

impl ErrorKind {
    /// Map this kind onto the user-facing category
    pub fn category(self) -> ErrorCategory {
        match self {
            ErrorKind::AlreadyOpen
            | ErrorKind::NotOpen
            | ErrorKind::IndexOutOfBounds
            | ErrorKind::InvalidArgument
            | ErrorKind::InvalidRange
            | ErrorKind::InvalidOffset
            | ErrorKind::Locked => ErrorCategory::Usage,
            ErrorKind::Signature | ErrorKind::NotFound => ErrorCategory::NoMatch,
            ErrorKind::Io => ErrorCategory::Io,
            ErrorKind::NotSupported => ErrorCategory::Unsupported,
        }
    }
}

impl Error {
    /// Get the categorical kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::Corrupt(_) | Error::ChecksumVerification(_) => ErrorKind::Io,
            Error::Signature(_) => ErrorKind::Signature,
            Error::AlreadyOpen(_) => ErrorKind::AlreadyOpen,
            Error::NotOpen(_) => ErrorKind::NotOpen,
            Error::IndexOutOfBounds(_) => ErrorKind::IndexOutOfBounds,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::NotSupported(_) => ErrorKind::NotSupported,
            Error::InvalidRange(_) => ErrorKind::InvalidRange,
            Error::InvalidOffset(_) => ErrorKind::InvalidOffset,
            Error::Locked(_) => ErrorKind::Locked,
            Error::NotFound(_) => ErrorKind::NotFound,
        }
    }

    /// Get the user-facing category of this error
    pub fn category(&self) -> ErrorCategory {
        self.kind().category()
    }

    /// Create a signature error
    pub fn signature(msg: impl Into<String>) -> Self {
        Error::Signature(msg.into())
    }

    /// Create a corrupt structure error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }

    /// Create an already open error
    pub fn already_open(msg: impl Into<String>) -> Self {
        Error::AlreadyOpen(msg.into())
    }

    /// Create a not open error
    pub fn not_open(msg: impl Into<String>) -> Self {
        Error::NotOpen(msg.into())
    }

    /// Create an index out of bounds error
    pub fn index_out_of_bounds(msg: impl Into<String>) -> Self {
        Error::IndexOutOfBounds(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Create a not supported error
    pub fn not_supported(msg: impl Into<String>) -> Self {
        Error::NotSupported(msg.into())
    }

    /// Create an invalid range error
    pub fn invalid_range(msg: impl Into<String>) -> Self {
        Error::InvalidRange(msg.into())
    }

    /// Create an invalid offset error
    pub fn invalid_offset(msg: impl Into<String>) -> Self {
        Error::InvalidOffset(msg.into())
    }

    /// Create a locked error
    pub fn locked(msg: impl Into<String>) -> Self {
        Error::Locked(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }
}
