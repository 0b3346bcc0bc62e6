//! Storage and copy error types.

use thiserror::Error;

/// Backend error codes.
///
/// Every code maps onto a POSIX errno so that callers which only understand
/// integer result codes can still distinguish the benign cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Object, snapshot or image does not exist.
    NotFound,
    /// Generic I/O failure reported by a backend.
    Io,
    /// Resource is busy (e.g. lock release with ops in flight).
    Busy,
    /// Malformed request or missing in-memory state.
    InvalidArgument,
    /// Exclusive lock is not held, writes are refused.
    ReadOnly,
    /// Snapshot sequence assertion failed.
    OutOfRange,
    /// Client was blocklisted by the cluster.
    Blocklisted,
    /// Unexpected internal failure.
    Internal,
}

impl ErrorCode {
    /// Returns the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NotFound",
            ErrorCode::Io => "Io",
            ErrorCode::Busy => "Busy",
            ErrorCode::InvalidArgument => "InvalidArgument",
            ErrorCode::ReadOnly => "ReadOnly",
            ErrorCode::OutOfRange => "OutOfRange",
            ErrorCode::Blocklisted => "Blocklisted",
            ErrorCode::Internal => "Internal",
        }
    }

    /// Returns the (positive) errno for this code.
    pub fn errno(&self) -> i32 {
        match self {
            ErrorCode::NotFound => 2,
            ErrorCode::Io => 5,
            ErrorCode::Busy => 16,
            ErrorCode::InvalidArgument => 22,
            ErrorCode::ReadOnly => 30,
            ErrorCode::OutOfRange => 34,
            ErrorCode::Blocklisted => 108,
            ErrorCode::Internal => 5,
        }
    }

    /// Maps a (positive or negative) errno back onto a code.
    pub fn from_errno(errno: i32) -> Self {
        match errno.abs() {
            2 => ErrorCode::NotFound,
            5 => ErrorCode::Io,
            16 => ErrorCode::Busy,
            22 => ErrorCode::InvalidArgument,
            30 => ErrorCode::ReadOnly,
            34 => ErrorCode::OutOfRange,
            108 => ErrorCode::Blocklisted,
            _ => ErrorCode::Internal,
        }
    }

    /// Returns the default message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "No such file or directory",
            ErrorCode::Io => "Input/output error",
            ErrorCode::Busy => "Device or resource busy",
            ErrorCode::InvalidArgument => "Invalid argument",
            ErrorCode::ReadOnly => "Read-only file system",
            ErrorCode::OutOfRange => "Numerical result out of range",
            ErrorCode::Blocklisted => "Client is blocklisted",
            ErrorCode::Internal => "Internal error",
        }
    }
}

/// Storage error with code and message.
#[derive(Debug, Clone, Error)]
#[error("{code:?}: {message}")]
pub struct StorageError {
    pub code: ErrorCode,
    pub message: String,
}

impl StorageError {
    /// Creates a new storage error with the given code and default message.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            message: code.default_message().to_string(),
            code,
        }
    }

    /// Creates a new storage error with a custom message.
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Negative errno, the way it is reported to completion callbacks.
    pub fn result_code(&self) -> i32 {
        -self.code.errno()
    }
}

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Failure of a single object copy request.
#[derive(Debug, Clone, Error)]
pub enum CopyError {
    #[error("failed to list snaps: {0}")]
    ListSnaps(StorageError),

    #[error("failed to read from source object: {0}")]
    Read(StorageError),

    #[error("failed to write to destination object: {0}")]
    Write(StorageError),

    #[error("lost exclusive lock: {0}")]
    LockLost(StorageError),

    #[error("object map is not initialized")]
    ObjectMapUnavailable,

    #[error("failed to update object map: {0}")]
    ObjectMapUpdate(StorageError),

    /// The object had nothing to copy. Reported as `-ENOENT`, which the
    /// image-level copier treats as a skipped object rather than a failure.
    #[error("nothing to copy")]
    NothingToCopy,

    /// The request was dropped before it completed.
    #[error("copy request aborted")]
    Aborted,
}

impl CopyError {
    /// Negative errno for the completion callback.
    pub fn result_code(&self) -> i32 {
        match self {
            CopyError::ListSnaps(e)
            | CopyError::Read(e)
            | CopyError::Write(e)
            | CopyError::LockLost(e)
            | CopyError::ObjectMapUpdate(e) => e.result_code(),
            CopyError::ObjectMapUnavailable => -ErrorCode::InvalidArgument.errno(),
            CopyError::NothingToCopy => -ErrorCode::NotFound.errno(),
            CopyError::Aborted => -ErrorCode::Io.errno(),
        }
    }

    pub fn is_nothing_to_copy(&self) -> bool {
        matches!(self, CopyError::NothingToCopy)
    }
}

/// Result of an object copy request.
pub type CopyResult<T = ()> = Result<T, CopyError>;

/// Failure to load or replay a scenario file.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to read scenario: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed scenario: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid scenario: {0}")]
    Invalid(String),

    #[error("scenario step {step} failed: {source}")]
    Step { step: usize, source: StorageError },
}

/// Collapses a copy result into the integer code handed to callers.
pub fn result_code(result: &CopyResult) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.result_code(),
    }
}
