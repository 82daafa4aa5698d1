//! Error types for vidreq

use std::fmt;
use thiserror::Error;

/// Result type alias for vidreq operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for vidreq
///
/// The device-facing variants (`OperationFailed`, `DecodingError`,
/// `UnsupportedBufferType`, `UnsupportedFormat`, `AllocationFailed`) form a
/// closed taxonomy: everything a completed or rejected hardware operation can
/// report maps onto one of them before it reaches the caller.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic device/ioctl failure
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    /// Hardware reported a bitstream-level problem; the picture may be
    /// partially valid but must not be read
    #[error("Decoding error: {0}")]
    DecodingError(String),

    /// The device rejected the buffer type for this queue
    #[error("Unsupported buffer type: {0}")]
    UnsupportedBufferType(String),

    /// The device rejected the requested format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Buffer or entry allocation failed
    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    /// No free transaction became available within the acquire bound
    #[error("Transaction pool exhausted: no free transaction within {0:?}")]
    PoolTimeout(std::time::Duration),

    /// Unsupported control id
    #[error("Unsupported control: {0:#x}")]
    UnsupportedControl(u32),

    /// Control payload size does not match what the device expects
    #[error("Control {id:#x} size mismatch: expected {expected}, got {got}")]
    ControlSize { id: u32, expected: usize, got: usize },

    /// Operation attempted in a state that does not permit it
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Create an operation-failed error
    pub fn operation<S: Into<String>>(msg: S) -> Self {
        Error::OperationFailed(msg.into())
    }

    /// Create a decoding error
    pub fn decoding<S: Into<String>>(msg: S) -> Self {
        Error::DecodingError(msg.into())
    }

    /// Create an unsupported-format error
    pub fn unsupported_format<S: Into<String>>(msg: S) -> Self {
        Error::UnsupportedFormat(msg.into())
    }

    /// Create an unsupported-buffer-type error
    pub fn unsupported_buffer<S: Into<String>>(msg: S) -> Self {
        Error::UnsupportedBufferType(msg.into())
    }

    /// Create an allocation error
    pub fn allocation<S: Into<String>>(msg: S) -> Self {
        Error::AllocationFailed(msg.into())
    }

    /// Create an invalid-state error
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Create an invalid-input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create an error from the current `errno` value, tagged with the
    /// operation that produced it
    pub fn from_errno(op: &str) -> Self {
        let err = std::io::Error::last_os_error();
        Error::OperationFailed(format!("{}: {}", op, err))
    }

    /// Whether this error is fatal to the decode session
    ///
    /// Transient conditions (pool exhaustion, allocation failure, per-frame
    /// decode errors) may be retried or skipped by the caller; format and
    /// buffer-type rejections require a full reinitialization.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedFormat(_) | Error::UnsupportedBufferType(_)
        )
    }
}

/// Completion status of a destination buffer, as reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Decode finished, data is valid
    Success,
    /// Device-level failure, data is invalid
    OperationFailed,
    /// Bitstream-level decode error, data must not be read
    DecodingError,
}

impl CompletionStatus {
    /// Convert a completion status into a `Result`, naming the entry it
    /// belongs to in the error message
    pub fn into_result(self, what: &str) -> Result<()> {
        match self {
            CompletionStatus::Success => Ok(()),
            CompletionStatus::OperationFailed => {
                Err(Error::operation(format!("{} completed with error", what)))
            }
            CompletionStatus::DecodingError => {
                Err(Error::decoding(format!("{} reported a decode error", what)))
            }
        }
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompletionStatus::Success => "success",
            CompletionStatus::OperationFailed => "operation-failed",
            CompletionStatus::DecodingError => "decoding-error",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::unsupported_format("NV12 not offered by device");
        assert!(err.to_string().contains("NV12"));
        assert!(err.is_session_fatal());

        let err = Error::allocation("dmabuf grow failed");
        assert!(!err.is_session_fatal());
    }

    #[test]
    fn test_completion_status_mapping() {
        assert!(CompletionStatus::Success.into_result("dst").is_ok());
        assert!(matches!(
            CompletionStatus::DecodingError.into_result("dst"),
            Err(Error::DecodingError(_))
        ));
        assert!(matches!(
            CompletionStatus::OperationFailed.into_result("dst"),
            Err(Error::OperationFailed(_))
        ));
    }
}
