//! Error types for downloaders and the download index.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error raised by a downloader while fetching or removing content.
///
/// Designed to be serializable across process boundaries, so I/O errors are
/// captured as kind + message strings instead of wrapping `std::io::Error`.
#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum DownloadError {
    /// I/O error during file operations.
    #[error("I/O error ({kind}): {message}")]
    Io {
        /// The kind of I/O error (e.g. "NotFound", "PermissionDenied").
        kind: String,
        /// Detailed error message.
        message: String,
    },

    /// Network error while transferring bytes.
    #[error("network error: {message}")]
    Network {
        /// Detailed error message.
        message: String,
        /// HTTP status code if one was received.
        #[serde(skip_serializing_if = "Option::is_none")]
        status_code: Option<u16>,
    },

    /// The transfer was cancelled.
    #[error("download cancelled")]
    Cancelled,

    /// Uncategorized error.
    #[error("{message}")]
    Other {
        /// Error message.
        message: String,
    },
}

impl DownloadError {
    /// Create an I/O error from kind and message strings.
    pub fn io(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Io {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Create an I/O error from a `std::io::Error`.
    #[must_use]
    pub fn from_io_error(err: &std::io::Error) -> Self {
        Self::Io {
            kind: format!("{:?}", err.kind()),
            message: err.to_string(),
        }
    }

    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            status_code: None,
        }
    }

    /// Create a network error with an HTTP status code.
    pub fn network_with_status(message: impl Into<String>, status_code: u16) -> Self {
        Self::Network {
            message: message.into(),
            status_code: Some(status_code),
        }
    }

    /// Create a generic error.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Check if this is a cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Everything except cancellation is worth retrying with backoff.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

/// Convenience result type for downloader operations.
pub type DownloadResult<T> = Result<T, DownloadError>;

/// Error raised by the download index.
///
/// The manager logs and swallows these; in-memory state stays authoritative
/// until the next successful commit.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The underlying storage failed.
    #[error("index storage error: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_from_std() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = DownloadError::from_io_error(&io_err);

        match err {
            DownloadError::Io { kind, message } => {
                assert_eq!(kind, "NotFound");
                assert!(message.contains("file not found"));
            }
            other => panic!("expected Io variant, got {other:?}"),
        }
    }

    #[test]
    fn error_serialization_round_trip() {
        let err = DownloadError::network_with_status("timeout", 408);
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("408"));

        let parsed: DownloadError = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, err);
    }

    #[test]
    fn recoverability() {
        assert!(DownloadError::network("timeout").is_recoverable());
        assert!(DownloadError::io("Interrupted", "read failed").is_recoverable());
        assert!(!DownloadError::Cancelled.is_recoverable());
        assert!(DownloadError::Cancelled.is_cancelled());
    }
}
