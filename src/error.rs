//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failure that can occur while preparing a scan, talking to the
//! remote hardware controller and decoding what comes back.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`**: Invalid scan parameters (unknown turnaround name, unachievable
//!   turn length, bad settings values). Always raised before any I/O is attempted.
//! - **`Transport`**: A socket operation against the hardware controller failed
//!   (connect refused, write failed, bind failed). The exchange is aborted, never retried.
//! - **`Timeout`**: A deadline elapsed (connect, accept, idle read). The caller may re-issue.
//! - **`Decode`**: The raw sample payload does not fit the scan geometry. Wraps
//!   [`DecodeError`], which names the buffer index that overran.
//! - **`Protocol`**: The controller answered, but with something we cannot use.
//!
//! Voltage saturation is not an error: it is reported as data on a successful waveform set.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Every failure the crate reports.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Settings file or environment could not be extracted
    #[error("Configuration load error: {0}")]
    Config(#[from] figment::Error),

    /// Invalid parameter, raised before any I/O
    #[error("Configuration error in '{field}': {reason}")]
    Configuration { field: String, reason: String },

    /// Local filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed zip archive
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// Socket operation against the controller failed
    #[error("Transport error during {operation} with {address}: {source}")]
    Transport {
        operation: &'static str,
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// A connect, accept or read deadline elapsed
    #[error("Timed out after {waited:?} during {operation} on {address}")]
    Timeout {
        operation: &'static str,
        address: SocketAddr,
        waited: Duration,
    },

    /// Sample payload does not fit the scan geometry
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The controller answered with something unusable
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl DaqError {
    /// Shorthand for a configuration error on a named field.
    pub fn configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        DaqError::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// True for the errors a caller can reasonably retry by issuing the request again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DaqError::Timeout { .. } | DaqError::Transport { .. })
    }
}

/// Failures while turning raw ADC samples back into frames.
///
/// A decode error discards every frame decoded so far; partial stacks are never returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error(
        "cursor overrun in frame {frame}, row {row}: needed samples up to index {needed} but buffer holds {available}"
    )]
    CursorOverrun {
        frame: usize,
        row: usize,
        needed: usize,
        available: usize,
    },

    #[error("lag of {lag_pixels} pixels moves the read cursor before the start of the buffer")]
    NegativeCursor { lag_pixels: i64 },

    #[error("archive entry '{0}' not found")]
    MissingEntry(String),

    #[error("descriptor parameter '{0}' missing")]
    MissingParameter(String),

    #[error("descriptor parameter '{key}' has invalid value '{value}'")]
    InvalidParameter { key: String, value: String },

    #[error("archive contains no ADC channels to decode")]
    NoChannels,

    #[error("cannot infer element type of '{name}': {reason}")]
    ElementType { name: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::configuration("bidirends", "unknown turnaround 'wiggle'");
        assert_eq!(
            err.to_string(),
            "Configuration error in 'bidirends': unknown turnaround 'wiggle'"
        );
    }

    #[test]
    fn test_decode_error_wraps() {
        let err: DaqError = DecodeError::CursorOverrun {
            frame: 0,
            row: 1,
            needed: 1040,
            available: 1000,
        }
        .into();
        assert!(err.to_string().contains("index 1040"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_timeout_is_retryable() {
        let err = DaqError::Timeout {
            operation: "accept",
            address: "127.0.0.1:5001".parse().unwrap(),
            waited: Duration::from_secs(2),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("accept"));
    }
}
