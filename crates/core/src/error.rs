// SPDX-FileCopyrightText: © 2026 TSRec Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for the recording engine.
//!
//! All errors implement `Display` and can be converted from `String` for
//! call sites that only have a message to report.

use thiserror::Error;

/// Main error type for recording operations.
///
/// Each variant maps to a distinct failure domain so callers can decide
/// whether to abort the current segment, skip one tick, or surface the
/// problem to the API layer.
#[derive(Debug, Error)]
pub enum RecError {
    /// Configuration or parameter validation error.
    ///
    /// Examples:
    /// - Unparseable `recording.max_total_size` value
    /// - Recording root path that cannot be created
    #[error("Configuration error: {0}")]
    Config(String),

    /// Opus encoder error.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Ogg muxer invariant violation (impossible lacing, oversized packet).
    ///
    /// Fatal to the current segment but never to the engine.
    #[error("Muxer error: {0}")]
    Muxer(String),

    /// Recording index (database) error.
    #[error("Index error: {0}")]
    Index(String),

    /// I/O error (segment files, waveform sidecars, directory scans).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Runtime processing error during normal operation.
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Convenience type alias for Results using `RecError`.
pub type Result<T> = std::result::Result<T, RecError>;

impl From<RecError> for String {
    fn from(err: RecError) -> Self {
        err.to_string()
    }
}

// Generic string errors default to the Runtime domain.
impl From<String> for RecError {
    fn from(s: String) -> Self {
        Self::Runtime(s)
    }
}

impl From<&str> for RecError {
    fn from(s: &str) -> Self {
        Self::Runtime(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RecError::Config("invalid quota".to_string());
        assert_eq!(err.to_string(), "Configuration error: invalid quota");

        let err = RecError::Muxer("lacing overflow".to_string());
        assert_eq!(err.to_string(), "Muxer error: lacing overflow");
    }

    #[test]
    fn test_string_to_error_conversion() {
        let err: RecError = "tick failed".into();
        assert_eq!(err.to_string(), "Runtime error: tick failed");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such segment");
        let err: RecError = io_err.into();
        assert!(err.to_string().contains("I/O error"));
        assert!(err.to_string().contains("no such segment"));
    }
}
