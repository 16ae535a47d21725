//! Error types and handling
//!
//! Common error types used across the capture pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pipeline-wide error type
#[derive(Error, Debug)]
pub enum CaptureError {
    /// An operation was issued in a state that does not allow it
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Camera or microphone could not be opened or stopped delivering data
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Codec error: {0}")]
    Codec(String),

    /// Write or finalize failure inside the container writer
    #[error("Muxer I/O error: {0}")]
    MuxerIo(String),

    #[error("Unknown track id: {0}")]
    BadTrack(u32),

    #[error("No segments to stitch")]
    NoSegments,

    #[error("Stitch I/O error: {0}")]
    StitchIo(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CaptureError {
    /// Stable machine-readable code, shared with [`ErrorResponse`]
    pub fn code(&self) -> &'static str {
        match self {
            CaptureError::InvalidState(_) => "INVALID_STATE",
            CaptureError::DeviceUnavailable(_) => "DEVICE_UNAVAILABLE",
            CaptureError::Codec(_) => "CODEC_ERROR",
            CaptureError::MuxerIo(_) => "MUXER_IO",
            CaptureError::BadTrack(_) => "BAD_TRACK",
            CaptureError::NoSegments => "NO_SEGMENTS",
            CaptureError::StitchIo(_) => "STITCH_IO",
            CaptureError::Io(_) => "IO_ERROR",
            CaptureError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

/// Error response for the UI layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<&CaptureError> for ErrorResponse {
    fn from(error: &CaptureError) -> Self {
        ErrorResponse {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

impl From<CaptureError> for ErrorResponse {
    fn from(error: CaptureError) -> Self {
        ErrorResponse::from(&error)
    }
}

/// Result type alias using CaptureError
pub type CaptureResult<T> = Result<T, CaptureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_carries_code_and_message() {
        let response = ErrorResponse::from(CaptureError::BadTrack(7));
        assert_eq!(response.code, "BAD_TRACK");
        assert_eq!(response.message, "Unknown track id: 7");
    }

    #[test]
    fn test_io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: CaptureError = io.into();
        assert_eq!(err.code(), "IO_ERROR");
    }
}
