//! Shared utilities

pub mod clock;
pub mod error;

pub use error::{CaptureError, CaptureResult, ErrorResponse};
