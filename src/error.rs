//! Error types for the capture frame pipeline

use thiserror::Error;

/// Result type alias using CaptureError
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Everything that can go wrong between device discovery and frame delivery.
///
/// Errors raised on the real-time path (`FormatMismatch`, `StaleFrame` on the
/// producer side) never reach consumers; they are counted and the frame is
/// dropped.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The requested device id is not present (anymore)
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// `start` was called on a session that is not idle
    #[error("Capture session is already active")]
    AlreadyActive,

    /// Graph construction, negotiation or the backend refused to run
    #[error("Capture start failed: {reason}")]
    CaptureStartFailed { reason: String },

    /// The producer delivered a buffer that does not match the negotiated format
    #[error("Frame size mismatch: expected {expected} bytes, got {actual}")]
    FormatMismatch { expected: usize, actual: usize },

    /// The session has been stopped and its frame stream closed
    #[error("Capture session stopped")]
    SessionStopped,

    /// The ring slot behind this handle was recycled for a newer frame
    #[error("Frame {sequence} is no longer available")]
    StaleFrame { sequence: u64 },

    /// Every ring slot is referenced and the oldest one is being read right now
    #[error("No ring slot available for a new frame")]
    SlotBusy,

    /// Native backend error outside of `start`
    #[error("Backend error: {0}")]
    Backend(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl CaptureError {
    pub fn start_failed(reason: impl Into<String>) -> Self {
        CaptureError::CaptureStartFailed {
            reason: reason.into(),
        }
    }

    pub fn backend(msg: impl std::fmt::Display) -> Self {
        CaptureError::Backend(msg.to_string())
    }

    /// Errors that only mean "this one frame was dropped".
    pub fn is_frame_drop(&self) -> bool {
        matches!(
            self,
            CaptureError::FormatMismatch { .. }
                | CaptureError::StaleFrame { .. }
                | CaptureError::SlotBusy
        )
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(e: std::io::Error) -> Self {
        CaptureError::Backend(e.to_string())
    }
}
