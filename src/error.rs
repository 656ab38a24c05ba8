use std::time::Duration;

use thiserror::Error;

/// Error taxonomy for the upscaling pipeline.
///
/// The distinction that matters to callers: `Transient` is retryable,
/// `Timeout` means we gave up waiting (as opposed to the backend saying no),
/// and everything else is deterministic.
#[derive(Debug, Error)]
pub enum UpscaleError {
    #[error("planning failed: {0}")]
    Planning(String),

    #[error("image decode failed: {0}")]
    Decode(String),

    #[error("transient backend error: {0}")]
    Transient(String),

    #[error("backend rejected request: {0}")]
    Backend(String),

    #[error("stitch failed: {0}")]
    Stitch(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid job state: {0}")]
    InvalidState(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("job not found: {0}")]
    NotFound(String),
}

impl UpscaleError {
    /// Whether a retry with the same inputs could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, UpscaleError::Transient(_))
    }
}
