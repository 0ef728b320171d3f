//! Error taxonomy for the conversation pipeline.
//!
//! Auxiliary failures (cache, link probes, suggestion fetches) degrade
//! gracefully. Upstream failures are converted by the pipeline into a
//! spoken fallback phrase, never a dropped stream.

use thiserror::Error;

/// Result type alias for core pipeline operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the streaming conversation core
#[derive(Error, Debug)]
pub enum CoreError {
    /// Upstream LLM/TTS/STT returned non-success or was unreachable.
    #[error("upstream service error ({service}): {detail}")]
    Upstream { service: &'static str, detail: String },

    /// A malformed upstream event frame. Logged and skipped, never fatal.
    #[error("parse error: {0}")]
    Parse(String),

    /// Key-value store unavailable. Pipeline proceeds without caching.
    #[error("cache error: {0}")]
    Cache(String),

    /// An upstream exchange exceeded its deadline.
    #[error("timeout in {0}")]
    Timeout(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CoreError::Timeout("http request")
        } else {
            CoreError::Upstream {
                service: "http",
                detail: err.to_string(),
            }
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Parse(err.to_string())
    }
}
