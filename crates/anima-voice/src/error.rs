//! Error types for the voice layer.

use thiserror::Error;

pub type SpeechResult<T> = Result<T, SpeechError>;

#[derive(Error, Debug)]
pub enum SpeechError {
    /// Upload failed validation (extension, encoding). Maps to a 4xx.
    #[error("invalid audio upload: {0}")]
    InvalidAudio(String),

    /// Upload exceeds the configured byte limit.
    #[error("audio too large: {size} bytes (limit {max})")]
    TooLarge { size: usize, max: usize },

    /// A synthesis or transcription backend failed or was unreachable.
    #[error("{provider} backend error: {detail}")]
    Backend {
        provider: &'static str,
        detail: String,
    },

    /// ffmpeg post-processing failed.
    #[error("transcode failed: {0}")]
    Transcode(String),

    /// A provider name in configuration matched no known backend.
    #[error("unknown synthesis provider: {0}")]
    UnknownProvider(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] anima_core::CoreError),
}

impl From<reqwest::Error> for SpeechError {
    fn from(err: reqwest::Error) -> Self {
        SpeechError::Backend {
            provider: "http",
            detail: err.to_string(),
        }
    }
}
