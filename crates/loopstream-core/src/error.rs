//! Error types for loopstream.

use thiserror::Error;

/// Result type alias using loopstream's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for loopstream.
#[derive(Error, Debug)]
pub enum Error {
    // Stream lifecycle errors
    #[error("Failed to open stream: {0}")]
    Open(String),

    #[error("Decoder sample rate {native} Hz does not match required output rate {required} Hz")]
    SampleRateMismatch { native: u32, required: u32 },

    #[error("Seek failed: {0}")]
    Seek(String),

    #[error("No stream is open")]
    NotOpen,

    // Audio errors
    #[error("Audio decode error: {0}")]
    Decode(String),

    #[error("Audio output error: {0}")]
    AudioOutput(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Engine is not running")]
    EngineClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if this error ends the stream it occurred on.
    ///
    /// Seek failures leave the stream playable at its previous position.
    pub const fn is_fatal_to_stream(&self) -> bool {
        matches!(
            self,
            Self::Open(_)
                | Self::SampleRateMismatch { .. }
                | Self::Configuration(_)
                | Self::Decode(_)
        )
    }

    /// Returns true if this is a configuration problem rather than a media problem.
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::SampleRateMismatch { .. } | Self::Configuration(_))
    }
}
