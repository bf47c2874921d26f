//! Error types for the playback engine
//!
//! Defines engine-specific error types using thiserror for clear error
//! propagation.
//!
//! Fatality is a property of where an error surfaces, not of the variant
//! alone: `FormatUnsupported` at prepare time and `DecodeFailed` after its
//! single transient retry move the track to `Failed`; `SeekFailed` never
//! does.

use thiserror::Error;

/// Main error type for the playback engine
#[derive(Error, Debug)]
pub enum Error {
    /// No conversion path exists between the source format and the output
    /// device format, or the source could not be probed at all
    #[error("Unsupported format: {0}")]
    FormatUnsupported(String),

    /// Audio decoding failed after the permitted transient retry
    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    /// A seek could not be completed; the pre-seek position is kept
    #[error("Seek failed: {0}")]
    SeekFailed(String),

    /// Audio output device errors
    #[error("Audio output error: {0}")]
    AudioOutput(String),

    /// Operation not valid in the current transport state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration loading or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type using the engine Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::FormatUnsupported("7.1 DSD".to_string());
        assert_eq!(e.to_string(), "Unsupported format: 7.1 DSD");

        let e = Error::SeekFailed("target beyond end".to_string());
        assert!(e.to_string().starts_with("Seek failed"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let e: Error = io.into();
        assert!(matches!(e, Error::Io(_)));
    }
}
