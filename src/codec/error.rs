//! Error types for the framing layer.
//!
//! Malformed records are not errors here: the stream decoder yields them as
//! [`Decoded::Malformed`](super::Decoded::Malformed) so one bad message never
//! ends the stream. Only conditions that make further decoding impossible
//! surface as [`CodecError`].

use std::io;

use thiserror::Error;

/// Errors that stop a stream decoder or encoder.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Buffered data without a delimiter exceeded the configured limit.
    #[error("record exceeds max length: {size} > {max}")]
    Oversized { size: usize, max: usize },

    /// The envelope could not be serialized.
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),

    /// I/O error from the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Reasons a single frame is rejected.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The frame is not valid JSON or not a valid envelope.
    #[error("could not parse incoming message: {0}")]
    Malformed(String),

    /// The frame is valid JSON but lacks the protocol marker.
    #[error("message is not a protocol envelope")]
    Foreign,
}

impl From<CodecError> for io::Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
