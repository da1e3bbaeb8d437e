//! Error types for the record codec.

use std::io;
use thiserror::Error;

/// Codec result type
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors from encoding or decoding a record stream.
///
/// Everything except [`CodecError::Io`] on the write side means the bytes on
/// disk cannot be trusted past the reported offset.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid record magic at offset {offset}")]
    InvalidMagic { offset: u64 },

    #[error("truncated record at offset {offset}: {reason}")]
    Truncated { offset: u64, reason: &'static str },

    #[error("record at offset {offset} declares {length} bytes, maximum is {max}")]
    FrameTooLarge { offset: u64, length: usize, max: usize },

    #[error("checksum mismatch at offset {offset}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { offset: u64, expected: u32, actual: u32 },

    #[error("record at offset {offset} does not decode: {source}")]
    Payload {
        offset: u64,
        #[source]
        source: serde_json::Error,
    },

    #[error("value does not encode: {0}")]
    Encode(#[source] serde_json::Error),
}

impl CodecError {
    /// True when the error describes damaged bytes rather than a failing device.
    pub fn is_corruption(&self) -> bool {
        !matches!(self, Self::Io(_) | Self::Encode(_))
    }
}
