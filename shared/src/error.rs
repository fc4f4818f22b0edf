//! Error types for the wire protocol.

use thiserror::Error;

/// Errors raised while reading or writing packet bodies.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// A read needed more bytes than the buffer has left
    #[error("read past end of buffer: needed {needed} bytes, {remaining} remaining")]
    OutOfBounds { needed: usize, remaining: usize },

    /// A length-prefixed string was not valid UTF-8
    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    /// A list count decoded as a negative number
    #[error("negative list length {0}")]
    NegativeLength(i64),

    /// The tag byte does not name any serverbound/clientbound packet
    #[error("unknown packet tag {tag} in {frame_len} byte frame")]
    UnknownTag { tag: u8, frame_len: usize },

    /// `restore_offset` was called without a matching `save_offset`
    #[error("offset stack is empty")]
    OffsetStackEmpty,
}

/// Errors raised when setting up the stream cipher.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("shared secret must be {expected} bytes, got {actual}")]
    InvalidSecretLength { expected: usize, actual: usize },
}
