//! Error taxonomy for the relay server.
//!
//! Every [`SessionError`] ends the connection it was raised on. Storage
//! errors are handled at their call sites: swallowed for uploads, returned
//! to the caller for catch-up queries.

use shared::{CipherError, CodecError};
use thiserror::Error;

/// Errors splitting the byte stream into frames.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors in the encryption handshake and identity verification.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("rsa error: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("could not encode public key: {0}")]
    KeyEncoding(String),

    #[error("identity service request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("identity service answered with status {0}")]
    UnexpectedStatus(u16),

    #[error("{username} has not joined with this server id")]
    NotJoined { username: String },

    #[error("invalid shared secret: {0}")]
    Cipher(#[from] CipherError),
}

/// Errors from the chunk store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

/// Errors loading or saving the JSON files in the data directory.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("{path}: {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },
}

/// Reasons a connection gets kicked.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("malformed packet: {0}")]
    Codec(#[from] CodecError),

    #[error("packet {packet} not accepted while {state}")]
    UnexpectedPacket {
        packet: &'static str,
        state: &'static str,
    },

    #[error("{event} not expected while {state}")]
    UnexpectedEvent {
        event: &'static str,
        state: &'static str,
    },

    #[error("data received while identity verification was outstanding")]
    DataDuringVerification,

    #[error("unsupported game address {0:?}")]
    GameAddressMismatch(String),

    #[error("verify token mismatch")]
    VerifyTokenMismatch,

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("{name} ({uuid}) is not whitelisted")]
    NotAllowed { name: String, uuid: String },

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level failure of the listener
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("auth setup failed: {0}")]
    Auth(#[from] AuthError),

    #[error("storage setup failed: {0}")]
    Storage(#[from] StorageError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}
