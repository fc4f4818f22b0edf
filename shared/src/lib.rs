//! Wire protocol shared by the map sync server and its clients.
//!
//! - [`codec`]: cursor reader/writer for packet bodies
//! - [`packets`]: the tagged packet catalog for both directions
//! - [`chunk`]: chunk/region coordinates and content fingerprints
//! - [`cipher`]: the AES-128/CFB8 transport cipher used after the handshake
//!
//! Framing is a `u32` big-endian length followed by the packet body. After
//! the handshake the body (never the length prefix) is passed through the
//! connection's [`cipher::StreamCipher`].

pub mod chunk;
pub mod cipher;
pub mod codec;
pub mod error;
pub mod packets;

pub use chunk::{region_of, ChunkFingerprint, ChunkPos, RegionPos, FINGERPRINT_LEN, REGION_SIZE};
pub use cipher::{StreamCipher, SHARED_SECRET_LEN};
pub use codec::{PacketReader, PacketWriter};
pub use error::{CipherError, CodecError};
pub use packets::{ClientboundPacket, ServerboundPacket};

/// Size of the frame length prefix
pub const FRAME_HEADER_LEN: usize = 4;

/// Default upper bound on a declared frame length (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1 << 24;

/// Prefixes a packet body with its `u32` big-endian length
pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
    framed.extend_from_slice(body);
    framed
}
