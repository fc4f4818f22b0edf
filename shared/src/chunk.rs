//! Chunk and region coordinates, and chunk content fingerprints.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

/// Chunks per region edge
pub const REGION_SIZE: i32 = 32;

/// Length of a chunk fingerprint (SHA-1 digest)
pub const FINGERPRINT_LEN: usize = 20;

/// Region coordinate containing the given chunk coordinate.
///
/// Rounds toward negative infinity, so chunk -1 lies in region -1, not 0.
pub fn region_of(chunk: i32) -> i32 {
    chunk.div_euclid(REGION_SIZE)
}

/// Position of a chunk in a world
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}

impl ChunkPos {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    pub fn region(&self) -> RegionPos {
        RegionPos {
            x: region_of(self.x),
            z: region_of(self.z),
        }
    }
}

/// Position of a 32x32 block of chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionPos {
    pub x: i32,
    pub z: i32,
}

impl RegionPos {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    pub fn contains(&self, chunk: ChunkPos) -> bool {
        chunk.region() == *self
    }
}

/// Content hash of a chunk's encoded map data.
///
/// Two chunks with equal fingerprints are treated as identical.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkFingerprint(pub [u8; FINGERPRINT_LEN]);

impl ChunkFingerprint {
    /// Fingerprints an encoded chunk payload
    pub fn of(payload: &[u8]) -> Self {
        Self(Sha1::digest(payload).into())
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }
}

impl fmt::Debug for ChunkFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkFingerprint({})", hex::encode(self.0))
    }
}

impl fmt::Display for ChunkFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_of_floors_negative_coordinates() {
        let cases = [(-33, -2), (-32, -1), (-1, -1), (0, 0), (31, 0), (32, 1)];

        for (chunk, region) in cases {
            assert_eq!(region_of(chunk), region, "chunk {}", chunk);
        }
    }

    #[test]
    fn test_region_of_extremes() {
        assert_eq!(region_of(i32::MIN), i32::MIN / 32);
        assert_eq!(region_of(i32::MAX), i32::MAX / 32);
    }

    #[test]
    fn test_chunk_pos_region() {
        let chunk = ChunkPos::new(-1, 40);
        assert_eq!(chunk.region(), RegionPos::new(-1, 1));
        assert!(RegionPos::new(-1, 1).contains(chunk));
        assert!(!RegionPos::new(0, 1).contains(chunk));
    }

    #[test]
    fn test_fingerprint_is_sha1_of_payload() {
        let fingerprint = ChunkFingerprint::of(b"abc");
        assert_eq!(
            fingerprint.to_string(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(fingerprint, ChunkFingerprint::of(b"abc"));
        assert_ne!(fingerprint, ChunkFingerprint::of(b"abd"));
    }
}
