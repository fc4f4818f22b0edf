//! Packet catalog: every message exchanged between the mod and the server.
//!
//! Each packet body starts with a one-byte tag. Packets are grouped by
//! direction into [`ServerboundPacket`] (client → server) and
//! [`ClientboundPacket`] (server → client); `ChunkData` appears in both.
//! Both directions can be encoded and decoded so that test clients and
//! tooling speak the same catalog as the server.

use crate::chunk::{ChunkFingerprint, ChunkPos, FINGERPRINT_LEN};
use crate::codec::{PacketReader, PacketWriter};
use crate::error::CodecError;

/// Stable one-byte packet tags. Zero is reserved.
pub mod tag {
    pub const HANDSHAKE: u8 = 1;
    pub const ENCRYPTION_REQUEST: u8 = 2;
    pub const ENCRYPTION_RESPONSE: u8 = 3;
    pub const CHUNK_DATA: u8 = 4;
    pub const REGION_CATCHUP_RESPONSE: u8 = 5;
    pub const CHUNK_CATCHUP_REQUEST: u8 = 6;
    pub const REGION_TIMESTAMPS: u8 = 7;
    pub const REGION_CATCHUP_REQUEST: u8 = 8;
}

/// A packet body that knows its tag and field layout
pub trait PacketBody: Sized {
    const TAG: u8;
    const NAME: &'static str;

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, CodecError>;
    fn write(&self, writer: &mut PacketWriter);
}

/// First packet a client sends after connecting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub mod_version: String,
    pub username: String,
    pub game_address: String,
    pub world: String,
}

impl PacketBody for Handshake {
    const TAG: u8 = tag::HANDSHAKE;
    const NAME: &'static str = "Handshake";

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            mod_version: reader.read_string()?,
            username: reader.read_string()?,
            game_address: reader.read_string()?,
            world: reader.read_string()?,
        })
    }

    fn write(&self, writer: &mut PacketWriter) {
        writer.write_string(&self.mod_version);
        writer.write_string(&self.username);
        writer.write_string(&self.game_address);
        writer.write_string(&self.world);
    }
}

/// Server's RSA public key (SPKI DER) and a fresh verify token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionRequest {
    pub public_key: Vec<u8>,
    pub verify_token: Vec<u8>,
}

impl PacketBody for EncryptionRequest {
    const TAG: u8 = tag::ENCRYPTION_REQUEST;
    const NAME: &'static str = "EncryptionRequest";

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            public_key: reader.read_bytes_with_len()?,
            verify_token: reader.read_bytes_with_len()?,
        })
    }

    fn write(&self, writer: &mut PacketWriter) {
        writer.write_bytes_with_len(&self.public_key);
        writer.write_bytes_with_len(&self.verify_token);
    }
}

/// Shared secret and verify token, both RSA-encrypted with the server's key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionResponse {
    pub shared_secret: Vec<u8>,
    pub verify_token: Vec<u8>,
}

impl PacketBody for EncryptionResponse {
    const TAG: u8 = tag::ENCRYPTION_RESPONSE;
    const NAME: &'static str = "EncryptionResponse";

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            shared_secret: reader.read_bytes_with_len()?,
            verify_token: reader.read_bytes_with_len()?,
        })
    }

    fn write(&self, writer: &mut PacketWriter) {
        writer.write_bytes_with_len(&self.shared_secret);
        writer.write_bytes_with_len(&self.verify_token);
    }
}

/// Newest timestamp of one region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionTimestamp {
    pub x: i16,
    pub z: i16,
    pub timestamp: i64,
}

/// Region summary sent right after authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionTimestamps {
    pub world: String,
    pub regions: Vec<RegionTimestamp>,
}

impl PacketBody for RegionTimestamps {
    const TAG: u8 = tag::REGION_TIMESTAMPS;
    const NAME: &'static str = "RegionTimestamps";

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        let world = reader.read_string()?;
        let count = reader.read_count_i16()?;
        let mut regions = Vec::new();
        for _ in 0..count {
            regions.push(RegionTimestamp {
                x: reader.read_i16()?,
                z: reader.read_i16()?,
                timestamp: reader.read_i64()?,
            });
        }
        Ok(Self { world, regions })
    }

    fn write(&self, writer: &mut PacketWriter) {
        let count = self.regions.len().min(i16::MAX as usize);
        writer.write_string(&self.world);
        writer.write_i16(count as i16);
        for region in &self.regions[..count] {
            writer.write_i16(region.x);
            writer.write_i16(region.z);
            writer.write_i64(region.timestamp);
        }
    }
}

/// Region coordinate as carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionCoord {
    pub x: i16,
    pub z: i16,
}

/// Client asks for per-chunk timestamps of the listed regions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionCatchupRequest {
    pub world: String,
    pub regions: Vec<RegionCoord>,
}

impl PacketBody for RegionCatchupRequest {
    const TAG: u8 = tag::REGION_CATCHUP_REQUEST;
    const NAME: &'static str = "RegionCatchupRequest";

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        let world = reader.read_string()?;
        let count = reader.read_count_i16()?;
        let mut regions = Vec::new();
        for _ in 0..count {
            regions.push(RegionCoord {
                x: reader.read_i16()?,
                z: reader.read_i16()?,
            });
        }
        Ok(Self { world, regions })
    }

    fn write(&self, writer: &mut PacketWriter) {
        let count = self.regions.len().min(i16::MAX as usize);
        writer.write_string(&self.world);
        writer.write_i16(count as i16);
        for region in &self.regions[..count] {
            writer.write_i16(region.x);
            writer.write_i16(region.z);
        }
    }
}

/// A chunk coordinate with a timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkTimestamp {
    pub x: i32,
    pub z: i32,
    pub timestamp: u64,
}

impl ChunkTimestamp {
    pub fn pos(&self) -> ChunkPos {
        ChunkPos::new(self.x, self.z)
    }
}

fn read_chunk_timestamps(reader: &mut PacketReader<'_>) -> Result<Vec<ChunkTimestamp>, CodecError> {
    let count = reader.read_count_i32()?;
    let mut chunks = Vec::new();
    for _ in 0..count {
        chunks.push(ChunkTimestamp {
            x: reader.read_i32()?,
            z: reader.read_i32()?,
            timestamp: reader.read_u64()?,
        });
    }
    Ok(chunks)
}

fn write_chunk_timestamps(writer: &mut PacketWriter, chunks: &[ChunkTimestamp]) {
    let count = chunks.len().min(i32::MAX as usize);
    writer.write_i32(count as i32);
    for chunk in &chunks[..count] {
        writer.write_i32(chunk.x);
        writer.write_i32(chunk.z);
        writer.write_u64(chunk.timestamp);
    }
}

/// Current timestamps of every known chunk in the requested regions, newest first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionCatchupResponse {
    pub world: String,
    pub chunks: Vec<ChunkTimestamp>,
}

impl PacketBody for RegionCatchupResponse {
    const TAG: u8 = tag::REGION_CATCHUP_RESPONSE;
    const NAME: &'static str = "RegionCatchupResponse";

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            world: reader.read_string()?,
            chunks: read_chunk_timestamps(reader)?,
        })
    }

    fn write(&self, writer: &mut PacketWriter) {
        writer.write_string(&self.world);
        write_chunk_timestamps(writer, &self.chunks);
    }
}

/// Client asks for the data of chunks it saw listed with these timestamps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkCatchupRequest {
    pub world: String,
    pub chunks: Vec<ChunkTimestamp>,
}

impl PacketBody for ChunkCatchupRequest {
    const TAG: u8 = tag::CHUNK_CATCHUP_REQUEST;
    const NAME: &'static str = "ChunkCatchupRequest";

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            world: reader.read_string()?,
            chunks: read_chunk_timestamps(reader)?,
        })
    }

    fn write(&self, writer: &mut PacketWriter) {
        writer.write_string(&self.world);
        write_chunk_timestamps(writer, &self.chunks);
    }
}

/// One observed chunk. The payload runs to the end of the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkData {
    pub world: String,
    pub x: i32,
    pub z: i32,
    pub timestamp: u64,
    pub format_version: u16,
    pub fingerprint: ChunkFingerprint,
    pub payload: Vec<u8>,
}

impl ChunkData {
    pub fn pos(&self) -> ChunkPos {
        ChunkPos::new(self.x, self.z)
    }
}

impl PacketBody for ChunkData {
    const TAG: u8 = tag::CHUNK_DATA;
    const NAME: &'static str = "ChunkData";

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            world: reader.read_string()?,
            x: reader.read_i32()?,
            z: reader.read_i32()?,
            timestamp: reader.read_u64()?,
            format_version: reader.read_u16()?,
            fingerprint: ChunkFingerprint(reader.read_array::<FINGERPRINT_LEN>()?),
            payload: reader.read_remainder(),
        })
    }

    fn write(&self, writer: &mut PacketWriter) {
        writer.write_string(&self.world);
        writer.write_i32(self.x);
        writer.write_i32(self.z);
        writer.write_u64(self.timestamp);
        writer.write_u16(self.format_version);
        writer.write_raw(self.fingerprint.as_bytes());
        writer.write_raw(&self.payload);
    }
}

fn encode_body<P: PacketBody>(packet: &P) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_u8(P::TAG);
    packet.write(&mut writer);
    writer.into_inner()
}

/// Rewinds to the saved tag position so the error can report the whole frame
fn unknown_tag(reader: &mut PacketReader<'_>, tag: u8) -> CodecError {
    if let Err(err) = reader.restore_offset() {
        return err;
    }
    CodecError::UnknownTag {
        tag,
        frame_len: reader.remaining(),
    }
}

/// Packets the server accepts from clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerboundPacket {
    Handshake(Handshake),
    EncryptionResponse(EncryptionResponse),
    ChunkData(ChunkData),
    ChunkCatchupRequest(ChunkCatchupRequest),
    RegionCatchupRequest(RegionCatchupRequest),
}

impl ServerboundPacket {
    pub fn tag(&self) -> u8 {
        match self {
            Self::Handshake(_) => Handshake::TAG,
            Self::EncryptionResponse(_) => EncryptionResponse::TAG,
            Self::ChunkData(_) => ChunkData::TAG,
            Self::ChunkCatchupRequest(_) => ChunkCatchupRequest::TAG,
            Self::RegionCatchupRequest(_) => RegionCatchupRequest::TAG,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Handshake(_) => Handshake::NAME,
            Self::EncryptionResponse(_) => EncryptionResponse::NAME,
            Self::ChunkData(_) => ChunkData::NAME,
            Self::ChunkCatchupRequest(_) => ChunkCatchupRequest::NAME,
            Self::RegionCatchupRequest(_) => RegionCatchupRequest::NAME,
        }
    }

    /// Decodes one frame body (tag byte + fields)
    pub fn decode(body: &[u8]) -> Result<Self, CodecError> {
        let mut reader = PacketReader::new(body);
        reader.save_offset();
        let packet = match reader.read_u8()? {
            tag::HANDSHAKE => Self::Handshake(Handshake::read(&mut reader)?),
            tag::ENCRYPTION_RESPONSE => {
                Self::EncryptionResponse(EncryptionResponse::read(&mut reader)?)
            }
            tag::CHUNK_DATA => Self::ChunkData(ChunkData::read(&mut reader)?),
            tag::CHUNK_CATCHUP_REQUEST => {
                Self::ChunkCatchupRequest(ChunkCatchupRequest::read(&mut reader)?)
            }
            tag::REGION_CATCHUP_REQUEST => {
                Self::RegionCatchupRequest(RegionCatchupRequest::read(&mut reader)?)
            }
            other => return Err(unknown_tag(&mut reader, other)),
        };
        Ok(packet)
    }

    /// Encodes to a frame body (tag byte + fields)
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Handshake(p) => encode_body(p),
            Self::EncryptionResponse(p) => encode_body(p),
            Self::ChunkData(p) => encode_body(p),
            Self::ChunkCatchupRequest(p) => encode_body(p),
            Self::RegionCatchupRequest(p) => encode_body(p),
        }
    }
}

/// Packets the server sends to clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientboundPacket {
    EncryptionRequest(EncryptionRequest),
    RegionTimestamps(RegionTimestamps),
    RegionCatchupResponse(RegionCatchupResponse),
    ChunkData(ChunkData),
}

impl ClientboundPacket {
    pub fn tag(&self) -> u8 {
        match self {
            Self::EncryptionRequest(_) => EncryptionRequest::TAG,
            Self::RegionTimestamps(_) => RegionTimestamps::TAG,
            Self::RegionCatchupResponse(_) => RegionCatchupResponse::TAG,
            Self::ChunkData(_) => ChunkData::TAG,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::EncryptionRequest(_) => EncryptionRequest::NAME,
            Self::RegionTimestamps(_) => RegionTimestamps::NAME,
            Self::RegionCatchupResponse(_) => RegionCatchupResponse::NAME,
            Self::ChunkData(_) => ChunkData::NAME,
        }
    }

    pub fn decode(body: &[u8]) -> Result<Self, CodecError> {
        let mut reader = PacketReader::new(body);
        reader.save_offset();
        let packet = match reader.read_u8()? {
            tag::ENCRYPTION_REQUEST => {
                Self::EncryptionRequest(EncryptionRequest::read(&mut reader)?)
            }
            tag::REGION_TIMESTAMPS => Self::RegionTimestamps(RegionTimestamps::read(&mut reader)?),
            tag::REGION_CATCHUP_RESPONSE => {
                Self::RegionCatchupResponse(RegionCatchupResponse::read(&mut reader)?)
            }
            tag::CHUNK_DATA => Self::ChunkData(ChunkData::read(&mut reader)?),
            other => return Err(unknown_tag(&mut reader, other)),
        };
        Ok(packet)
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::EncryptionRequest(p) => encode_body(p),
            Self::RegionTimestamps(p) => encode_body(p),
            Self::RegionCatchupResponse(p) => encode_body(p),
            Self::ChunkData(p) => encode_body(p),
        }
    }
}
