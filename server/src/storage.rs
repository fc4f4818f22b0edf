//! Chunk storage
//!
//! [`ChunkStore`] is the narrow contract the protocol engine needs from
//! persistence. [`MemoryStore`] implements it in memory, optionally backed
//! by an append-only log that is replayed on startup.
//!
//! Each log record carries its length and a checksum, so replay can step
//! over a torn write and keep going with the records after it. A failed
//! append is cut back off the file before the store moves on.

use crate::error::StorageError;
use crate::sync::{newest_index, sort_newest_first, summarize_regions};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use shared::packets::ChunkTimestamp;
use shared::{ChunkFingerprint, ChunkPos, RegionPos};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

/// File name of the observation log inside the data directory
pub const CHUNK_LOG_FILE: &str = "chunks.log";

/// Encoded map data of one chunk, shared between observations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkBlob {
    pub fingerprint: ChunkFingerprint,
    pub format_version: u16,
    pub payload: Vec<u8>,
}

/// One player's view of one chunk at one point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkObservation {
    pub world: String,
    pub x: i32,
    pub z: i32,
    /// UUID of the uploading player
    pub uploader: String,
    pub timestamp: u64,
    pub chunk: ChunkBlob,
}

impl ChunkObservation {
    pub fn pos(&self) -> ChunkPos {
        ChunkPos::new(self.x, self.z)
    }
}

/// The newest observation of a coordinate across all uploaders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentChunk {
    pub timestamp: u64,
    pub chunk: ChunkBlob,
}

/// Newest timestamp of any chunk inside a region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionSummary {
    pub region: RegionPos,
    pub newest_timestamp: u64,
}

/// Persistence needed by the sync engine
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Stores an observation, replacing the uploader's previous one at the
    /// same coordinate
    async fn store_observation(&self, observation: ChunkObservation) -> Result<(), StorageError>;

    /// Newest timestamp per region, ordered by region x descending, then z
    async fn region_summaries(&self, world: &str) -> Result<Vec<RegionSummary>, StorageError>;

    /// Current timestamp of every known chunk in the regions, newest first
    async fn chunk_timestamps(
        &self,
        world: &str,
        regions: &[RegionPos],
    ) -> Result<Vec<ChunkTimestamp>, StorageError>;

    async fn current_observation(
        &self,
        world: &str,
        pos: ChunkPos,
    ) -> Result<Option<CurrentChunk>, StorageError>;
}

#[derive(Debug)]
struct Entry {
    uploader: String,
    timestamp: u64,
    blob: Arc<ChunkBlob>,
}

/// Entries per coordinate are kept in arrival order
#[derive(Debug, Default)]
struct Chunks {
    worlds: HashMap<String, HashMap<ChunkPos, Vec<Entry>>>,
    blobs: HashMap<ChunkFingerprint, Arc<ChunkBlob>>,
    observations: usize,
}

impl Chunks {
    fn insert(&mut self, observation: ChunkObservation) {
        let pos = observation.pos();
        let blob = Arc::clone(
            self.blobs
                .entry(observation.chunk.fingerprint)
                .or_insert_with(|| Arc::new(observation.chunk)),
        );

        let entries = self
            .worlds
            .entry(observation.world)
            .or_default()
            .entry(pos)
            .or_default();

        // a re-upload counts as newly seen
        let superseded = entries
            .iter()
            .position(|entry| entry.uploader == observation.uploader)
            .map(|index| entries.remove(index));

        entries.push(Entry {
            uploader: observation.uploader,
            timestamp: observation.timestamp,
            blob,
        });

        match superseded {
            Some(old) => {
                // map + `old` are the only holders left
                if Arc::strong_count(&old.blob) == 2 {
                    self.blobs.remove(&old.blob.fingerprint);
                }
            }
            None => self.observations += 1,
        }
    }

    fn newest(entries: &[Entry]) -> Option<&Entry> {
        newest_index(entries.iter().map(|entry| entry.timestamp)).map(|index| &entries[index])
    }

    fn current_timestamps(&self, world: &str) -> impl Iterator<Item = ChunkTimestamp> + '_ {
        self.worlds
            .get(world)
            .into_iter()
            .flat_map(|chunks| chunks.iter())
            .filter_map(|(pos, entries)| {
                Self::newest(entries).map(|entry| ChunkTimestamp {
                    x: pos.x,
                    z: pos.z,
                    timestamp: entry.timestamp,
                })
            })
    }
}

/// In-memory chunk store with optional append-only persistence
#[derive(Debug)]
pub struct MemoryStore {
    chunks: RwLock<Chunks>,
    log: Option<Mutex<File>>,
    log_path: Option<PathBuf>,
}

impl MemoryStore {
    /// Store without persistence
    pub fn new() -> Self {
        Self {
            chunks: RwLock::new(Chunks::default()),
            log: None,
            log_path: None,
        }
    }

    /// Opens (or creates) the log at `path` and replays it
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let mut chunks = Chunks::default();
        let mut truncate_to = None;

        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let (replayed, valid_len) = replay(&bytes, &mut chunks);
                info!(
                    "Replayed {} observations from {} ({} retained)",
                    replayed,
                    path.display(),
                    chunks.observations
                );
                if valid_len < bytes.len() {
                    truncate_to = Some(valid_len as u64);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Creating chunk log at {}", path.display());
            }
            Err(e) => return Err(e.into()),
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        // new records must not land behind a partial one
        if let Some(len) = truncate_to {
            file.set_len(len).await?;
        }

        Ok(Self {
            chunks: RwLock::new(chunks),
            log: Some(Mutex::new(file)),
            log_path: Some(path.to_path_buf()),
        })
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    /// Number of retained observations (one per coordinate and uploader)
    pub async fn len(&self) -> usize {
        self.chunks.read().await.observations
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of distinct payloads held
    pub async fn blob_count(&self) -> usize {
        self.chunks.read().await.blobs.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Length prefix plus checksum in front of every log record
const RECORD_HEADER_LEN: usize = 8;

/// First four bytes of the SHA-1 of a record body
fn checksum(body: &[u8]) -> [u8; 4] {
    let digest = Sha1::digest(body);
    [digest[0], digest[1], digest[2], digest[3]]
}

/// `u32` big-endian body length, checksum, bincode body
fn encode_record(observation: &ChunkObservation) -> Result<Vec<u8>, StorageError> {
    let body = bincode::serialize(observation)?;
    let mut record = Vec::with_capacity(RECORD_HEADER_LEN + body.len());
    record.extend_from_slice(&(body.len() as u32).to_be_bytes());
    record.extend_from_slice(&checksum(&body));
    record.extend_from_slice(&body);
    Ok(record)
}

/// Decodes the record at the start of `bytes` and returns it with its
/// encoded length, or `None` if no intact record starts there
fn decode_record(bytes: &[u8]) -> Option<(ChunkObservation, usize)> {
    let header = bytes.get(..RECORD_HEADER_LEN)?;
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let end = RECORD_HEADER_LEN.checked_add(len)?;
    let body = bytes.get(RECORD_HEADER_LEN..end)?;
    if checksum(body) != header[4..RECORD_HEADER_LEN] {
        return None;
    }
    let observation = bincode::deserialize(body).ok()?;
    Some((observation, end))
}

/// Applies every intact record in `bytes`, in order.
///
/// Damaged bytes between records are skipped up to the next intact record.
/// Returns the number of records applied and the offset just past the last
/// one; anything after that offset is a torn tail.
fn replay(bytes: &[u8], chunks: &mut Chunks) -> (usize, usize) {
    let mut offset = 0;
    let mut valid_len = 0;
    let mut replayed = 0;

    while offset < bytes.len() {
        if let Some((observation, len)) = decode_record(&bytes[offset..]) {
            chunks.insert(observation);
            replayed += 1;
            offset += len;
            valid_len = offset;
            continue;
        }

        let resume = (offset + 1..bytes.len()).find(|&at| decode_record(&bytes[at..]).is_some());
        match resume {
            Some(at) => {
                warn!(
                    "Skipping {} damaged bytes at offset {} of chunk log",
                    at - offset,
                    offset
                );
                offset = at;
            }
            None => {
                warn!(
                    "Ignoring truncated record at end of chunk log ({} bytes)",
                    bytes.len() - offset
                );
                break;
            }
        }
    }

    (replayed, valid_len)
}

async fn append_record(file: &mut File, record: &[u8]) -> std::io::Result<()> {
    file.write_all(record).await?;
    file.flush().await
}

#[async_trait]
impl ChunkStore for MemoryStore {
    async fn store_observation(&self, observation: ChunkObservation) -> Result<(), StorageError> {
        debug!(
            "Storing chunk {},{} in {} from {} at {}",
            observation.x, observation.z, observation.world, observation.uploader, observation.timestamp
        );

        let Some(log) = &self.log else {
            self.chunks.write().await.insert(observation);
            return Ok(());
        };

        // log order must match apply order
        let mut file = log.lock().await;
        let record = encode_record(&observation)?;
        let len = file.metadata().await?.len();
        if let Err(e) = append_record(&mut file, &record).await {
            if let Err(rollback) = file.set_len(len).await {
                error!("Failed to cut chunk log back to {} bytes: {}", len, rollback);
            }
            return Err(e.into());
        }
        self.chunks.write().await.insert(observation);
        Ok(())
    }

    async fn region_summaries(&self, world: &str) -> Result<Vec<RegionSummary>, StorageError> {
        let chunks = self.chunks.read().await;
        Ok(summarize_regions(chunks.current_timestamps(world)))
    }

    async fn chunk_timestamps(
        &self,
        world: &str,
        regions: &[RegionPos],
    ) -> Result<Vec<ChunkTimestamp>, StorageError> {
        let wanted: HashSet<RegionPos> = regions.iter().copied().collect();
        let chunks = self.chunks.read().await;

        let mut timestamps: Vec<ChunkTimestamp> = chunks
            .current_timestamps(world)
            .filter(|chunk| wanted.contains(&chunk.pos().region()))
            .collect();
        sort_newest_first(&mut timestamps);
        Ok(timestamps)
    }

    async fn current_observation(
        &self,
        world: &str,
        pos: ChunkPos,
    ) -> Result<Option<CurrentChunk>, StorageError> {
        let chunks = self.chunks.read().await;
        let current = chunks
            .worlds
            .get(world)
            .and_then(|world| world.get(&pos))
            .and_then(|entries| Chunks::newest(entries))
            .map(|entry| CurrentChunk {
                timestamp: entry.timestamp,
                chunk: entry.blob.as_ref().clone(),
            });
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(uploader: &str, x: i32, z: i32, timestamp: u64, payload: &[u8]) -> ChunkObservation {
        ChunkObservation {
            world: "overworld".to_string(),
            x,
            z,
            uploader: uploader.to_string(),
            timestamp,
            chunk: ChunkBlob {
                fingerprint: ChunkFingerprint::of(payload),
                format_version: 1,
                payload: payload.to_vec(),
            },
        }
    }

    #[tokio::test]
    async fn test_current_observation_is_newest_across_uploaders() {
        let store = MemoryStore::new();
        store.store_observation(observation("alice", 3, 4, 100, b"old")).await.unwrap();
        store.store_observation(observation("bob", 3, 4, 200, b"new")).await.unwrap();

        let current = store
            .current_observation("overworld", ChunkPos::new(3, 4))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.timestamp, 200);
        assert_eq!(current.chunk.payload, b"new");
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_equal_timestamps_first_seen_wins() {
        let store = MemoryStore::new();
        store.store_observation(observation("alice", 0, 0, 500, b"first")).await.unwrap();
        store.store_observation(observation("bob", 0, 0, 500, b"second")).await.unwrap();

        for _ in 0..3 {
            let current = store
                .current_observation("overworld", ChunkPos::new(0, 0))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(current.chunk.payload, b"first");
        }
    }

    #[tokio::test]
    async fn test_reupload_replaces_by_arrival_not_timestamp() {
        let store = MemoryStore::new();
        store.store_observation(observation("alice", 1, 1, 900, b"newer")).await.unwrap();
        store.store_observation(observation("alice", 1, 1, 100, b"older")).await.unwrap();

        let current = store
            .current_observation("overworld", ChunkPos::new(1, 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.timestamp, 100);
        assert_eq!(store.len().await, 1);
        // the superseded payload is no longer referenced
        assert_eq!(store.blob_count().await, 1);
    }

    #[tokio::test]
    async fn test_identical_payloads_share_one_blob() {
        let store = MemoryStore::new();
        store.store_observation(observation("alice", 0, 0, 1, b"same")).await.unwrap();
        store.store_observation(observation("bob", 0, 0, 2, b"same")).await.unwrap();
        store.store_observation(observation("carol", 9, 9, 3, b"same")).await.unwrap();

        assert_eq!(store.len().await, 3);
        assert_eq!(store.blob_count().await, 1);
    }

    #[tokio::test]
    async fn test_worlds_are_separate() {
        let store = MemoryStore::new();
        let mut nether = observation("alice", 0, 0, 10, b"nether");
        nether.world = "the_nether".to_string();
        store.store_observation(nether).await.unwrap();

        assert!(store
            .current_observation("overworld", ChunkPos::new(0, 0))
            .await
            .unwrap()
            .is_none());
        assert!(store.region_summaries("overworld").await.unwrap().is_empty());
        assert_eq!(store.region_summaries("the_nether").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_chunk_timestamps_only_from_requested_regions() {
        let store = MemoryStore::new();
        store.store_observation(observation("alice", 0, 0, 10, b"a")).await.unwrap();
        store.store_observation(observation("alice", 31, 31, 30, b"b")).await.unwrap();
        store.store_observation(observation("alice", 32, 0, 20, b"c")).await.unwrap();
        store.store_observation(observation("alice", -1, 0, 40, b"d")).await.unwrap();
        store.store_observation(observation("bob", 31, 31, 35, b"e")).await.unwrap();

        let chunks = store
            .chunk_timestamps("overworld", &[RegionPos::new(0, 0)])
            .await
            .unwrap();
        assert_eq!(
            chunks,
            vec![
                ChunkTimestamp { x: 31, z: 31, timestamp: 35 },
                ChunkTimestamp { x: 0, z: 0, timestamp: 10 },
            ]
        );
    }

    #[tokio::test]
    async fn test_region_summaries_use_newest_per_region() {
        let store = MemoryStore::new();
        store.store_observation(observation("alice", 0, 0, 10, b"a")).await.unwrap();
        store.store_observation(observation("bob", 5, 5, 50, b"b")).await.unwrap();
        store.store_observation(observation("alice", -40, 0, 7, b"c")).await.unwrap();

        let summaries = store.region_summaries("overworld").await.unwrap();
        assert_eq!(
            summaries,
            vec![
                RegionSummary { region: RegionPos::new(0, 0), newest_timestamp: 50 },
                RegionSummary { region: RegionPos::new(-2, 0), newest_timestamp: 7 },
            ]
        );
    }

    #[tokio::test]
    async fn test_log_replays_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHUNK_LOG_FILE);

        {
            let store = MemoryStore::open(&path).await.unwrap();
            store.store_observation(observation("alice", 2, 2, 10, b"one")).await.unwrap();
            store.store_observation(observation("bob", 2, 2, 20, b"two")).await.unwrap();
            store.store_observation(observation("alice", 2, 2, 30, b"three")).await.unwrap();
        }

        let reopened = MemoryStore::open(&path).await.unwrap();
        assert_eq!(reopened.len().await, 2);
        assert_eq!(reopened.log_path(), Some(path.as_path()));
        let current = reopened
            .current_observation("overworld", ChunkPos::new(2, 2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.timestamp, 30);
        assert_eq!(current.chunk.payload, b"three");
    }

    #[tokio::test]
    async fn test_truncated_log_tail_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHUNK_LOG_FILE);

        let mut bytes = encode_record(&observation("alice", 0, 0, 1, b"kept")).unwrap();
        let partial = encode_record(&observation("bob", 0, 0, 2, b"lost")).unwrap();
        bytes.extend_from_slice(&partial[..partial.len() / 2]);
        tokio::fs::write(&path, &bytes).await.unwrap();

        let store = MemoryStore::open(&path).await.unwrap();
        assert_eq!(store.len().await, 1);
        let current = store
            .current_observation("overworld", ChunkPos::new(0, 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.chunk.payload, b"kept");

        store.store_observation(observation("carol", 0, 0, 3, b"after")).await.unwrap();
        drop(store);
        let reopened = MemoryStore::open(&path).await.unwrap();
        assert_eq!(reopened.len().await, 2);
    }

    #[tokio::test]
    async fn test_partial_record_mid_log_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHUNK_LOG_FILE);

        let mut bytes = encode_record(&observation("alice", 0, 0, 1, b"first")).unwrap();
        let torn = encode_record(&observation("bob", 5, 5, 2, b"torn write")).unwrap();
        bytes.extend_from_slice(&torn[..torn.len() / 2]);
        bytes.extend(encode_record(&observation("carol", 7, 7, 3, b"third")).unwrap());
        tokio::fs::write(&path, &bytes).await.unwrap();

        let store = MemoryStore::open(&path).await.unwrap();
        assert_eq!(store.len().await, 2);
        assert!(store
            .current_observation("overworld", ChunkPos::new(5, 5))
            .await
            .unwrap()
            .is_none());
        let third = store
            .current_observation("overworld", ChunkPos::new(7, 7))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(third.chunk.payload, b"third");

        store.store_observation(observation("dave", 9, 9, 4, b"fourth")).await.unwrap();
        drop(store);
        let reopened = MemoryStore::open(&path).await.unwrap();
        assert_eq!(reopened.len().await, 3);
    }

    #[test]
    fn test_corrupted_record_body_is_rejected() {
        let mut record = encode_record(&observation("alice", 0, 0, 1, b"payload")).unwrap();
        assert!(decode_record(&record).is_some());

        let last = record.len() - 1;
        record[last] ^= 0xff;
        assert!(decode_record(&record).is_none());

        let mut chunks = Chunks::default();
        assert_eq!(replay(&record, &mut chunks), (0, 0));
    }
}
