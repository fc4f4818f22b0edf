//! Synchronization engine
//!
//! Answers the catch-up queries of authenticated clients and handles chunk
//! uploads. The ordering helpers at the top are pure so that any
//! [`ChunkStore`] implementation can share the exact same rules:
//!
//! - the current chunk at a coordinate is the newest observation across
//!   uploaders, first-seen on equal timestamps
//! - region summaries are ordered by region x descending, then z ascending
//! - catch-up listings are newest first

use crate::auth::VerifiedIdentity;
use crate::client_manager::ClientManager;
use crate::error::StorageError;
use crate::storage::{ChunkBlob, ChunkObservation, ChunkStore, RegionSummary};
use log::{debug, error, warn};
use shared::packets::{
    ChunkCatchupRequest, ChunkData, ChunkTimestamp, RegionCatchupRequest, RegionCatchupResponse,
    RegionTimestamp, RegionTimestamps,
};
use shared::{ClientboundPacket, RegionPos};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Index of the largest timestamp; the earliest index wins ties
pub fn newest_index<I>(timestamps: I) -> Option<usize>
where
    I: IntoIterator<Item = u64>,
{
    let mut newest: Option<(usize, u64)> = None;
    for (index, timestamp) in timestamps.into_iter().enumerate() {
        match newest {
            Some((_, best)) if timestamp <= best => {}
            _ => newest = Some((index, timestamp)),
        }
    }
    newest.map(|(index, _)| index)
}

fn region_order(a: &RegionPos, b: &RegionPos) -> Ordering {
    b.x.cmp(&a.x).then(a.z.cmp(&b.z))
}

/// Groups current chunk timestamps into per-region maxima
pub fn summarize_regions<I>(chunks: I) -> Vec<RegionSummary>
where
    I: IntoIterator<Item = ChunkTimestamp>,
{
    let mut newest: HashMap<RegionPos, u64> = HashMap::new();
    for chunk in chunks {
        let timestamp = newest.entry(chunk.pos().region()).or_insert(chunk.timestamp);
        *timestamp = (*timestamp).max(chunk.timestamp);
    }

    let mut summaries: Vec<RegionSummary> = newest
        .into_iter()
        .map(|(region, newest_timestamp)| RegionSummary {
            region,
            newest_timestamp,
        })
        .collect();
    summaries.sort_by(|a, b| region_order(&a.region, &b.region));
    summaries
}

/// Newest first; equal timestamps by coordinate so output is deterministic
pub fn sort_newest_first(chunks: &mut [ChunkTimestamp]) {
    chunks.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then(a.x.cmp(&b.x))
            .then(a.z.cmp(&b.z))
    });
}

/// Converts a summary to its wire form, or `None` if the region does not fit
fn to_wire(summary: &RegionSummary) -> Option<RegionTimestamp> {
    Some(RegionTimestamp {
        x: i16::try_from(summary.region.x).ok()?,
        z: i16::try_from(summary.region.z).ok()?,
        timestamp: i64::try_from(summary.newest_timestamp).unwrap_or(i64::MAX),
    })
}

/// Catch-up and upload handling on top of a [`ChunkStore`]
pub struct SyncEngine {
    store: Arc<dyn ChunkStore>,
    clients: Arc<RwLock<ClientManager>>,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn ChunkStore>, clients: Arc<RwLock<ClientManager>>) -> Self {
        Self { store, clients }
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    /// Summary sent to a client right after it authenticates
    pub async fn region_timestamps(&self, world: &str) -> Result<RegionTimestamps, StorageError> {
        let summaries = self.store.region_summaries(world).await?;

        let mut regions = Vec::with_capacity(summaries.len());
        for summary in &summaries {
            match to_wire(summary) {
                Some(region) => regions.push(region),
                None => warn!(
                    "Skipping region {},{} in {}: outside the wire range",
                    summary.region.x, summary.region.z, world
                ),
            }
        }

        Ok(RegionTimestamps {
            world: world.to_string(),
            regions,
        })
    }

    /// Chunk timestamps for the requested regions, or `None` if there are none
    pub async fn region_catchup(
        &self,
        request: &RegionCatchupRequest,
    ) -> Result<Option<RegionCatchupResponse>, StorageError> {
        let regions: Vec<RegionPos> = request
            .regions
            .iter()
            .map(|region| RegionPos::new(region.x.into(), region.z.into()))
            .collect();

        let chunks = self.store.chunk_timestamps(&request.world, &regions).await?;
        if chunks.is_empty() {
            return Ok(None);
        }

        Ok(Some(RegionCatchupResponse {
            world: request.world.clone(),
            chunks,
        }))
    }

    /// Full chunk data for every requested chunk whose current timestamp
    /// matches the one the client asked for
    pub async fn chunk_catchup(
        &self,
        client_id: u32,
        request: &ChunkCatchupRequest,
    ) -> Result<Vec<ChunkData>, StorageError> {
        let mut found = Vec::new();

        for wanted in &request.chunks {
            let Some(current) = self
                .store
                .current_observation(&request.world, wanted.pos())
                .await?
            else {
                warn!(
                    "Client {} requested unknown chunk {},{} in {}",
                    client_id, wanted.x, wanted.z, request.world
                );
                continue;
            };

            // newer: already relayed to the client; older: client has better
            if current.timestamp != wanted.timestamp {
                debug!(
                    "Client {} catch-up for {},{} is stale ({} vs {})",
                    client_id, wanted.x, wanted.z, wanted.timestamp, current.timestamp
                );
                continue;
            }

            found.push(ChunkData {
                world: request.world.clone(),
                x: wanted.x,
                z: wanted.z,
                timestamp: current.timestamp,
                format_version: current.chunk.format_version,
                fingerprint: current.chunk.fingerprint,
                payload: current.chunk.payload,
            });
        }

        Ok(found)
    }

    /// Stores an upload and relays it to every other authenticated client.
    ///
    /// Storage failures are logged; the chunk is relayed regardless. Returns
    /// the number of clients it was relayed to.
    pub async fn upload(&self, sender: u32, uploader: &VerifiedIdentity, chunk: ChunkData) -> usize {
        let observation = ChunkObservation {
            world: chunk.world.clone(),
            x: chunk.x,
            z: chunk.z,
            uploader: uploader.uuid.clone(),
            timestamp: chunk.timestamp,
            chunk: ChunkBlob {
                fingerprint: chunk.fingerprint,
                format_version: chunk.format_version,
                payload: chunk.payload.clone(),
            },
        };

        if let Err(e) = self.store.store_observation(observation).await {
            error!(
                "Failed to store chunk {},{} in {} from client {}: {}",
                chunk.x, chunk.z, chunk.world, sender, e
            );
        }

        let clients = self.clients.read().await;
        clients.broadcast(Arc::new(ClientboundPacket::ChunkData(chunk)), Some(sender))
    }
}
