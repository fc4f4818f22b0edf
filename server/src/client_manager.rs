//! Connection registry for the relay server
//!
//! This module tracks every live connection, including:
//! - Connection id assignment and address tracking
//! - Which connections have completed authentication, and as whom
//! - The outbound queue of each connection, used for relaying uploads
//!
//! The registry is shared between all connection tasks behind a single
//! `Arc<RwLock<ClientManager>>`. Broadcasts hold the read lock for the whole
//! iteration, so connects and disconnects never interleave with a relay.
//!
//! Relay queues are bounded. A peer that falls [`RELAY_QUEUE_CAPACITY`]
//! packets behind loses further relays until it drains; the uploader and the
//! other peers are unaffected. One relayed packet is shared by all peers.

use crate::auth::VerifiedIdentity;
use log::{debug, info, warn};
use shared::ClientboundPacket;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Relayed packets a connection may have queued before new ones are dropped
pub const RELAY_QUEUE_CAPACITY: usize = 64;

pub type RelaySender = mpsc::Sender<Arc<ClientboundPacket>>;
pub type RelayReceiver = mpsc::Receiver<Arc<ClientboundPacket>>;

/// Creates the outbound relay queue of one connection
pub fn relay_channel() -> (RelaySender, RelayReceiver) {
    mpsc::channel(RELAY_QUEUE_CAPACITY)
}

/// Represents a connected client and the queue feeding its socket
///
/// Each client maintains:
/// - Connection metadata (ID, address, connect time)
/// - The verified identity, once authentication has completed
/// - A sender into the connection task's outbound queue
#[derive(Debug)]
pub struct ClientHandle {
    /// Unique client identifier assigned by the server
    pub id: u32,
    /// Remote address of the connection
    pub addr: SocketAddr,
    /// When the connection was accepted
    pub connected_at: Instant,
    /// Verified identity; `None` until the handshake completes
    pub identity: Option<VerifiedIdentity>,
    sender: RelaySender,
}

impl ClientHandle {
    /// Creates a new, unauthenticated handle
    pub fn new(id: u32, addr: SocketAddr, sender: RelaySender) -> Self {
        Self {
            id,
            addr,
            connected_at: Instant::now(),
            identity: None,
            sender,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    /// Queues a packet for this client without waiting
    ///
    /// Returns false if the packet was dropped, either because the queue is
    /// full or because the connection task has already gone away.
    pub fn send(&self, packet: Arc<ClientboundPacket>) -> bool {
        match self.sender.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(packet)) => {
                warn!(
                    "Client {} relay queue full, dropping {}",
                    self.id,
                    packet.name()
                );
                false
            }
            Err(TrySendError::Closed(packet)) => {
                debug!("Client {} queue closed, dropping {}", self.id, packet.name());
                false
            }
        }
    }
}

/// Snapshot of one connection for operator listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: u32,
    pub addr: SocketAddr,
    pub identity: Option<VerifiedIdentity>,
}

/// Manages all live connections
///
/// The ClientManager assigns increasing connection ids (wrapping past
/// `u32::MAX` and skipping ids still in use),
/// records which connections are authenticated and fans relayed packets
/// out to them. Unauthenticated connections never receive relays.
#[derive(Debug)]
pub struct ClientManager {
    /// Connected clients indexed by their unique ID
    clients: HashMap<u32, ClientHandle>,
    /// Next available client ID for new connections
    next_client_id: u32,
}

impl ClientManager {
    /// Creates an empty registry
    ///
    /// Client IDs start from 1 and increment for each new connection.
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
        }
    }

    /// Registers a newly accepted connection
    ///
    /// Returns the id assigned to the connection. The connection starts out
    /// unauthenticated.
    pub fn add_client(
        &mut self,
        addr: SocketAddr,
        sender: RelaySender,
    ) -> u32 {
        let client_id = self.allocate_id();

        info!("Client {} connected from {}", client_id, addr);
        self.clients
            .insert(client_id, ClientHandle::new(client_id, addr, sender));

        client_id
    }

    fn allocate_id(&mut self) -> u32 {
        loop {
            let id = self.next_client_id;
            self.next_client_id = self.next_client_id.wrapping_add(1).max(1);
            if !self.clients.contains_key(&id) {
                return id;
            }
        }
    }

    /// Removes a connection from the registry
    ///
    /// Returns true if the client was found and removed, false if it was
    /// already gone. Dropping the handle closes the connection's queue.
    pub fn remove_client(&mut self, client_id: &u32) -> bool {
        if let Some(client) = self.clients.remove(client_id) {
            match &client.identity {
                Some(identity) => info!("Client {}:{} disconnected", client.id, identity.name),
                None => info!("Client {} disconnected", client.id),
            }
            true
        } else {
            false
        }
    }

    /// Records the verified identity of a connection
    ///
    /// From this point on the connection receives relayed uploads. Returns
    /// false if the client ID is unknown.
    pub fn mark_authenticated(&mut self, client_id: u32, identity: VerifiedIdentity) -> bool {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.identity = Some(identity);
            true
        } else {
            false
        }
    }

    pub fn get(&self, client_id: u32) -> Option<&ClientHandle> {
        self.clients.get(&client_id)
    }

    /// Queues a packet for every authenticated client except `exclude`
    ///
    /// Delivery is best effort: a client whose queue is full or closed is
    /// skipped without affecting the others. Returns how many clients the
    /// packet was queued for.
    pub fn broadcast(&self, packet: Arc<ClientboundPacket>, exclude: Option<u32>) -> usize {
        let mut delivered = 0;

        for (client_id, client) in &self.clients {
            if Some(*client_id) == exclude || !client.is_authenticated() {
                continue;
            }

            if client.send(Arc::clone(&packet)) {
                delivered += 1;
            }
        }

        delivered
    }

    /// Lists all connections ordered by id
    pub fn list(&self) -> Vec<ClientInfo> {
        let mut clients: Vec<ClientInfo> = self
            .clients
            .values()
            .map(|client| ClientInfo {
                id: client.id,
                addr: client.addr,
                identity: client.identity.clone(),
            })
            .collect();
        clients.sort_by_key(|client| client.id);
        clients
    }

    /// Returns the number of authenticated clients
    pub fn authenticated_count(&self) -> usize {
        self.clients
            .values()
            .filter(|client| client.is_authenticated())
            .count()
    }

    /// Returns the number of currently connected clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns true if no clients are currently connected
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl Default for ClientManager {
    fn default() -> Self {
        Self::new()
    }
}
