//! # Map Sync Relay Server
//!
//! This library provides the relay server that keeps many game clients'
//! local copies of a shared world map eventually consistent. Clients upload
//! the map chunks they observe; the server keeps the newest chunk per
//! coordinate, tells reconnecting clients which regions are stale, and
//! relays fresh uploads live to everyone else who is connected.
//!
//! ## Core Responsibilities
//!
//! ### Session Protocol
//! Every connection runs through a four-state machine: handshake, encryption
//! response, authenticated, closed. Authentication exchanges an RSA-wrapped
//! shared secret, checks the claimed player with the identity service and
//! switches the connection to an AES-128/CFB8 encrypted stream.
//!
//! ### Catch-up
//! Right after authenticating, a client receives the newest timestamp of
//! every region in its world. It then asks for the per-chunk timestamps of
//! regions it is behind on, and finally for the chunks themselves. A chunk is
//! only served when its current timestamp matches the one the client asked
//! for exactly.
//!
//! ### Relay
//! An uploaded chunk is stored under the uploader's identity and forwarded
//! verbatim to every other authenticated connection, even if storing it
//! failed.
//!
//! ## Architecture Design
//!
//! ### Task Per Connection
//! Each accepted socket is served by its own tokio task that exclusively
//! owns the session, its framed socket halves and its cipher. Inbound frames
//! are handled strictly in order; identity and storage calls block only the
//! connection that made them.
//!
//! ### Shared Registry
//! The only state shared between connections is the
//! [`client_manager::ClientManager`], held behind one `RwLock`. Relays go
//! through bounded per-connection queues, so a slow peer never holds up the
//! sender; it loses relays instead.
//!
//! ## Module Organization
//!
//! - [`framing`]: the length-prefixed frame codec
//! - [`session`]: the pure protocol state machine
//! - [`connection`]: the task that drives a session over a socket
//! - [`auth`]: server keypair, verify tokens and identity verification
//! - [`sync`]: region summaries, catch-up answers and upload relay
//! - [`storage`]: the chunk store contract and its in-memory implementation
//! - [`client_manager`]: the registry of live connections
//! - [`network`]: the TCP listener and shared server context
//! - [`config`], [`metadata`]: `config.json`, allow-list and uuid cache
//! - [`console`]: operator commands on stdin
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::auth::{MojangVerifier, ServerKeys};
//! use server::metadata::Metadata;
//! use server::network::{Server, ServerContext};
//! use server::storage::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let metadata = Arc::new(Metadata::load("./mapsync").await?);
//!     let context = ServerContext::new(
//!         Arc::new(ServerKeys::generate()?),
//!         Arc::new(MojangVerifier::default()),
//!         metadata.clone(),
//!         metadata,
//!         Arc::new(MemoryStore::new()),
//!     );
//!
//!     let server = Server::bind("127.0.0.1:12312", context).await?;
//!     server.run().await;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client_manager;
pub mod config;
pub mod connection;
pub mod console;
pub mod error;
pub mod framing;
pub mod metadata;
pub mod network;
pub mod session;
pub mod storage;
pub mod sync;
