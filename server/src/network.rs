//! TCP listener and the state shared by all connections

use crate::auth::{IdentityVerifier, ServerKeys};
use crate::client_manager::ClientManager;
use crate::connection::handle_connection;
use crate::error::ServerError;
use crate::metadata::{AccessPolicy, IdentityCache};
use crate::storage::ChunkStore;
use crate::sync::SyncEngine;
use log::{error, info};
use shared::DEFAULT_MAX_FRAME_SIZE;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

/// Everything a connection task needs besides its own socket
pub struct ServerContext {
    pub keys: Arc<ServerKeys>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub policy: Arc<dyn AccessPolicy>,
    pub identity_cache: Arc<dyn IdentityCache>,
    pub clients: Arc<RwLock<ClientManager>>,
    pub sync: SyncEngine,
    pub max_frame_size: usize,
}

impl ServerContext {
    pub fn new(
        keys: Arc<ServerKeys>,
        verifier: Arc<dyn IdentityVerifier>,
        policy: Arc<dyn AccessPolicy>,
        identity_cache: Arc<dyn IdentityCache>,
        store: Arc<dyn ChunkStore>,
    ) -> Self {
        let clients = Arc::new(RwLock::new(ClientManager::new()));
        Self {
            keys,
            verifier,
            policy,
            identity_cache,
            sync: SyncEngine::new(store, Arc::clone(&clients)),
            clients,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
}

/// Accepts connections and spawns a task per client
pub struct Server {
    listener: TcpListener,
    context: Arc<ServerContext>,
}

impl Server {
    pub async fn bind(addr: &str, context: ServerContext) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Server listening on {}", listener.local_addr()?);

        Ok(Server {
            listener,
            context: Arc::new(context),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn clients(&self) -> Arc<RwLock<ClientManager>> {
        Arc::clone(&self.context.clients)
    }

    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.context)
    }

    /// Accept loop; runs until the task is dropped
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let context = Arc::clone(&self.context);
                    tokio::spawn(handle_connection(stream, addr, context));
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
}
