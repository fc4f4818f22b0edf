//! Per-connection task: drives a [`Session`] over a TCP stream
//!
//! Each accepted socket gets its own task that owns the session exclusively.
//! Inbound frames are processed strictly in arrival order and every effect is
//! carried out before the next frame is decoded, so a storage or identity call blocks
//! only this connection. Relayed uploads arrive on the connection's queue
//! from the [`ClientManager`](crate::client_manager::ClientManager).

use crate::client_manager::{relay_channel, RelayReceiver};
use crate::error::{AuthError, SessionError};
use crate::framing::FrameCodec;
use crate::network::ServerContext;
use crate::session::{Effect, HandshakeContext, Session, SessionEvent};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use shared::ClientboundPacket;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};

/// Serves one client until it disconnects or is kicked
pub async fn handle_connection(stream: TcpStream, addr: SocketAddr, ctx: Arc<ServerContext>) {
    let (sender, relay) = relay_channel();
    let client_id = ctx.clients.write().await.add_client(addr, sender);

    let handshake = HandshakeContext {
        keys: Arc::clone(&ctx.keys),
        expected_game_address: ctx.policy.expected_game_address().await,
    };
    let session = Session::new(client_id, handshake);

    if let Err(e) = stream.set_nodelay(true) {
        debug!("Client {} could not set TCP_NODELAY: {}", client_id, e);
    }
    let (reader, writer) = stream.into_split();

    let mut connection = Connection {
        ctx: Arc::clone(&ctx),
        session,
        reader: FramedRead::new(reader, FrameCodec::new(ctx.max_frame_size)),
        writer: FramedWrite::new(writer, FrameCodec::new(ctx.max_frame_size)),
        relay,
    };

    if let Err(e) = connection.run().await {
        warn!("Client {} kicked: {}", client_id, e);
    }
    drop(connection);

    ctx.clients.write().await.remove_client(&client_id);
}

struct Connection {
    ctx: Arc<ServerContext>,
    session: Session,
    reader: FramedRead<OwnedReadHalf, FrameCodec>,
    writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
    relay: RelayReceiver,
}

impl Connection {
    /// Returns `Ok` on a clean disconnect and the kick reason otherwise
    async fn run(&mut self) -> Result<(), SessionError> {
        loop {
            tokio::select! {
                frame = self.reader.next() => {
                    let Some(frame) = frame else {
                        return Ok(());
                    };
                    let effects = self.session.receive(frame?);
                    self.apply(effects).await?;
                }
                Some(packet) = self.relay.recv() => {
                    self.send(&packet).await?;
                }
            }
        }
    }

    async fn send(&mut self, packet: &ClientboundPacket) -> Result<(), SessionError> {
        let body = self.session.encode_outbound(packet);
        self.writer.send(body).await?;
        Ok(())
    }

    /// Carries out effects in order, including any that follow from them
    async fn apply(&mut self, effects: Vec<Effect>) -> Result<(), SessionError> {
        let client_id = self.session.id();
        let mut queue: VecDeque<Effect> = effects.into();

        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Send(packet) => self.send(&packet).await?,

                Effect::Close(reason) => return Err(reason),

                Effect::VerifyIdentity {
                    username,
                    server_hash,
                } => {
                    if queue.iter().any(|effect| matches!(effect, Effect::Close(_))) {
                        continue;
                    }
                    let event = self.verify(&username, &server_hash).await?;
                    queue.extend(self.session.handle(event));
                }

                // consumed by the session itself
                Effect::EnableEncryption { .. } => {}

                Effect::Authenticated(identity) => {
                    info!(
                        "Client {} authenticated as {} ({})",
                        client_id, identity.name, identity.uuid
                    );
                    self.ctx
                        .clients
                        .write()
                        .await
                        .mark_authenticated(client_id, identity);
                }

                Effect::SendRegionTimestamps { world } => {
                    match self.ctx.sync.region_timestamps(&world).await {
                        Ok(timestamps) => {
                            self.send(&ClientboundPacket::RegionTimestamps(timestamps))
                                .await?
                        }
                        Err(e) => warn!(
                            "Client {} region timestamps for {} failed: {}",
                            client_id, world, e
                        ),
                    }
                }

                Effect::StoreAndRelay(chunk) => {
                    let Some(identity) = self.session.identity().cloned() else {
                        continue;
                    };
                    let relayed = self.ctx.sync.upload(client_id, &identity, chunk).await;
                    debug!("Client {} upload relayed to {} clients", client_id, relayed);
                }

                Effect::RegionCatchup(request) => {
                    match self.ctx.sync.region_catchup(&request).await {
                        Ok(Some(response)) => {
                            self.send(&ClientboundPacket::RegionCatchupResponse(response))
                                .await?
                        }
                        Ok(None) => {}
                        Err(e) => warn!("Client {} region catch-up failed: {}", client_id, e),
                    }
                }

                Effect::ChunkCatchup(request) => {
                    match self.ctx.sync.chunk_catchup(client_id, &request).await {
                        Ok(chunks) => {
                            for chunk in chunks {
                                self.send(&ClientboundPacket::ChunkData(chunk)).await?;
                            }
                        }
                        Err(e) => warn!("Client {} chunk catch-up failed: {}", client_id, e),
                    }
                }
            }
        }

        Ok(())
    }

    /// Asks the identity service while watching the socket: the client must
    /// stay silent until it hears back, so any inbound frame is a kick.
    /// Frames already buffered win over the identity call.
    async fn verify(
        &mut self,
        username: &str,
        server_hash: &str,
    ) -> Result<SessionEvent, SessionError> {
        let ctx = Arc::clone(&self.ctx);

        let result = tokio::select! {
            biased;

            frame = self.reader.next() => {
                return match frame {
                    Some(Ok(_)) => Err(SessionError::DataDuringVerification),
                    Some(Err(e)) => Err(e.into()),
                    None => Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed during identity verification",
                    )
                    .into()),
                };
            }
            result = ctx.verifier.has_joined(username, server_hash) => result,
        };

        let event = match result {
            Ok(Some(identity)) => {
                ctx.identity_cache.remember(&identity).await;
                let allowed = ctx.policy.is_allowed(&identity).await;
                if !allowed {
                    info!(
                        "Client {} rejecting {} ({}): not whitelisted",
                        self.session.id(),
                        identity.name,
                        identity.uuid
                    );
                }
                SessionEvent::IdentityVerified { identity, allowed }
            }
            Ok(None) => SessionEvent::VerificationFailed(AuthError::NotJoined {
                username: username.to_string(),
            }),
            Err(e) => SessionEvent::VerificationFailed(e),
        };
        Ok(event)
    }
}
