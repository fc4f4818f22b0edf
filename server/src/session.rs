//! Per-connection protocol state machine
//!
//! A [`Session`] owns the transport cipher and the protocol state of one
//! connection. It performs no I/O: frame bodies split off the socket by
//! [`FrameCodec`](crate::framing::FrameCodec) go in through
//! [`Session::receive`], and what the connection must do next comes back as
//! a list of [`Effect`]s. Results of the asynchronous identity check are fed
//! back in as a [`SessionEvent`] through [`Session::handle`], so every state
//! change happens on the connection's own serial queue.
//!
//! ```text
//! AwaitingHandshake --Handshake--> AwaitingEncryptionResponse
//!     --EncryptionResponse--> (verifying) --IdentityVerified--> Authenticated
//! any protocol error ------------------------------------------> Closed
//! ```

use crate::auth::{generate_verify_token, ServerKeys, VerifiedIdentity, VERIFY_TOKEN_LEN};
use crate::error::{AuthError, SessionError};
use bytes::{Bytes, BytesMut};
use log::debug;
use shared::packets::{
    ChunkCatchupRequest, ChunkData, EncryptionRequest, EncryptionResponse, Handshake,
    RegionCatchupRequest,
};
use shared::{CipherError, ClientboundPacket, ServerboundPacket, StreamCipher, SHARED_SECRET_LEN};
use std::sync::Arc;

/// Server-wide inputs to the handshake
#[derive(Debug, Clone)]
pub struct HandshakeContext {
    pub keys: Arc<ServerKeys>,
    pub expected_game_address: String,
}

/// Shared secret waiting on the identity service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingVerification {
    pub shared_secret: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHandshake,
    AwaitingEncryptionResponse {
        claimed_username: String,
        world: String,
        verify_token: [u8; VERIFY_TOKEN_LEN],
        /// Set while the identity check is outstanding
        verification: Option<PendingVerification>,
    },
    Authenticated {
        identity: VerifiedIdentity,
        world: String,
    },
    Closed,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AwaitingHandshake => "AwaitingHandshake",
            Self::AwaitingEncryptionResponse {
                verification: None,
                ..
            } => "AwaitingEncryptionResponse",
            Self::AwaitingEncryptionResponse { .. } => "VerifyingIdentity",
            Self::Authenticated { .. } => "Authenticated",
            Self::Closed => "Closed",
        }
    }
}

/// Something that happened to a session
#[derive(Debug)]
pub enum SessionEvent {
    Packet(ServerboundPacket),
    /// The identity service confirmed the user; `allowed` is the allow-list verdict
    IdentityVerified {
        identity: VerifiedIdentity,
        allowed: bool,
    },
    VerificationFailed(AuthError),
}

/// Work the connection must carry out, in order
#[derive(Debug)]
pub enum Effect {
    Send(ClientboundPacket),
    /// Ask the identity service; answer with a [`SessionEvent`]
    VerifyIdentity {
        username: String,
        server_hash: String,
    },
    /// Install the transport cipher for all following frames
    EnableEncryption {
        shared_secret: Vec<u8>,
    },
    Authenticated(VerifiedIdentity),
    SendRegionTimestamps {
        world: String,
    },
    StoreAndRelay(ChunkData),
    RegionCatchup(RegionCatchupRequest),
    ChunkCatchup(ChunkCatchupRequest),
    Close(SessionError),
}

fn close(err: SessionError) -> (SessionState, Vec<Effect>) {
    (SessionState::Closed, vec![Effect::Close(err)])
}

fn unexpected(packet: &ServerboundPacket, state: &SessionState) -> (SessionState, Vec<Effect>) {
    close(SessionError::UnexpectedPacket {
        packet: packet.name(),
        state: state.name(),
    })
}

fn on_handshake(handshake: Handshake, ctx: &HandshakeContext) -> (SessionState, Vec<Effect>) {
    if handshake.game_address != ctx.expected_game_address {
        return close(SessionError::GameAddressMismatch(handshake.game_address));
    }

    let verify_token = generate_verify_token();
    let request = EncryptionRequest {
        public_key: ctx.keys.public_key_der().to_vec(),
        verify_token: verify_token.to_vec(),
    };

    (
        SessionState::AwaitingEncryptionResponse {
            claimed_username: handshake.username,
            world: handshake.world,
            verify_token,
            verification: None,
        },
        vec![Effect::Send(ClientboundPacket::EncryptionRequest(request))],
    )
}

fn on_encryption_response(
    response: EncryptionResponse,
    claimed_username: String,
    world: String,
    verify_token: [u8; VERIFY_TOKEN_LEN],
    ctx: &HandshakeContext,
) -> (SessionState, Vec<Effect>) {
    let echoed_token = match ctx.keys.decrypt(&response.verify_token) {
        Ok(token) => token,
        Err(e) => return close(e.into()),
    };
    if echoed_token != verify_token {
        return close(SessionError::VerifyTokenMismatch);
    }

    let shared_secret = match ctx.keys.decrypt(&response.shared_secret) {
        Ok(secret) => secret,
        Err(e) => return close(e.into()),
    };
    if shared_secret.len() != SHARED_SECRET_LEN {
        return close(
            AuthError::Cipher(CipherError::InvalidSecretLength {
                expected: SHARED_SECRET_LEN,
                actual: shared_secret.len(),
            })
            .into(),
        );
    }

    let server_hash = ctx.keys.server_hash(&shared_secret);
    (
        SessionState::AwaitingEncryptionResponse {
            claimed_username: claimed_username.clone(),
            world,
            verify_token,
            verification: Some(PendingVerification { shared_secret }),
        },
        vec![Effect::VerifyIdentity {
            username: claimed_username,
            server_hash,
        }],
    )
}

/// Advances the protocol by one event
pub fn transition(
    state: SessionState,
    event: SessionEvent,
    ctx: &HandshakeContext,
) -> (SessionState, Vec<Effect>) {
    match (state, event) {
        (SessionState::Closed, _) => (SessionState::Closed, Vec::new()),

        (SessionState::AwaitingHandshake, SessionEvent::Packet(ServerboundPacket::Handshake(handshake))) => {
            on_handshake(handshake, ctx)
        }

        (
            SessionState::AwaitingEncryptionResponse {
                claimed_username,
                world,
                verify_token,
                verification: None,
            },
            SessionEvent::Packet(ServerboundPacket::EncryptionResponse(response)),
        ) => on_encryption_response(response, claimed_username, world, verify_token, ctx),

        (
            SessionState::AwaitingEncryptionResponse {
                verification: Some(_),
                ..
            },
            SessionEvent::Packet(_),
        ) => close(SessionError::DataDuringVerification),

        (
            SessionState::AwaitingEncryptionResponse {
                world,
                verification: Some(pending),
                ..
            },
            SessionEvent::IdentityVerified { identity, allowed },
        ) => {
            if !allowed {
                return close(SessionError::NotAllowed {
                    name: identity.name,
                    uuid: identity.uuid,
                });
            }
            (
                SessionState::Authenticated {
                    identity: identity.clone(),
                    world: world.clone(),
                },
                vec![
                    Effect::EnableEncryption {
                        shared_secret: pending.shared_secret,
                    },
                    Effect::Authenticated(identity),
                    Effect::SendRegionTimestamps { world },
                ],
            )
        }

        (
            SessionState::AwaitingEncryptionResponse {
                verification: Some(_),
                ..
            },
            SessionEvent::VerificationFailed(err),
        ) => close(err.into()),

        (state @ SessionState::Authenticated { .. }, SessionEvent::Packet(packet)) => match packet {
            ServerboundPacket::ChunkData(chunk) => (state, vec![Effect::StoreAndRelay(chunk)]),
            ServerboundPacket::RegionCatchupRequest(request) => {
                (state, vec![Effect::RegionCatchup(request)])
            }
            ServerboundPacket::ChunkCatchupRequest(request) => {
                (state, vec![Effect::ChunkCatchup(request)])
            }
            other => unexpected(&other, &state),
        },

        (state, SessionEvent::Packet(packet)) => unexpected(&packet, &state),

        // a verification result without an outstanding verification
        (state, event) => close(SessionError::UnexpectedEvent {
            event: event.name(),
            state: state.name(),
        }),
    }
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Packet(packet) => packet.name(),
            Self::IdentityVerified { .. } => "IdentityVerified",
            Self::VerificationFailed(_) => "VerificationFailed",
        }
    }
}

/// Protocol state of one connection
#[derive(Debug)]
pub struct Session {
    id: u32,
    state: SessionState,
    cipher: Option<StreamCipher>,
    ctx: HandshakeContext,
}

impl Session {
    pub fn new(id: u32, ctx: HandshakeContext) -> Self {
        Self {
            id,
            state: SessionState::AwaitingHandshake,
            cipher: None,
            ctx,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, SessionState::Closed)
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn identity(&self) -> Option<&VerifiedIdentity> {
        match &self.state {
            SessionState::Authenticated { identity, .. } => Some(identity),
            _ => None,
        }
    }

    /// Decrypts and decodes one frame body and returns its effects. A
    /// closed session ignores further frames.
    pub fn receive(&mut self, mut body: BytesMut) -> Vec<Effect> {
        if self.is_closed() {
            return Vec::new();
        }

        if let Some(cipher) = &mut self.cipher {
            cipher.decrypt(&mut body);
        }

        let packet = match ServerboundPacket::decode(&body) {
            Ok(packet) => packet,
            Err(e) => {
                self.state = SessionState::Closed;
                return vec![Effect::Close(e.into())];
            }
        };

        debug!("Client {} ← Client[{}]", self.id, packet.name());
        self.handle(SessionEvent::Packet(packet))
    }

    /// Applies one event. Cipher installation is handled here; all other
    /// effects are returned to the caller.
    pub fn handle(&mut self, event: SessionEvent) -> Vec<Effect> {
        let state = std::mem::replace(&mut self.state, SessionState::Closed);
        let (next, effects) = transition(state, event, &self.ctx);
        self.state = next;

        let mut remaining = Vec::with_capacity(effects.len());
        for effect in effects {
            match effect {
                Effect::EnableEncryption { shared_secret } => match StreamCipher::new(&shared_secret) {
                    Ok(cipher) => self.cipher = Some(cipher),
                    Err(e) => {
                        self.state = SessionState::Closed;
                        return vec![Effect::Close(AuthError::from(e).into())];
                    }
                },
                other => remaining.push(other),
            }
        }
        remaining
    }

    /// Encodes (and, once authenticated, encrypts) an outbound frame body
    pub fn encode_outbound(&mut self, packet: &ClientboundPacket) -> Bytes {
        let mut body = packet.encode();
        if let Some(cipher) = &mut self.cipher {
            cipher.encrypt(&mut body);
        }
        debug!("Client {} → Client[{}]", self.id, packet.name());
        Bytes::from(body)
    }
}
