//! Encryption handshake and third-party identity verification
//!
//! The server holds one RSA keypair for its whole lifetime. Clients use its
//! public key to send a shared secret and the echoed verify token; the
//! secret then keys the AES/CFB8 transport and, hashed together with the
//! public key, forms the "server id" that the identity service is asked
//! about.

use crate::error::AuthError;
use async_trait::async_trait;
use log::debug;
use rand::RngCore;
use reqwest::StatusCode;
use rsa::pkcs8::EncodePublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use serde::Deserialize;
use sha1::{Digest, Sha1};

/// RSA modulus size used for the handshake keypair
pub const RSA_KEY_BITS: usize = 1024;

/// Length of the random verify token sent in `EncryptionRequest`
pub const VERIFY_TOKEN_LEN: usize = 4;

/// Default identity service
pub const DEFAULT_SESSION_SERVER: &str = "https://sessionserver.mojang.com";

/// Server-lifetime RSA keypair and its DER-encoded public half
pub struct ServerKeys {
    private_key: RsaPrivateKey,
    public_key_der: Vec<u8>,
}

impl ServerKeys {
    /// Generates a fresh keypair
    pub fn generate() -> Result<Self, AuthError> {
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS)?;
        Self::from_private_key(private_key)
    }

    pub fn from_private_key(private_key: RsaPrivateKey) -> Result<Self, AuthError> {
        let public_key_der = RsaPublicKey::from(&private_key)
            .to_public_key_der()
            .map_err(|e| AuthError::KeyEncoding(e.to_string()))?
            .as_bytes()
            .to_vec();
        Ok(Self {
            private_key,
            public_key_der,
        })
    }

    /// Public key as SubjectPublicKeyInfo DER, as sent to clients
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }

    pub fn public_key(&self) -> RsaPublicKey {
        RsaPublicKey::from(&self.private_key)
    }

    /// Decrypts a PKCS#1 v1.5 encrypted handshake field
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, AuthError> {
        Ok(self.private_key.decrypt(Pkcs1v15Encrypt, ciphertext)?)
    }

    /// Lowercase hex SHA-1 of the shared secret followed by the public key
    pub fn server_hash(&self, shared_secret: &[u8]) -> String {
        let mut hasher = Sha1::new();
        hasher.update(shared_secret);
        hasher.update(&self.public_key_der);
        hex::encode(hasher.finalize())
    }
}

impl std::fmt::Debug for ServerKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerKeys")
            .field("public_key_der_len", &self.public_key_der.len())
            .finish_non_exhaustive()
    }
}

pub fn generate_verify_token() -> [u8; VERIFY_TOKEN_LEN] {
    let mut token = [0u8; VERIFY_TOKEN_LEN];
    rand::thread_rng().fill_bytes(&mut token);
    token
}

/// Authoritative identity returned by the identity service
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VerifiedIdentity {
    /// Dashed UUID
    pub uuid: String,
    /// Display name
    pub name: String,
}

/// Asks a third party whether a user joined with a given server id.
///
/// `Ok(None)` means the service answered that the user has not joined.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn has_joined(
        &self,
        username: &str,
        server_hash: &str,
    ) -> Result<Option<VerifiedIdentity>, AuthError>;
}

#[derive(Debug, Deserialize)]
struct HasJoinedResponse {
    id: String,
    name: String,
}

/// Verifier backed by the Mojang session server `hasJoined` endpoint
#[derive(Debug, Clone)]
pub struct MojangVerifier {
    client: reqwest::Client,
    base_url: String,
}

impl MojangVerifier {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl Default for MojangVerifier {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_SERVER)
    }
}

#[async_trait]
impl IdentityVerifier for MojangVerifier {
    async fn has_joined(
        &self,
        username: &str,
        server_hash: &str,
    ) -> Result<Option<VerifiedIdentity>, AuthError> {
        let url = format!("{}/session/minecraft/hasJoined", self.base_url);
        debug!("Checking hasJoined for {} at {}", username, url);

        let response = self
            .client
            .get(&url)
            .query(&[("username", username), ("serverId", server_hash)])
            .send()
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::OK => {
                let body: HasJoinedResponse = response.json().await?;
                Ok(Some(VerifiedIdentity {
                    uuid: format_uuid(&body.id),
                    name: body.name,
                }))
            }
            other => Err(AuthError::UnexpectedStatus(other.as_u16())),
        }
    }
}

/// Normalises a UUID to dashed 8-4-4-4-12 form.
///
/// Input that is not 32 hex digits (with or without dashes) is returned as is.
pub fn format_uuid(id: &str) -> String {
    let digits: String = id.chars().filter(|c| *c != '-').collect();
    if digits.len() != 32 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return id.to_string();
    }
    format!(
        "{}-{}-{}-{}-{}",
        &digits[0..8],
        &digits[8..12],
        &digits[12..16],
        &digits[16..20],
        &digits[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keys() -> ServerKeys {
        // 512 bits keeps the tests fast; the handshake logic is size-agnostic
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 512).unwrap();
        ServerKeys::from_private_key(private_key).unwrap()
    }

    #[test]
    fn test_decrypt_pkcs1_v15() {
        let keys = test_keys();
        let secret = [7u8; 16];
        let ciphertext = keys
            .public_key()
            .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, &secret)
            .unwrap();

        assert_eq!(keys.decrypt(&ciphertext).unwrap(), secret);
    }

    #[test]
    fn test_decrypt_tampered_ciphertext_fails_or_differs() {
        let keys = test_keys();
        let token = [1u8, 2, 3, 4];
        let mut ciphertext = keys
            .public_key()
            .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, &token)
            .unwrap();
        ciphertext[10] ^= 0x01;

        match keys.decrypt(&ciphertext) {
            Ok(plain) => assert_ne!(plain, token),
            Err(AuthError::Rsa(_)) => {}
            Err(other) => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_public_key_is_spki_der() {
        let keys = test_keys();
        let der = keys.public_key_der();
        // SEQUENCE tag, and round-trips through the SPKI decoder
        assert_eq!(der[0], 0x30);
        use rsa::pkcs8::DecodePublicKey;
        assert_eq!(RsaPublicKey::from_public_key_der(der).unwrap(), keys.public_key());
    }

    #[test]
    fn test_server_hash_is_sha1_of_secret_and_key() {
        let keys = test_keys();
        let secret = b"0123456789abcdef";

        let mut expected = Sha1::new();
        expected.update(secret);
        expected.update(keys.public_key_der());
        let expected = hex::encode(expected.finalize());

        let hash = keys.server_hash(secret);
        assert_eq!(hash, expected);
        assert_eq!(hash.len(), 40);
        assert!(hash.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn test_verify_tokens_are_random() {
        let a = generate_verify_token();
        let b = generate_verify_token();
        let c = generate_verify_token();
        assert_eq!(a.len(), VERIFY_TOKEN_LEN);
        assert!(a != b || b != c);
    }

    #[test]
    fn test_format_uuid() {
        assert_eq!(
            format_uuid("069a79f444e94726a5befca90e38aaf5"),
            "069a79f4-44e9-4726-a5be-fca90e38aaf5"
        );
        assert_eq!(
            format_uuid("069a79f4-44e9-4726-a5be-fca90e38aaf5"),
            "069a79f4-44e9-4726-a5be-fca90e38aaf5"
        );
        assert_eq!(format_uuid("not-a-uuid"), "not-a-uuid");
    }

    #[test]
    fn test_mojang_verifier_trims_base_url() {
        let verifier = MojangVerifier::new("http://localhost:1234/");
        assert_eq!(verifier.base_url, "http://localhost:1234");
    }
}
