//! AES-128 in 8-bit cipher feedback mode, used for all post-handshake traffic.
//!
//! The shared secret doubles as key and IV. Each direction keeps its own
//! feedback register, so bytes must be pushed through in exactly the order
//! they travel on the wire.

use crate::error::CipherError;
use aes::Aes128;
use cfb8::cipher::generic_array::GenericArray;
use cfb8::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

/// Length of the client-chosen shared secret
pub const SHARED_SECRET_LEN: usize = 16;

type Encryptor = cfb8::Encryptor<Aes128>;
type Decryptor = cfb8::Decryptor<Aes128>;

/// Encrypt/decrypt pair for one connection
pub struct StreamCipher {
    encryptor: Encryptor,
    decryptor: Decryptor,
}

impl StreamCipher {
    pub fn new(shared_secret: &[u8]) -> Result<Self, CipherError> {
        let invalid = || CipherError::InvalidSecretLength {
            expected: SHARED_SECRET_LEN,
            actual: shared_secret.len(),
        };
        let encryptor =
            Encryptor::new_from_slices(shared_secret, shared_secret).map_err(|_| invalid())?;
        let decryptor =
            Decryptor::new_from_slices(shared_secret, shared_secret).map_err(|_| invalid())?;
        Ok(Self {
            encryptor,
            decryptor,
        })
    }

    /// Encrypts outgoing bytes in place
    pub fn encrypt(&mut self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            let block = GenericArray::from_mut_slice(std::slice::from_mut(byte));
            self.encryptor.encrypt_block_mut(block);
        }
    }

    /// Decrypts incoming bytes in place
    pub fn decrypt(&mut self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            let block = GenericArray::from_mut_slice(std::slice::from_mut(byte));
            self.decryptor.decrypt_block_mut(block);
        }
    }
}

impl std::fmt::Debug for StreamCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: [u8; SHARED_SECRET_LEN] = *b"0123456789abcdef";

    #[test]
    fn test_decrypt_reverses_encrypt() {
        let mut sender = StreamCipher::new(&SECRET).unwrap();
        let mut receiver = StreamCipher::new(&SECRET).unwrap();

        let plain = b"region timestamps for overworld".to_vec();
        let mut wire = plain.clone();
        sender.encrypt(&mut wire);
        assert_ne!(wire, plain);

        receiver.decrypt(&mut wire);
        assert_eq!(wire, plain);
    }

    #[test]
    fn test_stream_state_carries_across_calls() {
        let mut whole = StreamCipher::new(&SECRET).unwrap();
        let mut pieces = StreamCipher::new(&SECRET).unwrap();

        let mut one_shot = vec![0x5a; 37];
        whole.encrypt(&mut one_shot);

        let mut split = vec![0x5a; 37];
        let (head, tail) = split.split_at_mut(11);
        pieces.encrypt(head);
        pieces.encrypt(tail);

        assert_eq!(one_shot, split);
    }

    #[test]
    fn test_directions_are_independent() {
        let mut cipher = StreamCipher::new(&SECRET).unwrap();
        let mut peer = StreamCipher::new(&SECRET).unwrap();

        let mut outgoing = b"to client".to_vec();
        cipher.encrypt(&mut outgoing);
        let mut incoming = b"to server".to_vec();
        peer.encrypt(&mut incoming);

        // decrypting on our side is unaffected by what we already encrypted
        cipher.decrypt(&mut incoming);
        assert_eq!(incoming, b"to server");
        peer.decrypt(&mut outgoing);
        assert_eq!(outgoing, b"to client");
    }

    #[test]
    fn test_rejects_wrong_secret_length() {
        assert_eq!(
            StreamCipher::new(&[0u8; 5]).unwrap_err(),
            CipherError::InvalidSecretLength {
                expected: 16,
                actual: 5
            }
        );
    }
}
