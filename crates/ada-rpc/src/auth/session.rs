//! Per-connection frame sealing established by the handshake.

use crate::error::{Result, RpcError};
use crate::frame::Frame;
use bytes::Bytes;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use std::fmt;
use x25519_dalek::{PublicKey, SharedSecret};

const KDF_SALT: &[u8] = b"ada-rpc curve v1";

/// Directional keys derived from one X25519 agreement.
pub(crate) struct DerivedKeys {
    pub client_to_server: [u8; 32],
    pub server_to_client: [u8; 32],
}

pub(crate) fn derive_keys(
    shared: &SharedSecret,
    client_public: &PublicKey,
    server_public: &PublicKey,
) -> Result<DerivedKeys> {
    if !shared.was_contributory() {
        return Err(RpcError::auth("peer sent a low-order public key"));
    }
    let mut info = Vec::with_capacity(64);
    info.extend_from_slice(client_public.as_bytes());
    info.extend_from_slice(server_public.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), shared.as_bytes());
    let mut okm = [0u8; 64];
    hk.expand(&info, &mut okm)
        .map_err(|e| RpcError::auth(format!("key derivation failed: {}", e)))?;

    let mut keys = DerivedKeys {
        client_to_server: [0u8; 32],
        server_to_client: [0u8; 32],
    };
    keys.client_to_server.copy_from_slice(&okm[..32]);
    keys.server_to_client.copy_from_slice(&okm[32..]);
    Ok(keys)
}

/// One direction of a sealed channel: a cipher plus its nonce counter.
pub(crate) struct Direction {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl Direction {
    pub fn new(key: &[u8; 32], first_counter: u64) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: first_counter,
        }
    }

    fn next_nonce(&mut self) -> Result<[u8; 12]> {
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| RpcError::protocol("nonce counter exhausted"))?;
        Ok(nonce)
    }

    pub fn seal(&mut self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce()?;
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|_| RpcError::protocol("failed to seal frame"))
    }

    pub fn open(&mut self, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce()?;
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| RpcError::protocol("frame failed authentication"))
    }
}

/// Frame protection for one connection.
///
/// A NULL session passes frames through untouched.
pub struct Session {
    sealed: Option<(Direction, Direction)>,
}

impl Session {
    pub fn plain() -> Self {
        Self { sealed: None }
    }

    pub(crate) fn sealed(send: Direction, recv: Direction) -> Self {
        Self {
            sealed: Some((send, recv)),
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.is_some()
    }

    /// Protect an outgoing frame. The flags byte is authenticated, not hidden.
    pub fn seal(&mut self, frame: Frame) -> Result<Frame> {
        match &mut self.sealed {
            None => Ok(frame),
            Some((send, _)) => {
                let body = send.seal(&[frame.flags], &frame.body)?;
                Ok(Frame {
                    flags: frame.flags,
                    body: Bytes::from(body),
                })
            }
        }
    }

    pub fn open(&mut self, frame: Frame) -> Result<Frame> {
        match &mut self.sealed {
            None => Ok(frame),
            Some((_, recv)) => {
                let body = recv.open(&[frame.flags], &frame.body)?;
                Ok(Frame {
                    flags: frame.flags,
                    body: Bytes::from(body),
                })
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("sealed", &self.is_sealed())
            .finish()
    }
}
