use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroize;

use crate::chunk::PieceIndex;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("ciphertext of {0} bytes is shorter than the 24 byte nonce")]
    Truncated(usize),

    #[error("piece failed authentication, corrupt data or wrong key")]
    Authentication,

    #[error("piece encryption failed")]
    Encryption,
}

const NONCE_SIZE: usize = 24;

/// key material from which every piece key of a file is derived.
#[derive(Clone, PartialEq, Eq)]
pub struct MasterKey([u8; Self::KEY_SIZE]);

impl MasterKey {
    pub const KEY_SIZE: usize = 32;

    pub fn new(bytes: [u8; Self::KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        Self([0u8; Self::KEY_SIZE].map(|_| rng.gen()))
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

pub struct PieceKey(XChaCha20Poly1305);

/// the key of a piece is sha256(master || chunk_index || piece_index), integers little endian.
pub fn derive_piece_key(master: &MasterKey, chunk_index: u64, piece_index: PieceIndex) -> PieceKey {
    let mut hasher = Sha256::new();
    hasher.update(&master.0);
    hasher.update(chunk_index.to_le_bytes());
    hasher.update((piece_index as u64).to_le_bytes());

    let mut key: [u8; 32] = hasher.finalize().into();
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    key.zeroize();

    PieceKey(cipher)
}

impl PieceKey {
    /// seals `plaintext` as nonce || ciphertext || tag.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = self
            .0
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encryption)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend(sealed);
        Ok(out)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < NONCE_SIZE {
            return Err(CryptoError::Truncated(ciphertext.len()));
        }

        let (nonce, sealed) = ciphertext.split_at(NONCE_SIZE);
        self.0
            .decrypt(XNonce::from_slice(nonce), sealed)
            .map_err(|_| CryptoError::Authentication)
    }
}
