use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

use super::PieceIndex;

/// identifier of a remote host holding pieces, i.e the id of the storage contract with it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct HostId([u8; Self::HOST_ID_SIZE]);

impl HostId {
    pub const HOST_ID_SIZE: usize = 32;

    pub fn new(bytes: [u8; Self::HOST_ID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        Self::new([0u8; Self::HOST_ID_SIZE].map(|_| rng.gen()))
    }
}

impl AsRef<[u8; Self::HOST_ID_SIZE]> for HostId {
    fn as_ref(&self) -> &[u8; Self::HOST_ID_SIZE] {
        &self.0
    }
}

// hosts show up in every span, the first 8 bytes are plenty to tell them apart.
impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0[..8].iter().try_for_each(|byte| write!(f, "{byte:02x}"))
    }
}

impl fmt::Debug for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostId({self})")
    }
}

/// sha256 digest of a piece exactly as the host stores it (encrypted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ContentHash([u8; Self::CONTENT_HASH_SIZE]);

impl ContentHash {
    pub const CONTENT_HASH_SIZE: usize = 32;

    pub fn new(bytes: [u8; Self::CONTENT_HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn of(data: &[u8]) -> Self {
        Self::new(Sha256::digest(data).into())
    }
}

impl AsRef<[u8; Self::CONTENT_HASH_SIZE]> for ContentHash {
    fn as_ref(&self) -> &[u8; Self::CONTENT_HASH_SIZE] {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceInfo {
    pub index: PieceIndex,
    pub hash: ContentHash,
}

impl PieceInfo {
    pub fn new(index: PieceIndex, hash: ContentHash) -> Self {
        Self { index, hash }
    }

    /// whether `data` is the piece this info describes.
    pub fn matches(&self, data: &[u8]) -> bool {
        ContentHash::of(data) == self.hash
    }
}

/// which piece of a chunk every host is expected to deliver.
pub type PieceLookup = HashMap<HostId, PieceInfo>;
