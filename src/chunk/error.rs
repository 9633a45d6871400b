use std::io;
use thiserror::Error;

use super::PieceIndex;
use crate::crypto::CryptoError;
use crate::erasure::ErasureError;

/// reasons a chunk fails, every one of them is terminal for the chunk.
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("unable to decrypt piece {index}")]
    Decrypt {
        index: PieceIndex,
        #[source]
        source: CryptoError,
    },

    #[error("erasure decoding failed")]
    Recovery(#[from] ErasureError),

    #[error("erasure decoder returned {got} bytes for a chunk of {expected} bytes")]
    RecoveredSize { expected: u64, got: usize },

    #[error("writing to the destination failed")]
    Write(#[source] io::Error),

    #[error("{completed} pieces completed with {remaining} workers remaining, {needed} pieces needed")]
    InsufficientPieces {
        completed: usize,
        remaining: usize,
        needed: usize,
    },
}
