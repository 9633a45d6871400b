use std::sync::Arc;

use super::LocalHost;
use crate::chunk::{ContentHash, PieceInfo, PieceLookup};
use crate::crypto::{derive_piece_key, MasterKey};
use crate::erasure::ErasureCoder;
use crate::prelude::*;

/// everything a download needs to know about a file placed on the swarm.
#[derive(Debug)]
pub struct UploadedFile {
    pub length: u64,
    pub chunk_size: u64,
    pub piece_size: u64,
    pub master_key: MasterKey,
    /// piece lookup of every chunk, indexed by chunk index.
    pub chunks: Vec<PieceLookup>,
}

impl UploadedFile {
    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }
}

/// splits `data` into chunks, erasure codes and seals every chunk, and stores piece `i` of
/// chunk `c` on host `(c + i) % hosts.len()`.
#[instrument(name = "upload file", level = "info", skip_all, fields(length = data.len()))]
pub(super) fn upload_file(
    data: &[u8],
    chunk_size: u64,
    erasure: &dyn ErasureCoder,
    hosts: &[Arc<LocalHost>],
) -> anyhow::Result<UploadedFile> {
    if chunk_size == 0 {
        anyhow::bail!("chunk size must be greater than zero");
    }
    if hosts.len() < erasure.num_pieces() {
        anyhow::bail!(
            "{} hosts cannot hold the {} pieces of a chunk",
            hosts.len(),
            erasure.num_pieces()
        );
    }

    let chunk_len = usize::try_from(chunk_size).context("chunk size does not fit in memory")?;
    let piece_size = chunk_size.div_ceil(erasure.min_pieces() as u64).max(1);
    let master_key = MasterKey::random();

    let mut chunks = Vec::new();
    for (chunk_index, segment) in (0u64..).zip(data.chunks(chunk_len)) {
        let _span = debug_span!("upload chunk", chunk_index).entered();

        // every chunk is encoded at full size so all pieces share one piece size.
        let mut padded = segment.to_vec();
        padded.resize(chunk_len, 0);
        let pieces = erasure.encode(&padded)?;

        let mut lookup = PieceLookup::with_capacity(pieces.len());
        for (piece_index, piece) in pieces.into_iter().enumerate() {
            if piece.len() as u64 != piece_size {
                anyhow::bail!(
                    "erasure coder produced a {} byte piece, expected {}",
                    piece.len(),
                    piece_size
                );
            }

            let sealed = derive_piece_key(&master_key, chunk_index, piece_index)
                .encrypt(&piece)
                .with_context(|| format!("unable to seal piece {}", piece_index))?;

            let host = &hosts[(chunk_index as usize + piece_index) % hosts.len()];
            lookup.insert(
                host.id(),
                PieceInfo::new(piece_index, ContentHash::of(&sealed)),
            );
            host.store(chunk_index, sealed);
        }

        debug!(pieces = lookup.len(), "chunk placed");
        chunks.push(lookup);
    }

    info!(chunks = chunks.len(), piece_size, "file uploaded");
    Ok(UploadedFile {
        length: data.len() as u64,
        chunk_size,
        piece_size,
        master_key,
        chunks,
    })
}
