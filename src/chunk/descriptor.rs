use std::sync::Arc;
use std::time::Duration;

use super::PieceLookup;
use crate::crypto::MasterKey;
use crate::download::DownloadDestination;
use crate::erasure::ErasureCoder;

/// geometry of a chunk within the file and the destination, plus the scheduling hints the
/// worker pool reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkParams {
    pub chunk_index: u64,
    pub chunk_size: u64,
    /// offset within the logical chunk that is being downloaded.
    pub fetch_offset: u64,
    /// length within the logical chunk to fetch.
    pub fetch_length: u64,
    pub piece_size: u64,
    /// offset within the destination to write the fetched range.
    pub write_offset: u64,

    pub latency_target: Duration,
    pub overdrive: usize,
    pub priority: u64,
    /// set when memory was not granted before the chunk was created.
    pub needs_memory: bool,

    /// zero decrypted pieces and the recovered chunk before dropping them.
    pub wipe_plaintext: bool,
}

impl ChunkParams {
    /// parameters fetching the whole chunk into the destination at `chunk_index * chunk_size`.
    pub fn new(chunk_index: u64, chunk_size: u64, piece_size: u64) -> Self {
        Self {
            chunk_index,
            chunk_size,
            fetch_offset: 0,
            fetch_length: chunk_size,
            piece_size,
            write_offset: chunk_index * chunk_size,
            latency_target: Duration::from_millis(200),
            overdrive: 0,
            priority: 0,
            needs_memory: false,
            wipe_plaintext: false,
        }
    }

    pub fn with_fetch_range(mut self, offset: u64, length: u64) -> Self {
        self.fetch_offset = offset;
        self.fetch_length = length;
        self
    }

    pub fn with_write_offset(mut self, write_offset: u64) -> Self {
        self.write_offset = write_offset;
        self
    }

    pub fn with_overdrive(mut self, overdrive: usize) -> Self {
        self.overdrive = overdrive;
        self
    }

    pub fn with_latency_target(mut self, latency_target: Duration) -> Self {
        self.latency_target = latency_target;
        self
    }

    pub fn with_priority(mut self, priority: u64) -> Self {
        self.priority = priority;
        self
    }

    pub fn needs_memory(mut self, needs_memory: bool) -> Self {
        self.needs_memory = needs_memory;
        self
    }

    pub fn wipe_plaintext(mut self, wipe: bool) -> Self {
        self.wipe_plaintext = wipe;
        self
    }

    /// memory charged for a chunk: one piece buffer per piece that may be in flight.
    pub fn memory_required(&self, min_pieces: usize) -> u64 {
        (min_pieces + self.overdrive) as u64 * self.piece_size
    }
}

/// read-only instructions of a chunk download, shared by every worker without locking.
pub struct ChunkDescriptor {
    pub params: ChunkParams,
    pub piece_lookup: PieceLookup,
    pub erasure: Arc<dyn ErasureCoder>,
    pub master_key: MasterKey,
    pub destination: Arc<dyn DownloadDestination>,
}

impl std::fmt::Debug for ChunkDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkDescriptor")
            .field("params", &self.params)
            .field("hosts", &self.piece_lookup.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn test_defaults_fetch_whole_chunk() {
        let params = ChunkParams::new(3, 40, 10);

        assert_eq!(params.fetch_offset, 0);
        assert_eq!(params.fetch_length, 40);
        assert_eq!(params.write_offset, 120);
    }

    #[rstest]
    #[case(0, 40)]
    #[case(2, 60)]
    fn test_memory_required(#[case] overdrive: usize, #[case] expected: u64) {
        let params = ChunkParams::new(0, 40, 10).with_overdrive(overdrive);
        assert_eq!(params.memory_required(4), expected);
    }
}
