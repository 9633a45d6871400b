//! doubles shared by the unit tests of the chunk and download modules.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, PoisonError};

use rand::RngCore;

use crate::chunk::{ChunkDescriptor, ChunkParams, ContentHash, HostId, PieceInfo, PieceLookup};
use crate::crypto::{derive_piece_key, MasterKey};
use crate::download::{Download, DownloadDestination};
use crate::erasure::{ErasureCoder, ErasureError, ReedSolomonCoder};
use crate::memory::MemoryManager;

#[derive(Debug, Default)]
pub(crate) struct RecordingDestination {
    writes: Mutex<Vec<(u64, Vec<u8>)>>,
    close_calls: AtomicUsize,
    fail_writes: bool,
    fail_close: bool,
    close_gate: Option<Arc<Barrier>>,
}

impl RecordingDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_writes() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    pub fn failing_close() -> Self {
        Self {
            fail_close: true,
            ..Self::default()
        }
    }

    /// `close` meets the test at `gate` before it is recorded.
    pub fn gated_close(gate: Arc<Barrier>) -> Self {
        Self {
            close_gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn writes(&self) -> Vec<(u64, Vec<u8>)> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

impl DownloadDestination for RecordingDestination {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        if self.fail_writes {
            return Err(io::Error::new(io::ErrorKind::Other, "disk on fire"));
        }

        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((offset, buf.to_vec()));
        Ok(buf.len())
    }

    fn close(&self) -> io::Result<()> {
        if let Some(gate) = &self.close_gate {
            gate.wait();
        }
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(io::Error::new(io::ErrorKind::Other, "close failed"));
        }
        Ok(())
    }
}

/// records every release instead of enforcing a budget.
#[derive(Debug, Default)]
pub(crate) struct CountingMemory {
    releases: Mutex<Vec<u64>>,
}

impl CountingMemory {
    pub fn releases(&self) -> Vec<u64> {
        self.releases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl MemoryManager for CountingMemory {
    fn release(&self, bytes: u64) {
        self.releases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(bytes);
    }
}

/// reed-solomon coder that counts recoveries and can be told to fail them.
#[derive(Debug)]
pub(crate) struct CountingCoder {
    inner: ReedSolomonCoder,
    recoveries: AtomicUsize,
    fail: bool,
    gate: Option<Arc<Barrier>>,
}

impl CountingCoder {
    pub fn new(data: usize, parity: usize) -> Self {
        Self {
            inner: ReedSolomonCoder::new(data, parity).expect("valid reed solomon config"),
            recoveries: AtomicUsize::new(0),
            fail: false,
            gate: None,
        }
    }

    pub fn failing(data: usize, parity: usize) -> Self {
        Self {
            fail: true,
            ..Self::new(data, parity)
        }
    }

    /// `recover` meets the test at `gate` twice, once on entry and once before decoding.
    pub fn gated(data: usize, parity: usize, gate: Arc<Barrier>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(data, parity)
        }
    }

    pub fn recoveries(&self) -> usize {
        self.recoveries.load(Ordering::SeqCst)
    }
}

impl ErasureCoder for CountingCoder {
    fn min_pieces(&self) -> usize {
        self.inner.min_pieces()
    }

    fn num_pieces(&self) -> usize {
        self.inner.num_pieces()
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, ErasureError> {
        self.inner.encode(data)
    }

    fn recover(&self, pieces: &mut [Option<Vec<u8>>], size: u64) -> Result<Vec<u8>, ErasureError> {
        self.recoveries.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.wait();
            gate.wait();
        }
        if self.fail {
            return Err(ErasureError::NotEnoughPieces {
                needed: self.min_pieces(),
                present: 0,
            });
        }
        self.inner.recover(pieces, size)
    }
}

/// one encoded and encrypted chunk together with everything a `ChunkDownload` needs.
pub(crate) struct TestChunk {
    pub data: Vec<u8>,
    pub hosts: Vec<HostId>,
    pub sealed: HashMap<HostId, Vec<u8>>,
    pub coder: Arc<CountingCoder>,
    pub destination: Arc<RecordingDestination>,
    pub memory: Arc<CountingMemory>,
    pub download: Arc<Download>,
    pub master_key: MasterKey,
}

impl TestChunk {
    pub fn new(chunk_size: usize, coder: CountingCoder, destination: RecordingDestination) -> Self {
        let mut data = vec![0u8; chunk_size];
        rand::thread_rng().fill_bytes(&mut data);

        let master_key = MasterKey::random();
        let pieces = coder.encode(&data).expect("encoding test data does not fail");

        let mut hosts = Vec::new();
        let mut sealed = HashMap::new();
        for (index, piece) in pieces.iter().enumerate() {
            let host = HostId::random();
            let ciphertext = derive_piece_key(&master_key, 0, index)
                .encrypt(piece)
                .expect("encrypting test data does not fail");
            hosts.push(host);
            sealed.insert(host, ciphertext);
        }

        let destination = Arc::new(destination);
        Self {
            data,
            hosts,
            sealed,
            coder: Arc::new(coder),
            download: Download::new(1, chunk_size as u64, destination.clone()),
            destination,
            memory: Arc::new(CountingMemory::default()),
            master_key,
        }
    }

    pub fn lookup(&self) -> PieceLookup {
        self.hosts
            .iter()
            .enumerate()
            .map(|(index, host)| {
                let hash = ContentHash::of(&self.sealed[host]);
                (*host, PieceInfo::new(index, hash))
            })
            .collect()
    }

    pub fn descriptor(&self, params: ChunkParams) -> ChunkDescriptor {
        ChunkDescriptor {
            params,
            piece_lookup: self.lookup(),
            erasure: self.coder.clone(),
            master_key: self.master_key.clone(),
            destination: self.destination.clone(),
        }
    }

    pub fn piece(&self, index: usize) -> Vec<u8> {
        self.sealed[&self.hosts[index]].clone()
    }
}
