use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::task::JoinHandle;
use tracing::Span;
use zeroize::Zeroize;

use super::descriptor::{ChunkDescriptor, ChunkParams};
use super::state::{clear_pieces, ChunkState};
use super::{ChunkError, HostId, PieceInfo, PieceLookup};
use crate::crypto::derive_piece_key;
use crate::download::Download;
use crate::memory::MemoryManager;
use crate::prelude::*;

/// what became of a piece handed to `record_piece`.
#[derive(Debug)]
pub enum PieceOutcome {
    /// the chunk failed or the piece is unknown or a duplicate.
    Discarded,
    /// stored, more pieces are needed.
    Stored,
    /// delivered after enough pieces completed, counted and dropped.
    Surplus,
    /// this piece met the threshold, the handle resolves when the chunk is written.
    RecoveryStarted(JoinHandle<anyhow::Result<()>>),
}

/// what a worker should do after offering itself to a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// fetch this piece, then `record_piece` and `mark_worker_done`.
    Fetch(PieceInfo),
    /// held in reserve until `mark_worker_done` or `take_standby_workers` hands it back.
    Standby,
    /// not needed, the worker has already been counted as done.
    Retired,
}

/// snapshot of the chunk state for logging and overdrive decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkProgress {
    pub failed: bool,
    pub recovery_complete: bool,
    pub pieces_completed: usize,
    pub pieces_registered: usize,
    pub workers_remaining: usize,
    pub standby_workers: usize,
    pub buffered_pieces: usize,
    pub memory_allocated: u64,
}

/// one chunk of a download that workers are fetching pieces for.
pub struct ChunkDownload {
    descriptor: ChunkDescriptor,
    state: Mutex<ChunkState>,
    memory: Arc<dyn MemoryManager>,
    download: Weak<Download>,
}

impl std::fmt::Debug for ChunkDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkDownload")
            .field("descriptor", &self.descriptor)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ChunkDownload {
    /// every host in the piece lookup counts as one worker. the chunk's memory, see
    /// `ChunkParams::memory_required`, is charged to it and released when it finishes.
    pub fn new(
        descriptor: ChunkDescriptor,
        memory: Arc<dyn MemoryManager>,
        download: &Arc<Download>,
    ) -> anyhow::Result<Arc<Self>> {
        let ChunkDescriptor {
            params,
            piece_lookup,
            erasure,
            ..
        } = &descriptor;

        assert!(
            params.fetch_offset + params.fetch_length <= params.chunk_size,
            "fetch range {}+{} exceeds chunk size {}",
            params.fetch_offset,
            params.fetch_length,
            params.chunk_size
        );

        let num_pieces = erasure.num_pieces();
        if let Some(info) = piece_lookup.values().find(|info| info.index >= num_pieces) {
            anyhow::bail!(
                "piece index {} out of range for a {} piece erasure code",
                info.index,
                num_pieces
            );
        }

        let memory_allocated = params.memory_required(erasure.min_pieces());
        let state = ChunkState::new(num_pieces, piece_lookup.len(), memory_allocated);

        Ok(Arc::new(Self {
            descriptor,
            state: Mutex::new(state),
            memory,
            download: Arc::downgrade(download),
        }))
    }

    fn lock_state(&self) -> MutexGuard<'_, ChunkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn min_pieces(&self) -> usize {
        self.descriptor.erasure.min_pieces()
    }

    pub fn params(&self) -> &ChunkParams {
        &self.descriptor.params
    }

    pub fn piece_lookup(&self) -> &PieceLookup {
        &self.descriptor.piece_lookup
    }

    pub fn progress(&self) -> ChunkProgress {
        let state = self.lock_state();
        ChunkProgress {
            failed: state.failed,
            recovery_complete: state.recovery_complete,
            pieces_completed: state.pieces_completed,
            pieces_registered: state.pieces_registered,
            workers_remaining: state.workers_remaining,
            standby_workers: state.standby_workers.len(),
            buffered_pieces: state.buffered_pieces(),
            memory_allocated: state.memory_allocated,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.lock_state().failed
    }

    pub fn standby_workers(&self) -> Vec<HostId> {
        self.lock_state().standby_workers.iter().copied().collect()
    }

    #[instrument(name = "register worker", level = "debug", skip(self), fields(chunk_index = self.descriptor.params.chunk_index))]
    pub fn register_worker(&self, host: HostId) -> Registration {
        let min_pieces = self.min_pieces();
        let download_finished = self
            .download
            .upgrade()
            .map_or(true, |download| download.is_finished());

        // hosts outside the lookup were never counted as workers of this chunk.
        let Some(info) = self.descriptor.piece_lookup.get(&host).copied() else {
            debug!("host has no piece of this chunk");
            return Registration::Retired;
        };

        let mut state = self.lock_state();
        let retire_reason = if state.failed {
            Some("chunk failed")
        } else if state.pieces_completed >= min_pieces {
            Some("chunk has enough pieces")
        } else if download_finished {
            Some("download already finished")
        } else if state.pieces_filled[info.index] || state.piece_claimed[info.index] {
            Some("piece already fetched or being fetched")
        } else {
            None
        };

        if let Some(reason) = retire_reason {
            debug!(reason, "retiring worker");
            return self.retire_worker(state, host);
        }

        if state.pieces_registered >= min_pieces + self.descriptor.params.overdrive {
            if !state.standby_workers.contains(&host) {
                debug!("enough pieces in flight, worker on standby");
                state.standby_workers.push_back(host);
            }
            return Registration::Standby;
        }

        state.piece_claimed.set(info.index, true);
        state.pieces_registered += 1;
        debug!(
            piece_index = info.index,
            registered = state.pieces_registered,
            "piece claimed"
        );
        Registration::Fetch(info)
    }

    fn retire_worker(&self, mut state: MutexGuard<'_, ChunkState>, host: HostId) -> Registration {
        if let Some(err) = self.finish_worker(&mut state, host, true) {
            drop(state);
            self.report_failure(&err);
        }
        Registration::Retired
    }

    /// stores a fetched (still encrypted) piece. the piece that meets the threshold spawns the
    /// recovery on the blocking pool of the current tokio runtime, outside of one every piece
    /// is discarded untouched.
    #[instrument(name = "record piece", level = "debug", skip(self, data), fields(chunk_index = self.descriptor.params.chunk_index))]
    pub fn record_piece(self: &Arc<Self>, host: HostId, data: Vec<u8>) -> PieceOutcome {
        let Some(info) = self.descriptor.piece_lookup.get(&host).copied() else {
            warn!("piece from a host without a piece of this chunk");
            return PieceOutcome::Discarded;
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(
                piece_index = info.index,
                "piece recorded outside a tokio runtime, recovery could not be started"
            );
            return PieceOutcome::Discarded;
        };

        let min_pieces = self.min_pieces();
        let mut state = self.lock_state();

        if state.failed {
            debug!(piece_index = info.index, "chunk failed, discarding piece");
            return PieceOutcome::Discarded;
        }

        if state.pieces_filled[info.index] {
            debug!(piece_index = info.index, "duplicate piece, discarding");
            return PieceOutcome::Discarded;
        }

        if state.piece_claimed[info.index] {
            state.piece_claimed.set(info.index, false);
        } else {
            trace!(piece_index = info.index, "piece delivered without a claim");
            state.pieces_registered += 1;
        }
        state.pieces_filled.set(info.index, true);
        state.pieces_completed += 1;

        if state.pieces_completed > min_pieces {
            trace!(piece_index = info.index, "surplus piece, discarding");
            return PieceOutcome::Surplus;
        }

        state.piece_buffers[info.index] = Some(data);
        debug!(
            piece_index = info.index,
            completed = state.pieces_completed,
            "piece stored"
        );

        if state.pieces_completed < min_pieces {
            return PieceOutcome::Stored;
        }
        drop(state);

        info!("piece threshold reached, recovering chunk");
        let chunk = Arc::clone(self);
        let span = Span::current();
        PieceOutcome::RecoveryStarted(runtime.spawn_blocking(move || {
            span.in_scope(|| chunk.recover_logical_data())
        }))
    }

    /// a worker stopped working on this chunk. a failed fetch gives its piece claim back.
    /// returns the standby workers that have to be put to work now.
    #[instrument(name = "worker done", level = "debug", skip(self), fields(chunk_index = self.descriptor.params.chunk_index))]
    pub fn mark_worker_done(&self, host: HostId, success: bool) -> Vec<HostId> {
        if !self.descriptor.piece_lookup.contains_key(&host) {
            warn!("worker done for a host without a piece of this chunk");
            return Vec::new();
        }

        let mut state = self.lock_state();
        if let Some(err) = self.finish_worker(&mut state, host, success) {
            drop(state);
            self.report_failure(&err);
            return Vec::new();
        }

        state.take_standby(self.min_pieces(), self.descriptor.params.overdrive)
    }

    // returns the error to report if the chunk failed because of it.
    fn finish_worker(
        &self,
        state: &mut ChunkState,
        host: HostId,
        success: bool,
    ) -> Option<anyhow::Error> {
        let min_pieces = self.min_pieces();

        let Some(remaining) = state.workers_remaining.checked_sub(1) else {
            warn!("more workers finished than were assigned to the chunk");
            return None;
        };
        state.workers_remaining = remaining;
        state.standby_workers.retain(|standby| *standby != host);

        if !success {
            if let Some(info) = self.descriptor.piece_lookup.get(&host) {
                if state.piece_claimed[info.index] {
                    debug!(piece_index = info.index, "fetch failed, releasing piece claim");
                    state.piece_claimed.set(info.index, false);
                    state.pieces_registered -= 1;
                }
            }
        }

        if state.failed || !state.unrecoverable(min_pieces) {
            return None;
        }

        let err = anyhow::Error::new(ChunkError::InsufficientPieces {
            completed: state.pieces_completed,
            remaining: state.workers_remaining,
            needed: min_pieces,
        });
        warn!(%err, "not enough workers left to recover chunk");

        self.fail_locked(state).then_some(err)
    }

    /// standby workers that have to be put to work, empty unless active workers fell short.
    pub fn take_standby_workers(&self) -> Vec<HostId> {
        let min_pieces = self.min_pieces();
        self.lock_state()
            .take_standby(min_pieces, self.descriptor.params.overdrive)
    }

    /// fails the chunk and with it the download. piece data is dropped and memory released
    /// before this returns, failing an already finished chunk does nothing.
    #[instrument(name = "fail chunk", level = "info", skip_all, fields(chunk_index = self.descriptor.params.chunk_index))]
    pub fn fail(&self, err: &anyhow::Error) {
        let mut state = self.lock_state();
        if !self.fail_locked(&mut state) {
            debug!(%err, "chunk already finished, ignoring failure");
            return;
        }
        drop(state);

        self.report_failure(err);
    }

    fn fail_locked(&self, state: &mut ChunkState) -> bool {
        if !state.fail(self.descriptor.params.wipe_plaintext) {
            return false;
        }

        if state.recovery_in_flight {
            debug!("recovery in flight, memory is released once it stops");
        } else {
            state.clean_up(self.memory.as_ref());
        }
        true
    }

    // never called with the chunk lock held.
    fn report_failure(&self, err: &anyhow::Error) {
        let chunk_index = self.descriptor.params.chunk_index;
        match self.download.upgrade() {
            Some(download) => download
                .report_chunk_failure(anyhow::anyhow!("chunk {} failed: {:#}", chunk_index, err)),
            None => warn!("download dropped before chunk failure could be reported"),
        }
    }

    /// decrypts and decodes the buffered pieces, then writes the fetched range out. runs at
    /// most once per chunk. the chunk memory is released here, after every buffer is gone.
    #[instrument(name = "recover chunk", level = "info", skip_all, fields(chunk_index = self.descriptor.params.chunk_index))]
    fn recover_logical_data(&self) -> anyhow::Result<()> {
        let params = &self.descriptor.params;

        let mut pieces = {
            let mut state = self.lock_state();
            if state.failed {
                anyhow::bail!("chunk {} failed before recovery started", params.chunk_index);
            }
            state.recovery_in_flight = true;
            state.take_buffers()
        };

        let recovered = self.decode_and_write(&mut pieces);
        clear_pieces(&mut pieces, params.wipe_plaintext);
        drop(pieces);

        let mut state = self.lock_state();
        state.recovery_in_flight = false;

        if let Err(err) = recovered {
            let failed_here = self.fail_locked(&mut state);
            if !failed_here {
                // failed from outside while decoding, the release was left to us.
                state.clean_up(self.memory.as_ref());
            }
            drop(state);

            if failed_here {
                self.report_failure(&err);
            }
            return Err(err);
        }

        if state.failed {
            state.clean_up(self.memory.as_ref());
            anyhow::bail!("chunk {} failed during recovery", params.chunk_index);
        }

        state.recovery_complete = true;
        state.clean_up(self.memory.as_ref());
        drop(state);
        info!("chunk recovered");

        match self.download.upgrade() {
            Some(download) => download.report_chunk_success(params.fetch_length),
            None => {
                warn!("download dropped before chunk success could be reported");
                Ok(())
            }
        }
    }

    // runs without the chunk lock, other chunks write to the same destination.
    fn decode_and_write(&self, pieces: &mut [Option<Vec<u8>>]) -> anyhow::Result<()> {
        let ChunkDescriptor {
            params,
            erasure,
            master_key,
            destination,
            ..
        } = &self.descriptor;

        pieces
            .iter_mut()
            .enumerate()
            .try_for_each(|(index, slot)| -> Result<(), ChunkError> {
                let Some(piece) = slot.as_mut() else {
                    return Ok(());
                };

                let key = derive_piece_key(master_key, params.chunk_index, index);
                *piece = key
                    .decrypt(piece)
                    .map_err(|source| ChunkError::Decrypt { index, source })?;
                Ok(())
            })?;
        debug!("pieces decrypted");

        let mut logical = match erasure.recover(pieces, params.chunk_size) {
            Ok(logical) if logical.len() as u64 == params.chunk_size => logical,
            Ok(logical) => {
                let err = ChunkError::RecoveredSize {
                    expected: params.chunk_size,
                    got: logical.len(),
                };
                return Err(anyhow::Error::new(err).context("unable to recover chunk"));
            }
            Err(err) => {
                return Err(anyhow::Error::new(ChunkError::Recovery(err))
                    .context("unable to recover chunk"));
            }
        };
        debug!(bytes = logical.len(), "chunk decoded");

        if self.lock_state().failed {
            if params.wipe_plaintext {
                logical.zeroize();
            }
            anyhow::bail!("chunk {} failed during recovery", params.chunk_index);
        }

        let start = params.fetch_offset as usize;
        let end = start + params.fetch_length as usize;
        let written = destination
            .write_at(&logical[start..end], params.write_offset)
            .and_then(|n| {
                if n != end - start {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        format!("short write of {} out of {} bytes", n, end - start),
                    ));
                }
                Ok(())
            });
        if params.wipe_plaintext {
            logical.zeroize();
        }
        drop(logical);

        written
            .map_err(ChunkError::Write)
            .context("unable to write to download destination")?;
        debug!(
            offset = params.write_offset,
            length = params.fetch_length,
            "range written"
        );
        Ok(())
    }
}
