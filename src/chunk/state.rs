use bitvec::vec::BitVec;
use std::collections::VecDeque;
use zeroize::Zeroize;

use super::HostId;
use crate::memory::MemoryManager;
use crate::prelude::*;

/// the mutable half of a chunk download, only ever touched behind the chunk mutex.
#[derive(Debug)]
pub(super) struct ChunkState {
    /// once set no piece is stored and no recovery is started.
    pub failed: bool,
    /// arrived piece bytes, indexed by piece index.
    pub piece_buffers: Vec<Option<Vec<u8>>>,
    /// pieces some worker is fetching right now.
    pub piece_claimed: BitVec,
    /// pieces that were delivered, stays set after the buffer is handed to recovery.
    pub pieces_filled: BitVec,
    pub pieces_completed: usize,
    /// pieces claimed or completed, a failed fetch takes its registration back.
    pub pieces_registered: usize,
    pub workers_remaining: usize,
    pub recovery_complete: bool,
    /// the recovery thread owns the piece buffers, memory is released when it lets go.
    pub recovery_in_flight: bool,
    pub standby_workers: VecDeque<HostId>,
    pub memory_allocated: u64,
    pub memory_released: bool,
}

impl ChunkState {
    pub fn new(num_pieces: usize, workers: usize, memory_allocated: u64) -> Self {
        Self {
            failed: false,
            piece_buffers: vec![None; num_pieces],
            piece_claimed: BitVec::repeat(false, num_pieces),
            pieces_filled: BitVec::repeat(false, num_pieces),
            pieces_completed: 0,
            pieces_registered: 0,
            workers_remaining: workers,
            recovery_complete: false,
            recovery_in_flight: false,
            standby_workers: VecDeque::new(),
            memory_allocated,
            memory_released: false,
        }
    }

    /// hands every buffered piece to the caller, leaving empty slots behind.
    pub fn take_buffers(&mut self) -> Vec<Option<Vec<u8>>> {
        let num_pieces = self.piece_buffers.len();
        std::mem::replace(&mut self.piece_buffers, vec![None; num_pieces])
    }

    pub fn buffered_pieces(&self) -> usize {
        self.piece_buffers.iter().flatten().count()
    }

    /// marks the chunk failed and drops its piece data. false if it was already finished.
    pub fn fail(&mut self, wipe: bool) -> bool {
        if self.failed || self.memory_released {
            return false;
        }

        self.failed = true;
        self.recovery_complete = true;
        self.standby_workers.clear();
        clear_pieces(&mut self.piece_buffers, wipe);
        true
    }

    pub fn unrecoverable(&self, min_pieces: usize) -> bool {
        self.pieces_completed + self.workers_remaining < min_pieces
    }

    /// standby workers to put to work, because active workers dropped below the target.
    pub fn take_standby(&mut self, min_pieces: usize, overdrive: usize) -> Vec<HostId> {
        let complete = self.pieces_completed >= min_pieces;
        let required = !self.failed && !complete && self.pieces_registered < min_pieces + overdrive;
        if !required || self.standby_workers.is_empty() {
            return Vec::new();
        }

        debug!(
            standby = self.standby_workers.len(),
            registered = self.pieces_registered,
            "activating standby workers"
        );
        self.standby_workers.drain(..).collect()
    }

    /// hands the chunk's memory back. runs exactly once, after recovery or failure.
    pub fn clean_up(&mut self, memory: &dyn MemoryManager) {
        assert!(
            self.recovery_complete,
            "chunk cleaned up before recovery completed"
        );
        assert!(
            self.piece_buffers.iter().all(Option::is_none),
            "chunk cleaned up with {} piece buffers still held",
            self.buffered_pieces()
        );
        assert!(!self.memory_released, "chunk memory released twice");
        assert!(
            !self.recovery_in_flight,
            "chunk cleaned up while recovery still holds its buffers"
        );

        trace!(bytes = self.memory_allocated, "returning chunk memory");
        memory.release(self.memory_allocated);
        self.memory_allocated = 0;
        self.memory_released = true;
    }
}

pub(super) fn clear_pieces(pieces: &mut [Option<Vec<u8>>], wipe: bool) {
    for slot in pieces.iter_mut() {
        if let Some(mut piece) = slot.take() {
            if wipe {
                piece.zeroize();
            }
        }
    }
}
