use rand::Rng;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

use crate::chunk::HostId;
use crate::prelude::*;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("host {0} is unavailable")]
    Unavailable(HostId),

    #[error("host {host} stores no piece of chunk {chunk_index}")]
    MissingPiece { host: HostId, chunk_index: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostConfig {
    /// mean time a fetch takes, each fetch is jittered by up to half of it.
    pub latency: Duration,
    /// probability that a single fetch fails.
    pub failure_rate: f64,
}

impl HostConfig {
    pub fn new(latency: Duration, failure_rate: f64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure rate {} is not a probability",
            failure_rate
        );
        Self {
            latency,
            failure_rate,
        }
    }

    pub fn reliable() -> Self {
        Self::new(Duration::ZERO, 0.0)
    }

    pub fn offline() -> Self {
        Self::new(Duration::ZERO, 1.0)
    }
}

/// a storage host kept in memory, serving one sealed piece per chunk it was given.
#[derive(Debug)]
pub struct LocalHost {
    id: HostId,
    config: HostConfig,
    pieces: Mutex<HashMap<u64, Vec<u8>>>,
}

impl LocalHost {
    pub fn new(config: HostConfig) -> Self {
        Self {
            id: HostId::random(),
            config,
            pieces: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> HostId {
        self.id
    }

    pub fn config(&self) -> HostConfig {
        self.config
    }

    pub fn store(&self, chunk_index: u64, piece: Vec<u8>) {
        self.pieces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(chunk_index, piece);
    }

    pub fn stored_pieces(&self) -> usize {
        self.pieces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// flips a byte of the stored piece, the next fetch serves data that fails verification.
    pub fn corrupt(&self, chunk_index: u64) -> bool {
        let mut pieces = self.pieces.lock().unwrap_or_else(PoisonError::into_inner);
        match pieces.get_mut(&chunk_index).and_then(|piece| piece.first_mut()) {
            Some(byte) => {
                *byte ^= 0xff;
                true
            }
            None => false,
        }
    }

    #[instrument(name = "fetch piece", level = "trace", skip(self), fields(host = %self.id))]
    pub async fn fetch(&self, chunk_index: u64) -> Result<Vec<u8>, HostError> {
        if !self.config.latency.is_zero() {
            let latency = self
                .config
                .latency
                .mul_f64(rand::thread_rng().gen_range(0.5..1.5));
            tokio::time::sleep(latency).await;
        }

        if rand::thread_rng().gen_bool(self.config.failure_rate) {
            trace!("host failed the fetch");
            return Err(HostError::Unavailable(self.id));
        }

        self.pieces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&chunk_index)
            .cloned()
            .ok_or(HostError::MissingPiece {
                host: self.id,
                chunk_index,
            })
    }
}
