use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use super::LocalHost;
use crate::chunk::{ChunkDownload, HostId, PieceOutcome, Registration};
use crate::download::Download;
use crate::prelude::*;

pub(super) type HostMap = HashMap<HostId, Arc<LocalHost>>;

/// fetches the piece one host holds of one chunk.
#[derive(Debug)]
struct ChunkWorker {
    chunk: Arc<ChunkDownload>,
    host: Arc<LocalHost>,
    activations: mpsc::UnboundedSender<HostId>,
}

impl ChunkWorker {
    #[instrument(
        name = "chunk worker",
        level = "debug",
        skip_all,
        fields(chunk_index = self.chunk.params().chunk_index, host = %self.host.id())
    )]
    async fn run(self) {
        let host_id = self.host.id();
        let params = self.chunk.params();

        let info = match self.chunk.register_worker(host_id) {
            Registration::Fetch(info) => info,
            Registration::Standby => {
                debug!("worker parked on standby");
                return;
            }
            Registration::Retired => {
                trace!("worker retired");
                return;
            }
        };

        let started = Instant::now();
        let fetched = self.host.fetch(params.chunk_index).await;
        if started.elapsed() > params.latency_target {
            debug!(elapsed = ?started.elapsed(), "fetch missed the latency target");
        }

        let mut recovery = None;
        let success = match fetched {
            Ok(piece) if info.matches(&piece) => {
                match self.chunk.record_piece(host_id, piece) {
                    PieceOutcome::RecoveryStarted(handle) => recovery = Some(handle),
                    outcome => trace!(?outcome, "piece recorded"),
                }
                true
            }
            Ok(_) => {
                warn!(piece_index = info.index, "piece does not match its hash");
                false
            }
            Err(err) => {
                warn!(%err, piece_index = info.index, "piece fetch failed");
                false
            }
        };

        for standby in self.chunk.mark_worker_done(host_id, success) {
            if self.activations.send(standby).is_err() {
                debug!("chunk dispatcher stopped, dropping standby activation");
            }
        }

        let Some(handle) = recovery else {
            return;
        };
        match handle.await {
            Ok(Ok(())) => {}
            // the download has already been failed by the chunk.
            Ok(Err(err)) => warn!("chunk recovery failed: {:#}", err),
            Err(err) => error!(%err, "chunk recovery task panicked"),
        }
    }
}

/// starts a worker for every host of the chunk, then re-starts standby workers as the chunk
/// activates them, until the download finishes.
#[instrument(name = "dispatch chunk", level = "debug", skip_all, fields(chunk_index = chunk.params().chunk_index))]
pub(super) async fn dispatch_chunk(
    chunk: Arc<ChunkDownload>,
    hosts: Arc<HostMap>,
    download: Arc<Download>,
) {
    let (activations_tx, mut activations_rx) = mpsc::unbounded_channel();

    let host_ids: Vec<HostId> = chunk.piece_lookup().keys().copied().collect();
    for host_id in host_ids {
        spawn_worker(&chunk, &hosts, host_id, &activations_tx);
    }

    loop {
        tokio::select! {
            Some(host_id) = activations_rx.recv() => {
                debug!(host = %host_id, "activating standby worker");
                spawn_worker(&chunk, &hosts, host_id, &activations_tx);
            }
            _ = download.wait() => break,
        }
    }
    trace!("download finished, dispatcher stopping");
}

fn spawn_worker(
    chunk: &Arc<ChunkDownload>,
    hosts: &HostMap,
    host_id: HostId,
    activations: &mpsc::UnboundedSender<HostId>,
) {
    let Some(host) = hosts.get(&host_id) else {
        // the worker can never report, count it as a failed fetch right away.
        warn!(host = %host_id, "piece lookup names a host outside the swarm");
        for standby in chunk.mark_worker_done(host_id, false) {
            let _ = activations.send(standby);
        }
        return;
    };

    let worker = ChunkWorker {
        chunk: Arc::clone(chunk),
        host: Arc::clone(host),
        activations: activations.clone(),
    };
    tokio::spawn(worker.run());
}
