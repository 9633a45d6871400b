mod host;
mod upload;
mod worker;

pub use host::{HostConfig, HostError, LocalHost};
pub use upload::UploadedFile;

use std::sync::Arc;
use std::time::Duration;

use crate::chunk::{ChunkDescriptor, ChunkDownload, ChunkParams};
use crate::download::{Download, DownloadDestination};
use crate::erasure::ErasureCoder;
use crate::memory::{MemoryBudget, MemoryManager};
use crate::prelude::*;
use worker::HostMap;

/// how a file, or a range of it, is fetched back from the swarm.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOptions {
    pub offset: u64,
    /// bytes to fetch from `offset`, the rest of the file when unset.
    pub length: Option<u64>,
    pub overdrive: usize,
    pub latency_target: Duration,
    pub wipe_plaintext: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            offset: 0,
            length: None,
            overdrive: 0,
            latency_target: Duration::from_millis(200),
            wipe_plaintext: false,
        }
    }
}

/// a set of in-memory hosts that files are spread over and fetched back from.
#[derive(Debug)]
pub struct Swarm {
    hosts: Vec<Arc<LocalHost>>,
    by_id: Arc<HostMap>,
}

impl Swarm {
    pub fn new(configs: impl IntoIterator<Item = HostConfig>) -> Self {
        let hosts: Vec<_> = configs
            .into_iter()
            .map(|config| Arc::new(LocalHost::new(config)))
            .collect();
        let by_id = hosts.iter().map(|host| (host.id(), host.clone())).collect();

        Self {
            hosts,
            by_id: Arc::new(by_id),
        }
    }

    pub fn uniform(count: usize, config: HostConfig) -> Self {
        Self::new(std::iter::repeat(config).take(count))
    }

    pub fn hosts(&self) -> &[Arc<LocalHost>] {
        &self.hosts
    }

    pub fn upload_file(
        &self,
        data: &[u8],
        chunk_size: u64,
        erasure: &dyn ErasureCoder,
    ) -> anyhow::Result<UploadedFile> {
        upload::upload_file(data, chunk_size, erasure, &self.hosts)
    }

    /// downloads the requested range of `file` into `destination` and returns once the
    /// download has completed or failed. chunk memory is reserved from `memory` before each
    /// chunk starts.
    #[instrument(name = "fetch file", level = "info", skip_all, fields(offset = options.offset))]
    pub async fn fetch_file(
        &self,
        file: &UploadedFile,
        erasure: Arc<dyn ErasureCoder>,
        memory: Arc<MemoryBudget>,
        destination: Arc<dyn DownloadDestination>,
        options: FetchOptions,
    ) -> anyhow::Result<Arc<Download>> {
        let plan = plan_chunks(file, &options)?;
        let length: u64 = plan.iter().map(|params| params.fetch_length).sum();
        info!(chunks = plan.len(), length, "starting download");

        let download = Download::new(plan.len(), length, destination.clone());
        let mut dispatchers = Vec::with_capacity(plan.len());

        for params in plan {
            if download.is_finished() {
                warn!("download finished before every chunk was started");
                break;
            }

            let chunk_index = params.chunk_index;
            let required = params.memory_required(erasure.min_pieces());
            if params.needs_memory {
                if let Err(err) = memory.request(required).await {
                    download.report_chunk_failure(
                        err.context(format!("unable to reserve memory for chunk {}", chunk_index)),
                    );
                    break;
                }
            }

            let descriptor = ChunkDescriptor {
                params: params.needs_memory(false),
                piece_lookup: file.chunks[chunk_index as usize].clone(),
                erasure: erasure.clone(),
                master_key: file.master_key.clone(),
                destination: destination.clone(),
            };
            let chunk = match ChunkDownload::new(descriptor, memory.clone(), &download) {
                Ok(chunk) => chunk,
                Err(err) => {
                    memory.release(required);
                    download.report_chunk_failure(err);
                    break;
                }
            };

            dispatchers.push(tokio::spawn(worker::dispatch_chunk(
                chunk,
                self.by_id.clone(),
                download.clone(),
            )));
        }

        if let Err(err) = download.wait().await {
            warn!("download failed: {:#}", err);
        }
        for joined in futures::future::join_all(dispatchers).await {
            if let Err(err) = joined {
                error!(%err, "chunk dispatcher panicked");
            }
        }

        Ok(download)
    }
}

/// parameters of every chunk overlapping the requested range. the range is written to the
/// destination starting at offset zero.
fn plan_chunks(file: &UploadedFile, options: &FetchOptions) -> anyhow::Result<Vec<ChunkParams>> {
    let offset = options.offset;
    let length = options
        .length
        .unwrap_or_else(|| file.length.saturating_sub(offset));
    let end = offset
        .checked_add(length)
        .filter(|end| *end <= file.length)
        .with_context(|| {
            format!(
                "range {}+{} is outside of a {} byte file",
                offset, length, file.length
            )
        })?;

    if length == 0 {
        return Ok(Vec::new());
    }

    let chunk_size = file.chunk_size;
    let first = offset / chunk_size;
    let last = (end - 1) / chunk_size;

    let plan = (first..=last)
        .map(|chunk_index| {
            let chunk_start = chunk_index * chunk_size;
            let fetch_start = offset.max(chunk_start);
            let fetch_end = end.min(chunk_start + chunk_size);

            ChunkParams::new(chunk_index, chunk_size, file.piece_size)
                .with_fetch_range(fetch_start - chunk_start, fetch_end - fetch_start)
                .with_write_offset(fetch_start - offset)
                .with_overdrive(options.overdrive)
                .with_latency_target(options.latency_target)
                .with_priority(last - chunk_index)
                .needs_memory(true)
                .wipe_plaintext(options.wipe_plaintext)
        })
        .collect();

    Ok(plan)
}
