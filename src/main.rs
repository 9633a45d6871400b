mod chunk;
mod cli;
mod crypto;
mod download;
mod erasure;
mod memory;
mod prelude;
mod swarm;

#[cfg(test)]
mod testing;

use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use cli::Cli;
use download::FileDestination;
use erasure::{ErasureCoder, ReedSolomonCoder};
use memory::MemoryBudget;
use prelude::*;
use swarm::{FetchOptions, HostConfig, Swarm};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let source = cli.source.as_ref();
    let data = std::fs::read(source)
        .with_context(|| format!("unable to read {}", source.display()))?;

    let erasure = Arc::new(ReedSolomonCoder::new(cli.data_pieces, cli.parity_pieces)?);
    let hosts = cli.hosts.unwrap_or(erasure.num_pieces());
    let swarm = Swarm::uniform(hosts, HostConfig::new(cli.latency(), cli.failure_rate));

    let file = swarm.upload_file(&data, cli.chunk_size, erasure.as_ref())?;

    // start from an empty output, positioned writes never truncate.
    std::fs::File::create(&cli.output)
        .with_context(|| format!("unable to create {}", cli.output.display()))?;
    let destination = Arc::new(FileDestination::create(&cli.output)?);
    let memory = Arc::new(MemoryBudget::new(cli.memory_budget));

    let options = FetchOptions {
        offset: cli.offset,
        length: cli.length,
        overdrive: cli.overdrive,
        latency_target: cli.latency_target(),
        wipe_plaintext: cli.wipe,
    };
    let download = swarm
        .fetch_file(&file, erasure, memory, destination, options)
        .await?;

    if let Err(err) = download.wait().await {
        anyhow::bail!("download failed: {:#}", err);
    }

    let start = cli.offset as usize;
    let expected = &data[start..start + download.length() as usize];
    let written = std::fs::read(&cli.output)
        .with_context(|| format!("unable to read back {}", cli.output.display()))?;
    if written != expected {
        anyhow::bail!("fetched data does not match {}", source.display());
    }

    let elapsed = download.elapsed().unwrap_or_default();
    info!(
        bytes = download.bytes_received(),
        chunks = file.num_chunks(),
        hosts,
        ?elapsed,
        "download verified"
    );
    println!(
        "fetched {} bytes of {} from {} hosts in {:.2?}, output matches",
        download.bytes_received(),
        source.display(),
        hosts,
        elapsed
    );

    Ok(())
}
