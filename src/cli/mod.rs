use clap::{self, Parser};
use std::path::PathBuf;
use std::time::Duration;

mod source_file_path;
pub use source_file_path::SourceFilePath;

#[derive(Parser, Debug)]
#[command(author, about, long_about = None)]
/// uploads a file to a simulated swarm of hosts as encrypted erasure coded pieces, then
/// fetches it back and checks the result.
pub struct Cli {
    #[arg(required = true)]
    /// the file to upload and fetch back.
    pub source: SourceFilePath,

    #[arg(short, long, default_value = "shardfetch.out")]
    /// where the fetched range is written, an existing file is overwritten.
    pub output: PathBuf,

    #[arg(long, default_value = "10")]
    /// pieces needed to recover a chunk.
    pub data_pieces: usize,

    #[arg(long, default_value = "20")]
    /// redundant pieces per chunk.
    pub parity_pieces: usize,

    #[arg(long, default_value = "4194304")]
    /// bytes per chunk.
    pub chunk_size: u64,

    #[arg(long)]
    /// hosts in the swarm, defaults to one per piece.
    pub hosts: Option<usize>,

    #[arg(long, default_value = "0")]
    /// pieces fetched beyond the minimum to hide slow hosts.
    pub overdrive: usize,

    #[arg(long, default_value = "0.1", value_parser = parse_probability)]
    /// probability that a host fails a fetch.
    pub failure_rate: f64,

    #[arg(long, default_value = "20")]
    /// mean host latency in milliseconds.
    pub latency_ms: u64,

    #[arg(long, default_value = "200")]
    /// fetches slower than this, in milliseconds, are logged.
    pub latency_target_ms: u64,

    #[arg(long, default_value = "268435456")]
    /// bytes of piece buffers that may be held at once.
    pub memory_budget: u64,

    #[arg(long)]
    /// zero decrypted pieces and recovered chunks before freeing them.
    pub wipe: bool,

    #[arg(long, default_value = "0")]
    /// first byte of the source to fetch.
    pub offset: u64,

    #[arg(long)]
    /// bytes to fetch, the rest of the file when unset.
    pub length: Option<u64>,
}

impl Cli {
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }

    pub fn latency_target(&self) -> Duration {
        Duration::from_millis(self.latency_target_ms)
    }
}

fn parse_probability(s: &str) -> Result<f64, String> {
    let value: f64 = s.parse().map_err(|err| format!("{}", err))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(format!("{} is not between 0 and 1", value));
    }
    Ok(value)
}
