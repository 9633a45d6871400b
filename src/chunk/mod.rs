mod descriptor;
mod download_chunk;
mod error;
mod piece_map;
mod state;

pub use descriptor::{ChunkDescriptor, ChunkParams};
pub use download_chunk::{ChunkDownload, ChunkProgress, PieceOutcome, Registration};
pub use error::ChunkError;
pub use piece_map::{ContentHash, HostId, PieceInfo, PieceLookup};

pub type PieceIndex = usize;
