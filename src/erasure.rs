use reed_solomon_erasure::galois_8::ReedSolomon;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ErasureError {
    #[error("need {needed} pieces to recover, only {present} present")]
    NotEnoughPieces { needed: usize, present: usize },

    #[error("expected {expected} piece slots, got {got}")]
    SlotCountMismatch { expected: usize, got: usize },

    #[error("piece {index} is {got} bytes, expected {expected}")]
    InconsistentPieceSize {
        index: usize,
        expected: usize,
        got: usize,
    },

    #[error("recovered {available} bytes, {requested} requested")]
    SizeOverflow { available: usize, requested: u64 },

    #[error(transparent)]
    ReedSolomon(#[from] reed_solomon_erasure::Error),
}

/// an erasure code over the pieces of a chunk, `recover` must be a pure function of its inputs.
pub trait ErasureCoder: Send + Sync {
    /// pieces needed to reconstruct a chunk.
    fn min_pieces(&self) -> usize;

    /// pieces produced per chunk.
    fn num_pieces(&self) -> usize;

    fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, ErasureError>;

    /// rebuilds the first `size` logical bytes, `None` slots are missing pieces and may be
    /// filled in as a side effect.
    fn recover(&self, pieces: &mut [Option<Vec<u8>>], size: u64) -> Result<Vec<u8>, ErasureError>;
}

#[derive(Debug)]
pub struct ReedSolomonCoder {
    data: usize,
    parity: usize,
    rs: ReedSolomon,
}

impl ReedSolomonCoder {
    pub fn new(data: usize, parity: usize) -> Result<Self, ErasureError> {
        Ok(Self {
            data,
            parity,
            rs: ReedSolomon::new(data, parity)?,
        })
    }

    /// size of each piece when a chunk of `chunk_size` bytes is encoded.
    pub fn piece_size(&self, chunk_size: usize) -> usize {
        chunk_size.div_ceil(self.data).max(1)
    }
}

impl ErasureCoder for ReedSolomonCoder {
    fn min_pieces(&self) -> usize {
        self.data
    }

    fn num_pieces(&self) -> usize {
        self.data + self.parity
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, ErasureError> {
        let piece_size = self.piece_size(data.len());
        let mut pieces = vec![vec![0u8; piece_size]; self.num_pieces()];

        for (piece, segment) in pieces.iter_mut().zip(data.chunks(piece_size)) {
            piece[..segment.len()].copy_from_slice(segment);
        }

        self.rs.encode(&mut pieces)?;
        Ok(pieces)
    }

    fn recover(&self, pieces: &mut [Option<Vec<u8>>], size: u64) -> Result<Vec<u8>, ErasureError> {
        if pieces.len() != self.num_pieces() {
            return Err(ErasureError::SlotCountMismatch {
                expected: self.num_pieces(),
                got: pieces.len(),
            });
        }

        let present = pieces.iter().flatten().count();
        if present < self.data {
            return Err(ErasureError::NotEnoughPieces {
                needed: self.data,
                present,
            });
        }

        // reed-solomon only checks sizes against each other, catch it here with the index.
        let piece_size = pieces.iter().flatten().map(Vec::len).next().unwrap_or(0);
        if let Some((index, got)) = pieces
            .iter()
            .enumerate()
            .filter_map(|(index, piece)| piece.as_ref().map(|p| (index, p.len())))
            .find(|(_, got)| *got != piece_size)
        {
            return Err(ErasureError::InconsistentPieceSize {
                index,
                expected: piece_size,
                got,
            });
        }

        self.rs.reconstruct_data(pieces)?;

        let available = piece_size * self.data;
        let size = usize::try_from(size)
            .ok()
            .filter(|size| *size <= available)
            .ok_or(ErasureError::SizeOverflow {
                available,
                requested: size,
            })?;

        let mut logical = Vec::with_capacity(available);
        for piece in pieces.iter().take(self.data).flatten() {
            logical.extend_from_slice(piece);
        }
        logical.truncate(size);

        Ok(logical)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::RngCore;
    use rstest::{fixture, rstest};

    #[fixture]
    fn coder() -> ReedSolomonCoder {
        ReedSolomonCoder::new(4, 2).expect("4+2 is a valid reed solomon config")
    }

    fn random_bytes(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    #[rstest]
    #[case(&[], 101)]
    #[case(&[0, 5], 64)]
    #[case(&[1, 2], 1)]
    #[case(&[4, 5], 4000)]
    fn test_recover_with_missing_pieces(
        coder: ReedSolomonCoder,
        #[case] missing: &[usize],
        #[case] size: usize,
    ) -> anyhow::Result<()> {
        let data = random_bytes(size);
        let mut pieces: Vec<_> = coder.encode(&data)?.into_iter().map(Some).collect();
        for index in missing {
            pieces[*index] = None;
        }

        let recovered = coder.recover(&mut pieces, size as u64)?;
        assert_eq!(recovered, data);
        Ok(())
    }

    #[rstest]
    fn test_recover_too_few(coder: ReedSolomonCoder) -> anyhow::Result<()> {
        let mut pieces: Vec<_> = coder.encode(&random_bytes(40))?.into_iter().map(Some).collect();
        pieces[0] = None;
        pieces[1] = None;
        pieces[2] = None;

        let err = coder.recover(&mut pieces, 40).unwrap_err();
        assert!(matches!(
            err,
            ErasureError::NotEnoughPieces {
                needed: 4,
                present: 3
            }
        ));
        Ok(())
    }

    #[rstest]
    fn test_recover_inconsistent_sizes(coder: ReedSolomonCoder) -> anyhow::Result<()> {
        let mut pieces: Vec<_> = coder.encode(&random_bytes(40))?.into_iter().map(Some).collect();
        if let Some(piece) = pieces[3].as_mut() {
            piece.push(0);
        }

        let err = coder.recover(&mut pieces, 40).unwrap_err();
        assert!(matches!(
            err,
            ErasureError::InconsistentPieceSize { index: 3, .. }
        ));
        Ok(())
    }

    #[rstest]
    fn test_recover_size_larger_than_pieces(coder: ReedSolomonCoder) -> anyhow::Result<()> {
        let mut pieces: Vec<_> = coder.encode(&random_bytes(40))?.into_iter().map(Some).collect();

        let err = coder.recover(&mut pieces, 41).unwrap_err();
        assert!(matches!(err, ErasureError::SizeOverflow { .. }));
        Ok(())
    }
}
