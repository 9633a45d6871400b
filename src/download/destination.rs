use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

/// where recovered chunks are written, chunks of one download write to it concurrently at
/// disjoint offsets.
pub trait DownloadDestination: Send + Sync {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;

    /// called exactly once, after the last write of the download.
    fn close(&self) -> io::Result<()>;
}

/// keeps the download in memory, growing to fit whatever offset is written.
#[derive(Debug, Default)]
pub struct BufferDestination {
    buf: Mutex<Vec<u8>>,
    closed: Mutex<bool>,
}

impl BufferDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.buf.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DownloadDestination for BufferDestination {
    fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write to closed buffer destination",
            ));
        }

        let start = usize::try_from(offset)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let end = start + data.len();

        let mut buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[start..end].copy_from_slice(data);

        Ok(data.len())
    }

    fn close(&self) -> io::Result<()> {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner) = true;
        Ok(())
    }
}

/// writes the download into a file, existing contents outside the written ranges are kept.
/// writes are positioned, chunks write concurrently without a shared cursor.
#[derive(Debug)]
pub struct FileDestination {
    file: File,
    closed: AtomicBool,
}

impl FileDestination {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        Ok(Self {
            file,
            closed: AtomicBool::new(false),
        })
    }
}

impl DownloadDestination for FileDestination {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write to closed file destination",
            ));
        }

        write_all_at(&self.file, buf, offset)?;
        Ok(buf.len())
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "file destination closed twice",
            ));
        }
        self.file.sync_all()
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset)? {
            0 => return Err(io::ErrorKind::WriteZero.into()),
            n => {
                buf = &buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn test_buffer_out_of_order_writes() -> io::Result<()> {
        let dest = BufferDestination::new();
        dest.write_at(b"world", 5)?;
        dest.write_at(b"hello", 0)?;
        dest.close()?;

        assert_eq!(dest.bytes(), b"helloworld");
        assert!(dest.is_closed());
        assert!(dest.write_at(b"!", 10).is_err());
        Ok(())
    }

    #[rstest]
    fn test_file_positioned_writes() -> anyhow::Result<()> {
        let path = std::env::temp_dir().join(format!(
            "shardfetch-destination-{}.bin",
            rand::random::<u64>()
        ));
        let dest = FileDestination::create(&path)?;

        dest.write_at(b"cd", 2)?;
        dest.write_at(b"ab", 0)?;
        dest.close()?;
        assert!(dest.close().is_err());

        assert_eq!(std::fs::read(&path)?, b"abcd");
        assert!(dest.write_at(b"e", 4).is_err());
        std::fs::remove_file(&path)?;
        Ok(())
    }

    #[rstest]
    fn test_file_concurrent_writes() -> anyhow::Result<()> {
        let path = std::env::temp_dir().join(format!(
            "shardfetch-destination-{}.bin",
            rand::random::<u64>()
        ));
        let dest = FileDestination::create(&path)?;

        std::thread::scope(|scope| {
            for block in 0..8u8 {
                let dest = &dest;
                scope.spawn(move || dest.write_at(&[block; 16], block as u64 * 16));
            }
        });
        dest.close()?;

        let expected: Vec<u8> = (0..8u8).flat_map(|block| [block; 16]).collect();
        assert_eq!(std::fs::read(&path)?, expected);
        std::fs::remove_file(&path)?;
        Ok(())
    }
}
