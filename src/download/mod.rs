mod destination;

pub use destination::{BufferDestination, DownloadDestination, FileDestination};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Active,
    Complete,
    Failed,
}

#[derive(Debug)]
struct DownloadState {
    chunks_remaining: usize,
    status: DownloadStatus,
    err: Option<Arc<anyhow::Error>>,
    end_time: Option<Instant>,
    destination_closed: bool,
}

/// tracks every chunk of one requested download, the download finishes when the last chunk
/// reports success or the first chunk reports failure.
pub struct Download {
    state: Mutex<DownloadState>,
    bytes_received: AtomicU64,
    completion: CancellationToken,
    destination: Arc<dyn DownloadDestination>,
    length: u64,
    start_time: Instant,
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download")
            .field("state", &self.state)
            .field("bytes_received", &self.bytes_received)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

impl Download {
    pub fn new(chunks: usize, length: u64, destination: Arc<dyn DownloadDestination>) -> Arc<Self> {
        let download = Arc::new(Self {
            state: Mutex::new(DownloadState {
                chunks_remaining: chunks,
                status: DownloadStatus::Active,
                err: None,
                end_time: None,
                destination_closed: false,
            }),
            bytes_received: AtomicU64::new(0),
            completion: CancellationToken::new(),
            destination,
            length,
            start_time: Instant::now(),
        });

        if chunks == 0 {
            info!("download has no chunks, completing immediately");
            download.lock_state().destination_closed = true;
            if let Err(err) = download.complete() {
                warn!("{:#}", err);
            }
        }

        download
    }

    fn lock_state(&self) -> MutexGuard<'_, DownloadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[instrument(level = "debug", skip(self))]
    pub fn report_chunk_success(&self, bytes_written: u64) -> anyhow::Result<()> {
        let mut state = self.lock_state();
        state.chunks_remaining = state
            .chunks_remaining
            .checked_sub(1)
            .context("chunk success reported after every chunk already completed")?;
        self.bytes_received.fetch_add(bytes_written, Ordering::Relaxed);
        debug!(chunks_remaining = state.chunks_remaining, "chunk complete");

        if state.chunks_remaining > 0 {
            return Ok(());
        }

        if state.status != DownloadStatus::Active {
            debug!("last chunk reported after the download already failed");
            return Ok(());
        }

        if !take_close(&mut state) {
            return Ok(());
        }
        drop(state);

        info!("all chunks received, completing download");
        self.complete()
    }

    /// fails the download. the destination is closed on the blocking pool when a runtime is
    /// available, waiters wake up once it is closed.
    #[instrument(level = "debug", skip_all)]
    pub fn report_chunk_failure(&self, err: anyhow::Error) {
        let mut state = self.lock_state();
        if state.status != DownloadStatus::Active {
            debug!(%err, "download already finished, dropping chunk failure");
            return;
        }

        error!(%err, "chunk failed, failing download");
        state.status = DownloadStatus::Failed;
        state.err = Some(Arc::new(err));
        state.end_time = Some(Instant::now());

        let close = take_close(&mut state);
        drop(state);

        if !close {
            // the last success is closing it and fires the completion.
            return;
        }

        let destination = self.destination.clone();
        let completion = self.completion.clone();
        let close_and_signal = move || {
            if let Err(close_err) = destination.close() {
                warn!(%close_err, "unable to close destination of failed download");
            }
            completion.cancel();
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(close_and_signal);
            }
            Err(_) => close_and_signal(),
        }
    }

    // closes the destination before the completion fires, waiters can read the output as
    // soon as they wake up. only called after `take_close` and without the state lock.
    fn complete(&self) -> anyhow::Result<()> {
        let closed = self.destination.close();

        let mut state = self.lock_state();
        let result = match closed {
            Ok(()) => {
                if state.status == DownloadStatus::Active {
                    state.status = DownloadStatus::Complete;
                    state.end_time = Some(Instant::now());
                }
                Ok(())
            }
            Err(err) => {
                error!(%err, "unable to close download destination");
                let err = anyhow::Error::new(err).context("unable to close download destination");
                let message = format!("{:#}", err);
                if state.status == DownloadStatus::Active {
                    state.status = DownloadStatus::Failed;
                    state.err = Some(Arc::new(err));
                    state.end_time = Some(Instant::now());
                }
                Err(anyhow::anyhow!(message))
            }
        };
        drop(state);

        self.completion.cancel();
        result
    }

    /// resolves once the download completes or fails, any number of callers may wait.
    pub async fn wait(&self) -> Result<(), Arc<anyhow::Error>> {
        self.completion.cancelled().await;
        match &self.lock_state().err {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    pub fn status(&self) -> DownloadStatus {
        self.lock_state().status
    }

    /// true once the download left `Active`, waiters may still be waiting on the close.
    pub fn is_finished(&self) -> bool {
        self.status() != DownloadStatus::Active
    }

    pub fn err(&self) -> Option<Arc<anyhow::Error>> {
        self.lock_state().err.clone()
    }

    pub fn chunks_remaining(&self) -> usize {
        self.lock_state().chunks_remaining
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// time from creation until the download finished, `None` while still active.
    pub fn elapsed(&self) -> Option<Duration> {
        self.lock_state()
            .end_time
            .map(|end| end.duration_since(self.start_time))
    }
}

// claims the single close of the destination.
fn take_close(state: &mut DownloadState) -> bool {
    !std::mem::replace(&mut state.destination_closed, true)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::RecordingDestination;
    use rstest::{fixture, rstest};

    #[fixture]
    fn destination() -> Arc<RecordingDestination> {
        Arc::new(RecordingDestination::new())
    }

    #[rstest]
    #[tokio::test]
    async fn test_last_chunk_completes_download(
        destination: Arc<RecordingDestination>,
    ) -> anyhow::Result<()> {
        let download = Download::new(3, 30, destination.clone());

        download.report_chunk_success(10)?;
        download.report_chunk_success(10)?;
        assert_eq!(download.chunks_remaining(), 1);
        assert!(!download.is_finished());
        assert_eq!(destination.close_calls(), 0);

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let download = download.clone();
                tokio::spawn(async move { download.wait().await })
            })
            .collect();

        download.report_chunk_success(10)?;
        assert_eq!(download.chunks_remaining(), 0);

        for waiter in waiters {
            assert!(waiter.await?.is_ok());
        }
        assert_eq!(download.status(), DownloadStatus::Complete);
        assert_eq!(download.bytes_received(), 30);
        assert_eq!(destination.close_calls(), 1);
        assert!(download.elapsed().is_some());
        Ok(())
    }

    #[rstest]
    #[tokio::test]
    async fn test_failure_closes_destination_once(destination: Arc<RecordingDestination>) {
        let download = Download::new(3, 30, destination.clone());

        download.report_chunk_failure(anyhow::anyhow!("chunk 1 failed"));
        download.report_chunk_failure(anyhow::anyhow!("chunk 2 failed"));
        download
            .report_chunk_success(10)
            .expect("late successes are accepted");

        let err = download.wait().await.unwrap_err();
        assert_eq!(err.to_string(), "chunk 1 failed");
        assert_eq!(download.status(), DownloadStatus::Failed);
        assert_eq!(destination.close_calls(), 1);
    }

    #[rstest]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failure_closes_off_the_reporting_thread() {
        let gate = Arc::new(std::sync::Barrier::new(2));
        let destination = Arc::new(RecordingDestination::gated_close(gate.clone()));
        let download = Download::new(2, 20, destination.clone());

        // returns while the close is still held at the gate.
        download.report_chunk_failure(anyhow::anyhow!("chunk 0 failed"));
        assert_eq!(download.status(), DownloadStatus::Failed);
        assert!(download.is_finished());
        assert!(
            tokio::time::timeout(Duration::from_millis(20), download.wait())
                .await
                .is_err(),
            "waiters wake up only after the destination is closed"
        );
        assert_eq!(destination.close_calls(), 0);

        tokio::task::block_in_place(|| gate.wait());
        assert!(download.wait().await.is_err());
        assert_eq!(destination.close_calls(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn test_close_error_fails_download() {
        let destination = Arc::new(RecordingDestination::failing_close());
        let download = Download::new(1, 4, destination.clone());

        assert!(download.report_chunk_success(4).is_err());
        assert!(download.wait().await.is_err());
        assert_eq!(download.status(), DownloadStatus::Failed);
        assert_eq!(destination.close_calls(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn test_empty_download(destination: Arc<RecordingDestination>) {
        let download = Download::new(0, 0, destination.clone());

        assert!(download.wait().await.is_ok());
        assert_eq!(destination.close_calls(), 1);
        assert!(download.report_chunk_success(1).is_err());
    }
}
