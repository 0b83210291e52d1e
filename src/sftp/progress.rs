//! Progress reporting and transfer endpoints
//!
//! A job reports to a [`ProgressSink`]: the label of the file in flight, the
//! bytes completed so far, and exactly one terminal signal (`close` on success
//! or `cancel` on failure). Single-file jobs stream through a
//! [`TransferSource`] or [`TransferSink`], which are progress sinks that also
//! produce or consume chunks.

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use super::error::SftpError;
use super::local::LocalFileHandle;
use super::types::{OpenMode, TransferDirection};

/// Receiver of a job's progress
pub trait ProgressSink: Send {
    /// Name of the file currently being transferred, relative to the job root
    fn update_label(&mut self, label: &str);

    /// Add `bytes` to the running total; called once per transferred chunk
    fn add_completed_bytes(&mut self, bytes: u64);

    /// Local file backing this endpoint, if any
    fn local_path(&self) -> Option<&Path> {
        None
    }

    /// The job finished successfully
    fn close(&mut self);

    /// The job failed or was cancelled
    fn cancel(&mut self);
}

/// Sequential producer of chunks. An empty chunk means end of data.
#[async_trait]
pub trait ChunkReader: Send {
    async fn read_chunk(&mut self) -> Result<Bytes, SftpError>;
}

/// Sequential consumer of chunks. Returns once the whole chunk is written.
#[async_trait]
pub trait ChunkWriter: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), SftpError>;
}

/// Data provider of a single-file upload
pub trait TransferSource: ProgressSink + ChunkReader {}

impl<T: ProgressSink + ChunkReader> TransferSource for T {}

/// Data consumer of a single-file download
pub trait TransferSink: ProgressSink + ChunkWriter {}

impl<T: ProgressSink + ChunkWriter> TransferSink for T {}

/// Progress sink that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn update_label(&mut self, _label: &str) {}

    fn add_completed_bytes(&mut self, _bytes: u64) {}

    fn close(&mut self) {}

    fn cancel(&mut self) {}
}

/// Transfer state reported to the frontend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    InProgress,
    Completed,
    Cancelled,
}

/// Progress snapshot emitted by [`EventProgress`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferProgress {
    pub id: String,
    pub direction: TransferDirection,
    /// File currently in flight
    pub label: String,
    pub transferred_bytes: u64,
    pub state: TransferState,
    /// Bytes per second since the job started
    pub speed: u64,
}

/// Progress sink that forwards snapshots over a channel, for a UI to render.
///
/// A dropped receiver is not an error; the job carries on unobserved.
pub struct EventProgress {
    id: String,
    direction: TransferDirection,
    label: String,
    transferred: u64,
    started: Instant,
    finished: bool,
    tx: mpsc::UnboundedSender<TransferProgress>,
}

impl EventProgress {
    pub fn new(
        id: impl Into<String>,
        direction: TransferDirection,
        tx: mpsc::UnboundedSender<TransferProgress>,
    ) -> Self {
        Self {
            id: id.into(),
            direction,
            label: String::new(),
            transferred: 0,
            started: Instant::now(),
            finished: false,
            tx,
        }
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.transferred
    }

    fn emit(&self, state: TransferState) {
        let elapsed = self.started.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            (self.transferred as f64 / elapsed) as u64
        } else {
            0
        };

        let snapshot = TransferProgress {
            id: self.id.clone(),
            direction: self.direction,
            label: self.label.clone(),
            transferred_bytes: self.transferred,
            state,
            speed,
        };
        if self.tx.send(snapshot).is_err() {
            debug!("Progress receiver for {} dropped", self.id);
        }
    }

    fn finish(&mut self, state: TransferState) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.emit(state);
    }
}

impl ProgressSink for EventProgress {
    fn update_label(&mut self, label: &str) {
        self.label = label.to_string();
        self.emit(TransferState::InProgress);
    }

    fn add_completed_bytes(&mut self, bytes: u64) {
        self.transferred += bytes;
        self.emit(TransferState::InProgress);
    }

    fn close(&mut self) {
        self.finish(TransferState::Completed);
    }

    fn cancel(&mut self) {
        self.finish(TransferState::Cancelled);
    }
}

/// Upload source reading a local file
pub struct LocalFileSource<P = NullProgress> {
    file: LocalFileHandle,
    progress: P,
}

impl<P: ProgressSink> LocalFileSource<P> {
    pub async fn open(path: impl Into<PathBuf>, progress: P) -> Result<Self, SftpError> {
        let file = LocalFileHandle::open(path, OpenMode::Read).await?;
        Ok(Self { file, progress })
    }

    pub fn into_progress(self) -> P {
        self.progress
    }
}

impl<P: ProgressSink> ProgressSink for LocalFileSource<P> {
    fn update_label(&mut self, label: &str) {
        self.progress.update_label(label);
    }

    fn add_completed_bytes(&mut self, bytes: u64) {
        self.progress.add_completed_bytes(bytes);
    }

    fn local_path(&self) -> Option<&Path> {
        Some(self.file.path())
    }

    fn close(&mut self) {
        self.progress.close();
    }

    fn cancel(&mut self) {
        self.progress.cancel();
    }
}

#[async_trait]
impl<P: ProgressSink> ChunkReader for LocalFileSource<P> {
    async fn read_chunk(&mut self) -> Result<Bytes, SftpError> {
        self.file.read().await
    }
}

/// Download sink writing a local file.
///
/// Every chunk is flushed before `write_chunk` returns. A cancelled download
/// leaves the partial file in place.
pub struct LocalFileSink<P = NullProgress> {
    file: LocalFileHandle,
    progress: P,
}

impl<P: ProgressSink> LocalFileSink<P> {
    /// Create or truncate `path`
    pub async fn create(path: impl Into<PathBuf>, progress: P) -> Result<Self, SftpError> {
        let file = LocalFileHandle::open(path, OpenMode::Write).await?;
        Ok(Self { file, progress })
    }

    pub fn into_progress(self) -> P {
        self.progress
    }
}

impl<P: ProgressSink> ProgressSink for LocalFileSink<P> {
    fn update_label(&mut self, label: &str) {
        self.progress.update_label(label);
    }

    fn add_completed_bytes(&mut self, bytes: u64) {
        self.progress.add_completed_bytes(bytes);
    }

    fn local_path(&self) -> Option<&Path> {
        Some(self.file.path())
    }

    fn close(&mut self) {
        self.progress.close();
    }

    fn cancel(&mut self) {
        self.progress.cancel();
    }
}

#[async_trait]
impl<P: ProgressSink> ChunkWriter for LocalFileSink<P> {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), SftpError> {
        self.file.write(chunk).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_event_progress_emits_single_terminal_state() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut progress = EventProgress::new("job-1", TransferDirection::Upload, tx);

        progress.update_label("sub/b.txt");
        progress.add_completed_bytes(10);
        progress.add_completed_bytes(5);
        progress.close();
        progress.cancel();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].label, "sub/b.txt");
        assert_eq!(events[2].transferred_bytes, 15);
        assert_eq!(events[3].state, TransferState::Completed);
        assert_eq!(progress.transferred_bytes(), 15);
    }

    #[test]
    fn test_event_progress_survives_dropped_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut progress = EventProgress::new("job-1", TransferDirection::Download, tx);
        progress.add_completed_bytes(3);
        progress.cancel();
        assert_eq!(progress.transferred_bytes(), 3);
    }

    #[tokio::test]
    async fn test_local_file_source_and_sink() {
        let dir = tempdir().unwrap();
        let src_path = dir.path().join("src.bin");
        tokio::fs::write(&src_path, b"chunked data").await.unwrap();

        let mut source = LocalFileSource::open(&src_path, NullProgress).await.unwrap();
        assert_eq!(source.local_path(), Some(src_path.as_path()));

        let dst_path = dir.path().join("dst.bin");
        let mut sink = LocalFileSink::create(&dst_path, NullProgress).await.unwrap();
        loop {
            let chunk = source.read_chunk().await.unwrap();
            if chunk.is_empty() {
                break;
            }
            sink.write_chunk(&chunk).await.unwrap();
        }

        assert_eq!(tokio::fs::read(&dst_path).await.unwrap(), b"chunked data");
    }
}
