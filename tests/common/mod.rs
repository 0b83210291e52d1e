#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use oxideterm_transfer::config::TransferConfig;
use oxideterm_transfer::sftp::{
    ChunkReader, MemoryChannel, ProgressSink, RemoteSession, SftpError, TransferControl,
};

/// Progress sink that remembers everything it was told
#[derive(Debug, Default)]
pub struct Recorder {
    pub labels: Vec<String>,
    pub chunks: Vec<u64>,
    pub closes: usize,
    pub cancels: usize,
}

impl Recorder {
    pub fn total_bytes(&self) -> u64 {
        self.chunks.iter().sum()
    }
}

impl ProgressSink for Recorder {
    fn update_label(&mut self, label: &str) {
        self.labels.push(label.to_string());
    }

    fn add_completed_bytes(&mut self, bytes: u64) {
        self.chunks.push(bytes);
    }

    fn close(&mut self) {
        self.closes += 1;
    }

    fn cancel(&mut self) {
        self.cancels += 1;
    }
}

/// Upload source serving fixed chunks, optionally cancelling its job after
/// a number of reads
pub struct ChunkedSource {
    chunks: Vec<Vec<u8>>,
    pub progress: Recorder,
    pub reads: usize,
    cancel_after: Option<(usize, Arc<TransferControl>)>,
}

impl ChunkedSource {
    pub fn new(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks,
            progress: Recorder::default(),
            reads: 0,
            cancel_after: None,
        }
    }

    pub fn cancel_after(mut self, reads: usize, control: Arc<TransferControl>) -> Self {
        self.cancel_after = Some((reads, control));
        self
    }
}

impl ProgressSink for ChunkedSource {
    fn update_label(&mut self, label: &str) {
        self.progress.update_label(label);
    }

    fn add_completed_bytes(&mut self, bytes: u64) {
        self.progress.add_completed_bytes(bytes);
    }

    fn close(&mut self) {
        self.progress.close();
    }

    fn cancel(&mut self) {
        self.progress.cancel();
    }
}

#[async_trait]
impl ChunkReader for ChunkedSource {
    async fn read_chunk(&mut self) -> Result<Bytes, SftpError> {
        self.reads += 1;
        if let Some((after, control)) = &self.cancel_after {
            if self.reads > *after {
                control.cancel();
            }
        }
        if self.chunks.is_empty() {
            Ok(Bytes::new())
        } else {
            Ok(Bytes::from(self.chunks.remove(0)))
        }
    }
}

pub fn memory_session() -> (Arc<MemoryChannel>, RemoteSession) {
    memory_session_with(TransferConfig::default())
}

pub fn memory_session_with(config: TransferConfig) -> (Arc<MemoryChannel>, RemoteSession) {
    let channel = Arc::new(MemoryChannel::new());
    let session = RemoteSession::new(channel.clone(), config);
    (channel, session)
}

/// Paths left behind by an interrupted upload
pub fn temp_files(channel: &MemoryChannel) -> Vec<String> {
    channel
        .paths()
        .into_iter()
        .filter(|p| p.ends_with(".tabby-upload"))
        .collect()
}
