mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{memory_session, memory_session_with, temp_files, ChunkedSource, Recorder};
use oxideterm_transfer::config::TransferConfig;
use oxideterm_transfer::sftp::{
    constants::CHUNK_SIZE, ChunkWriter, EventProgress, LocalFileSink, LocalFileSource,
    MemoryFaults, NullProgress, ProgressSink, SftpError, TransferControl, TransferDirection,
    TransferState,
};
use tokio::sync::mpsc;

#[tokio::test]
async fn upload_replaces_existing_file() {
    let (channel, session) = memory_session();
    channel.add_file("/srv/a.txt", b"old contents");

    let mut source = ChunkedSource::new(vec![b"new ".to_vec(), b"data".to_vec()]);
    let bytes = session.upload("/srv/a.txt", &mut source, None).await.unwrap();

    assert_eq!(bytes, 8);
    assert_eq!(channel.file_contents("/srv/a.txt").unwrap(), b"new data");
    assert!(temp_files(&channel).is_empty());
    assert_eq!(source.progress.chunks, vec![4, 4]);
    assert_eq!(source.progress.labels, vec!["a.txt"]);
    assert_eq!(source.progress.closes, 1);
    assert_eq!(source.progress.cancels, 0);
    assert_eq!(channel.open_handles(), 0);
}

#[tokio::test]
async fn failure_on_second_chunk_leaves_destination_untouched() {
    let (channel, session) = memory_session();
    channel.add_file("/srv/a.txt", b"old contents");
    channel.set_faults(MemoryFaults {
        fail_write_on: Some(2),
        ..Default::default()
    });

    let chunk = vec![1u8; CHUNK_SIZE];
    let mut source = ChunkedSource::new(vec![chunk.clone(), chunk.clone(), chunk]);
    let err = session
        .upload("/srv/a.txt", &mut source, None)
        .await
        .unwrap_err();

    assert!(matches!(err, SftpError::ProtocolError(_)));
    assert_eq!(channel.file_contents("/srv/a.txt").unwrap(), b"old contents");
    assert!(temp_files(&channel).is_empty());
    assert_eq!(source.progress.cancels, 1);
    assert_eq!(source.progress.closes, 0);
    assert_eq!(source.progress.total_bytes(), CHUNK_SIZE as u64);
    assert_eq!(channel.open_handles(), 0);
}

#[tokio::test]
async fn cancellation_between_chunks_removes_temp_file() {
    let (channel, session) = memory_session();
    channel.add_file("/srv/a.txt", b"old contents");

    let control = Arc::new(TransferControl::new());
    let mut source = ChunkedSource::new(vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()])
        .cancel_after(1, control.clone());
    let err = session
        .upload("/srv/a.txt", &mut source, Some(control))
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(channel.file_contents("/srv/a.txt").unwrap(), b"old contents");
    assert!(temp_files(&channel).is_empty());
    assert_eq!(source.progress.cancels, 1);
    assert_eq!(session.transfers().registered_count(), 0);
}

#[tokio::test]
async fn upload_into_missing_directory_fails_cleanly() {
    let (channel, session) = memory_session();

    let mut source = ChunkedSource::new(vec![b"data".to_vec()]);
    let err = session
        .upload("/missing/a.txt", &mut source, None)
        .await
        .unwrap_err();

    assert!(err.is_not_found());
    assert_eq!(source.progress.cancels, 1);
    assert!(!channel.exists("/missing/a.txt"));
}

#[tokio::test]
async fn download_to_local_file_reports_completion() {
    let (channel, session) = memory_session();
    let data: Vec<u8> = (0..CHUNK_SIZE * 2 + 17).map(|i| (i % 7) as u8).collect();
    channel.add_file("/srv/big.bin", &data);

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("big.bin");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let progress = EventProgress::new("job-1", TransferDirection::Download, tx);
    let mut sink = LocalFileSink::create(&local, progress).await.unwrap();

    let bytes = session.download("/srv/big.bin", &mut sink, None).await.unwrap();
    assert_eq!(bytes, data.len() as u64);
    assert_eq!(tokio::fs::read(&local).await.unwrap(), data);

    let mut last = None;
    while let Ok(event) = rx.try_recv() {
        last = Some(event);
    }
    let last = last.unwrap();
    assert_eq!(last.state, TransferState::Completed);
    assert_eq!(last.transferred_bytes, data.len() as u64);
    assert_eq!(last.label, "big.bin");
}

#[tokio::test]
async fn download_of_missing_file_cancels_sink() {
    let (_channel, session) = memory_session();
    let mut sink = VecSink::default();

    let err = session
        .download("/srv/nope", &mut sink, None)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(sink.progress.cancels, 1);
    assert_eq!(sink.progress.closes, 0);
    assert!(sink.data.is_empty());
}

#[tokio::test]
async fn download_into_memory_sink() {
    let (channel, session) = memory_session();
    channel.add_file("/srv/a.txt", b"hello");
    let mut sink = VecSink::default();

    session.download("/srv/a.txt", &mut sink, None).await.unwrap();
    assert_eq!(sink.data, b"hello");
    assert_eq!(sink.progress.chunks, vec![5]);
    assert_eq!(sink.progress.closes, 1);
}

#[tokio::test]
async fn local_file_source_round_trip() {
    let (channel, session) = memory_session();
    channel.add_dir("/srv");
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("a.txt");
    tokio::fs::write(&local, b"hello").await.unwrap();

    let mut source = LocalFileSource::open(&local, NullProgress).await.unwrap();
    session.upload("/srv/a.txt", &mut source, None).await.unwrap();
    assert_eq!(channel.file_contents("/srv/a.txt").unwrap(), b"hello");
}

fn short_timeout() -> TransferConfig {
    TransferConfig {
        io_timeout_secs: 1,
        ..Default::default()
    }
}

#[tokio::test]
async fn stalled_close_fails_upload_with_timeout() {
    let (channel, session) = memory_session_with(short_timeout());
    channel.add_file("/srv/a.txt", b"old contents");
    channel.set_faults(MemoryFaults {
        stall_closes: true,
        ..Default::default()
    });

    let mut source = ChunkedSource::new(vec![b"new data".to_vec()]);
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        session.upload("/srv/a.txt", &mut source, None),
    )
    .await
    .expect("upload must give up once close times out");

    assert!(matches!(result, Err(SftpError::Timeout(_))));
    assert_eq!(channel.file_contents("/srv/a.txt").unwrap(), b"old contents");
    assert!(temp_files(&channel).is_empty());
    assert_eq!(source.progress.cancels, 1);
}

#[tokio::test]
async fn stalled_read_and_close_fail_download_with_timeout() {
    let (channel, session) = memory_session_with(short_timeout());
    channel.add_file("/srv/a.bin", b"data");
    channel.set_faults(MemoryFaults {
        stall_reads: true,
        stall_closes: true,
        ..Default::default()
    });

    let mut sink = VecSink::default();
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        session.download("/srv/a.bin", &mut sink, None),
    )
    .await
    .expect("download must give up once close times out");

    assert!(matches!(result, Err(SftpError::Timeout(_))));
    assert!(sink.data.is_empty());
    assert_eq!(sink.progress.cancels, 1);
    assert_eq!(sink.progress.closes, 0);
}

/// Download sink collecting into memory
#[derive(Default)]
struct VecSink {
    progress: Recorder,
    data: Vec<u8>,
}

impl ProgressSink for VecSink {
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
impl ChunkWriter for VecSink {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), SftpError> {
        self.data.extend_from_slice(chunk);
        Ok(())
    }
}
