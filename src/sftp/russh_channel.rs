//! russh-sftp backed channel
//!
//! Adapts `russh_sftp::client::SftpSession` to [`SftpChannel`]. Open files are
//! kept in a table keyed by an opaque id; reads and writes seek to the
//! requested offset first, so callers own the cursor.

use std::io::SeekFrom;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use russh_sftp::client::fs::File;
use russh_sftp::client::SftpSession as RusshSftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use super::channel::{ChannelHandle, ChannelIo, SftpChannel};
use super::error::{map_sftp_error, SftpError};
use super::types::{EntryAttributes, OpenMode, RemoteDirEntry};

pub struct RusshSftpChannel {
    sftp: RusshSftpSession,
    files: DashMap<String, Arc<Mutex<File>>>,
    closed_tx: Arc<watch::Sender<bool>>,
}

impl RusshSftpChannel {
    /// Request the SFTP subsystem on an already opened session channel.
    ///
    /// `disconnect` is the SSH connection's disconnect broadcast; the channel
    /// reports itself closed when it fires or its sender goes away.
    pub async fn open(
        channel: russh::Channel<russh::client::Msg>,
        disconnect: broadcast::Receiver<()>,
    ) -> Result<Self, SftpError> {
        channel.request_subsystem(true, "sftp").await.map_err(|e| {
            SftpError::SubsystemNotAvailable(format!("Failed to request SFTP subsystem: {}", e))
        })?;

        let sftp = RusshSftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SftpError::SubsystemNotAvailable(e.to_string()))?;

        info!("SFTP subsystem opened");
        Ok(Self::from_session(sftp, disconnect))
    }

    pub fn from_session(sftp: RusshSftpSession, mut disconnect: broadcast::Receiver<()>) -> Self {
        let (closed_tx, _) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);

        let watcher = closed_tx.clone();
        tokio::spawn(async move {
            // Either a disconnect notification or a dropped sender ends the channel
            let _ = disconnect.recv().await;
            debug!("SSH disconnect observed, marking SFTP channel closed");
            watcher.send_replace(true);
        });

        Self {
            sftp,
            files: DashMap::new(),
            closed_tx,
        }
    }

    fn file(&self, handle: &ChannelHandle) -> Result<Arc<Mutex<File>>, SftpError> {
        self.files
            .get(&handle.0)
            .map(|f| f.value().clone())
            .ok_or_else(|| SftpError::InvalidHandle(handle.to_string()))
    }
}

fn to_attributes(attrs: &FileAttributes) -> EntryAttributes {
    EntryAttributes {
        permissions: attrs.permissions,
        size: attrs.size,
        mtime: attrs.mtime,
    }
}

#[async_trait]
impl SftpChannel for RusshSftpChannel {
    async fn readdir(&self, path: &str) -> Result<Vec<RemoteDirEntry>, SftpError> {
        let read_dir = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| map_sftp_error(e, path))?;

        Ok(read_dir
            .map(|entry| RemoteDirEntry {
                file_name: entry.file_name(),
                attrs: to_attributes(&entry.metadata()),
            })
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<EntryAttributes, SftpError> {
        let metadata = self
            .sftp
            .metadata(path)
            .await
            .map_err(|e| map_sftp_error(e, path))?;
        Ok(to_attributes(&metadata))
    }

    async fn lstat(&self, path: &str) -> Result<EntryAttributes, SftpError> {
        let metadata = self
            .sftp
            .symlink_metadata(path)
            .await
            .map_err(|e| map_sftp_error(e, path))?;
        Ok(to_attributes(&metadata))
    }

    async fn readlink(&self, path: &str) -> Result<String, SftpError> {
        self.sftp
            .read_link(path)
            .await
            .map_err(|e| map_sftp_error(e, path))
    }

    async fn open(&self, path: &str, mode: OpenMode) -> Result<ChannelHandle, SftpError> {
        let flags = match mode {
            OpenMode::Read => OpenFlags::READ,
            OpenMode::Write => OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
        };

        let file = self
            .sftp
            .open_with_flags(path, flags)
            .await
            .map_err(|e| map_sftp_error(e, path))?;

        let id = uuid::Uuid::new_v4().to_string();
        self.files.insert(id.clone(), Arc::new(Mutex::new(file)));
        Ok(ChannelHandle(id))
    }

    async fn read(
        &self,
        handle: &ChannelHandle,
        offset: u64,
        len: usize,
    ) -> Result<ChannelIo<Bytes>, SftpError> {
        let file = self.file(handle)?;
        let mut file = file.lock().await;

        file.seek(SeekFrom::Start(offset)).await?;
        let mut buffer = vec![0u8; len];
        let bytes_read = file
            .read(&mut buffer)
            .await
            .map_err(|e| SftpError::ProtocolError(e.to_string()))?;
        buffer.truncate(bytes_read);

        Ok(ChannelIo::Ready(Bytes::from(buffer)))
    }

    async fn write(
        &self,
        handle: &ChannelHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<ChannelIo<usize>, SftpError> {
        let file = self.file(handle)?;
        let mut file = file.lock().await;

        file.seek(SeekFrom::Start(offset)).await?;
        let written = file
            .write(data)
            .await
            .map_err(|e| SftpError::ProtocolError(e.to_string()))?;

        Ok(ChannelIo::Ready(written))
    }

    async fn close(&self, handle: &ChannelHandle) -> Result<(), SftpError> {
        let (_, file) = self
            .files
            .remove(&handle.0)
            .ok_or_else(|| SftpError::InvalidHandle(handle.to_string()))?;

        let mut file = file.lock().await;
        file.flush()
            .await
            .map_err(|e| SftpError::ProtocolError(e.to_string()))?;
        // Sends SSH_FXP_CLOSE for the underlying handle
        file.shutdown()
            .await
            .map_err(|e| SftpError::ProtocolError(e.to_string()))?;
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> Result<(), SftpError> {
        self.sftp
            .remove_dir(path)
            .await
            .map_err(|e| map_sftp_error(e, path))
    }

    async fn mkdir(&self, path: &str) -> Result<(), SftpError> {
        self.sftp
            .create_dir(path)
            .await
            .map_err(|e| map_sftp_error(e, path))
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), SftpError> {
        self.sftp
            .rename(old_path, new_path)
            .await
            .map_err(|e| map_sftp_error(e, old_path))
    }

    async fn unlink(&self, path: &str) -> Result<(), SftpError> {
        self.sftp
            .remove_file(path)
            .await
            .map_err(|e| map_sftp_error(e, path))
    }

    async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn shutdown(&self) -> Result<(), SftpError> {
        if !self.files.is_empty() {
            warn!("Closing SFTP channel with {} open files", self.files.len());
        }
        let result = self.sftp.close().await.map_err(SftpError::from);
        self.closed_tx.send_replace(true);
        result
    }
}
