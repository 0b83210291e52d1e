//! Remote file handle
//!
//! Wraps one open protocol handle. The handle owns its read/write cursor,
//! retries `WouldBlock` answers after the channel signals readiness, and is
//! released with [`RemoteFileHandle::close`], which consumes it.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use super::channel::{ChannelHandle, ChannelIo};
use super::error::SftpError;
use super::progress::{ChunkReader, ChunkWriter};
use super::session::SessionShared;
use super::types::{constants::CHUNK_SIZE, OpenMode};

pub struct RemoteFileHandle {
    shared: Arc<SessionShared>,
    /// `None` once closed
    handle: Option<ChannelHandle>,
    path: String,
    mode: OpenMode,
    position: u64,
}

impl RemoteFileHandle {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        handle: ChannelHandle,
        path: String,
        mode: OpenMode,
    ) -> Self {
        Self {
            shared,
            handle: Some(handle),
            path,
            mode,
            position: 0,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Offset of the next read or write
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read the next chunk of at most 256 KiB. Empty at end of file.
    pub async fn read(&mut self) -> Result<Bytes, SftpError> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| SftpError::InvalidHandle(self.path.clone()))?;

        loop {
            let request = self.shared.channel.read(handle, self.position, CHUNK_SIZE);
            match self.shared.io(request).await? {
                ChannelIo::Ready(data) => {
                    if data.len() > CHUNK_SIZE {
                        return Err(SftpError::ProtocolError(format!(
                            "Read of {} returned {} bytes, more than requested",
                            self.path,
                            data.len()
                        )));
                    }
                    self.position += data.len() as u64;
                    return Ok(data);
                }
                ChannelIo::WouldBlock => self.shared.wait_ready().await?,
            }
        }
    }

    /// Write the whole chunk, reissuing the remainder after partial writes
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), SftpError> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| SftpError::InvalidHandle(self.path.clone()))?;

        let mut written = 0;
        while written < chunk.len() {
            let request = self
                .shared
                .channel
                .write(handle, self.position, &chunk[written..]);
            match self.shared.io(request).await? {
                ChannelIo::Ready(0) => {
                    return Err(SftpError::ProtocolError(format!(
                        "Write to {} made no progress",
                        self.path
                    )));
                }
                ChannelIo::Ready(n) => {
                    written += n;
                    self.position += n as u64;
                }
                ChannelIo::WouldBlock => self.shared.wait_ready().await?,
            }
        }
        Ok(())
    }

    /// Release the protocol handle
    pub async fn close(mut self) -> Result<(), SftpError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        debug!("Closing remote handle {} for {}", handle, self.path);
        let request = self.shared.channel.close(&handle);
        self.shared.io(request).await
    }
}

impl Drop for RemoteFileHandle {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        warn!("Remote handle for {} dropped without close", self.path);

        // Best-effort release; nothing to report to if it fails
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let channel = self.shared.channel.clone();
            runtime.spawn(async move {
                if let Err(e) = channel.close(&handle).await {
                    debug!("Deferred close of {} failed: {}", handle, e);
                }
            });
        }
    }
}

#[async_trait]
impl ChunkReader for RemoteFileHandle {
    async fn read_chunk(&mut self) -> Result<Bytes, SftpError> {
        self.read().await
    }
}

#[async_trait]
impl ChunkWriter for RemoteFileHandle {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), SftpError> {
        self.write(chunk).await
    }
}
