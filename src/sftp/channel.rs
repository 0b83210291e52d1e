//! Channel contract
//!
//! A channel exposes the remote file primitives of one ordered SFTP
//! connection. The wire encoding lives behind it (see `russh_channel`);
//! [`RemoteSession`](super::session::RemoteSession) is the only caller.

use async_trait::async_trait;
use bytes::Bytes;

use super::error::SftpError;
use super::types::{EntryAttributes, OpenMode, RemoteDirEntry};

/// Opaque protocol-level file descriptor returned by `open`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelHandle(pub String);

impl std::fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a read/write request.
///
/// `WouldBlock` means the channel cannot take the request right now; the
/// caller must wait on [`SftpChannel::ready`] and issue it again. It is never
/// a completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelIo<T> {
    Ready(T),
    WouldBlock,
}

#[async_trait]
pub trait SftpChannel: Send + Sync + 'static {
    /// List the immediate children of `path` in server order
    async fn readdir(&self, path: &str) -> Result<Vec<RemoteDirEntry>, SftpError>;

    /// Metadata, following a terminal symlink
    async fn stat(&self, path: &str) -> Result<EntryAttributes, SftpError>;

    /// Metadata of the path itself, never following a terminal symlink
    async fn lstat(&self, path: &str) -> Result<EntryAttributes, SftpError>;

    async fn readlink(&self, path: &str) -> Result<String, SftpError>;

    /// Open a file. `OpenMode::Write` creates or truncates.
    async fn open(&self, path: &str, mode: OpenMode) -> Result<ChannelHandle, SftpError>;

    /// Read up to `len` bytes at `offset`. An empty buffer means end of file.
    async fn read(
        &self,
        handle: &ChannelHandle,
        offset: u64,
        len: usize,
    ) -> Result<ChannelIo<Bytes>, SftpError>;

    /// Write `data` at `offset`; may accept only a prefix of it.
    async fn write(
        &self,
        handle: &ChannelHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<ChannelIo<usize>, SftpError>;

    async fn close(&self, handle: &ChannelHandle) -> Result<(), SftpError>;

    async fn rmdir(&self, path: &str) -> Result<(), SftpError>;

    async fn mkdir(&self, path: &str) -> Result<(), SftpError>;

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), SftpError>;

    async fn unlink(&self, path: &str) -> Result<(), SftpError>;

    /// Resolves when a request that returned `WouldBlock` may be retried
    async fn ready(&self) {
        tokio::task::yield_now().await;
    }

    /// Resolves once the underlying connection has ended
    async fn closed(&self);

    /// Ask the connection to end. `closed` resolves afterwards.
    async fn shutdown(&self) -> Result<(), SftpError>;
}
