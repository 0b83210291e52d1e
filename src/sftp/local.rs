//! Local file handle
//!
//! The local twin of [`RemoteFileHandle`](super::handle::RemoteFileHandle):
//! sequential chunked reads, whole-chunk writes, explicit close.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::error::SftpError;
use super::progress::{ChunkReader, ChunkWriter};
use super::types::{constants::CHUNK_SIZE, OpenMode};

pub struct LocalFileHandle {
    file: File,
    path: PathBuf,
    mode: OpenMode,
    position: u64,
}

impl LocalFileHandle {
    /// Open `path` for reading, or create/truncate it for writing
    pub async fn open(path: impl Into<PathBuf>, mode: OpenMode) -> Result<Self, SftpError> {
        let path = path.into();
        let file = match mode {
            OpenMode::Read => File::open(&path).await?,
            OpenMode::Write => File::create(&path).await?,
        };

        Ok(Self {
            file,
            path,
            mode,
            position: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Bytes read or written so far
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read the next chunk of at most 256 KiB. Empty at end of file.
    pub async fn read(&mut self) -> Result<Bytes, SftpError> {
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let n = self.file.read(&mut buffer).await?;
        buffer.truncate(n);
        self.position += n as u64;
        Ok(Bytes::from(buffer))
    }

    /// Write the whole chunk and flush it to the OS before returning
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), SftpError> {
        self.file.write_all(chunk).await?;
        self.file.flush().await?;
        self.position += chunk.len() as u64;
        Ok(())
    }

    pub async fn close(mut self) -> Result<(), SftpError> {
        self.file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ChunkReader for LocalFileHandle {
    async fn read_chunk(&mut self) -> Result<Bytes, SftpError> {
        self.read().await
    }
}

#[async_trait]
impl ChunkWriter for LocalFileHandle {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), SftpError> {
        self.write(chunk).await
    }
}
