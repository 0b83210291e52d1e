//! Directory transfer engine
//!
//! Walks a local or remote tree depth-first and moves every regular file in
//! 256 KiB chunks. Symlinks are never followed: every entry is classified by
//! `lstat` (locally `symlink_metadata`) and links or special files are
//! skipped. Uploads are atomic per file: data goes to a temporary sibling
//! that replaces the destination only after it was written and closed.

use std::path::{Path, PathBuf};

use futures_util::future::BoxFuture;
use tracing::{debug, warn};

use super::error::SftpError;
use super::local::LocalFileHandle;
use super::path_utils::{
    join_local_path, join_remote_path, relative_label, remote_file_name, upload_temp_path,
};
use super::progress::{ChunkReader, ChunkWriter, ProgressSink, TransferSink, TransferSource};
use super::session::RemoteSession;
use super::transfer::{best_effort, check_transfer_control, TransferControl};
use super::types::{EntryKind, OpenMode, RemoteEntryStat, TransferSummary};
use crate::config::TransferConfig;

/// Copy chunks from `reader` to `writer` until an empty chunk.
///
/// Cancellation is checked before each chunk; `on_chunk` runs after a chunk
/// has been fully written.
async fn pump<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    control: &TransferControl,
    mut on_chunk: F,
) -> Result<u64, SftpError>
where
    R: ChunkReader + ?Sized,
    W: ChunkWriter + ?Sized,
    F: FnMut(&mut R, &mut W, u64),
{
    let mut total = 0u64;
    loop {
        check_transfer_control(control)?;
        let chunk = reader.read_chunk().await?;
        if chunk.is_empty() {
            return Ok(total);
        }
        writer.write_chunk(&chunk).await?;
        let n = chunk.len() as u64;
        total += n;
        on_chunk(&mut *reader, &mut *writer, n);
    }
}

/// Combine a transfer result with the result of closing its handle.
/// The transfer error wins.
fn settle(
    transferred: Result<u64, SftpError>,
    closed: Result<(), SftpError>,
    path: &str,
) -> Result<u64, SftpError> {
    match (transferred, closed) {
        (Ok(bytes), Ok(())) => Ok(bytes),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close_err)) => {
            debug!("Closing {} after failure also failed: {}", path, close_err);
            Err(e)
        }
    }
}

fn local_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

pub struct DirectoryTransferEngine<'a> {
    session: &'a RemoteSession,
    control: &'a TransferControl,
    config: &'a TransferConfig,
}

impl<'a> DirectoryTransferEngine<'a> {
    pub fn new(session: &'a RemoteSession, control: &'a TransferControl) -> Self {
        Self {
            session,
            control,
            config: session.config(),
        }
    }

    /// Single-file upload from a UI source
    pub async fn upload_stream(
        &self,
        source: &mut dyn TransferSource,
        path: &str,
    ) -> Result<u64, SftpError> {
        source.update_label(remote_file_name(path));
        self.upload_atomic(source, path, |src, n| src.add_completed_bytes(n))
            .await
    }

    /// Single-file download into a UI sink
    pub async fn download_stream(
        &self,
        path: &str,
        sink: &mut dyn TransferSink,
    ) -> Result<u64, SftpError> {
        sink.update_label(remote_file_name(path));
        self.download_into(path, sink, |dst, n| dst.add_completed_bytes(n))
            .await
    }

    pub async fn upload_tree(
        &self,
        local_root: &Path,
        remote_root: &str,
        progress: &mut dyn ProgressSink,
    ) -> Result<TransferSummary, SftpError> {
        let mut summary = TransferSummary::default();
        self.upload_entry(
            local_root.to_path_buf(),
            remote_root.to_string(),
            Vec::new(),
            0,
            progress,
            &mut summary,
        )
        .await?;
        Ok(summary)
    }

    pub async fn download_tree(
        &self,
        remote_root: &str,
        local_root: &Path,
        progress: &mut dyn ProgressSink,
    ) -> Result<TransferSummary, SftpError> {
        let root = self.session.lstat(remote_root).await?;
        let mut summary = TransferSummary::default();
        self.download_entry(
            root,
            local_root.to_path_buf(),
            Vec::new(),
            0,
            progress,
            &mut summary,
        )
        .await?;
        Ok(summary)
    }

    fn check_depth(&self, depth: usize, path: &str) -> Result<(), SftpError> {
        if depth > self.config.max_depth {
            return Err(SftpError::DepthLimitExceeded {
                path: path.to_string(),
                limit: self.config.max_depth,
            });
        }
        Ok(())
    }

    fn upload_entry<'s>(
        &'s self,
        local_path: PathBuf,
        remote_path: String,
        relative: Vec<String>,
        depth: usize,
        progress: &'s mut dyn ProgressSink,
        summary: &'s mut TransferSummary,
    ) -> BoxFuture<'s, Result<(), SftpError>> {
        Box::pin(async move {
            check_transfer_control(self.control)?;
            self.check_depth(depth, &local_path.display().to_string())?;

            let metadata = tokio::fs::symlink_metadata(&local_path).await?;
            match EntryKind::from_local(metadata.file_type()) {
                EntryKind::Directory => {
                    self.ensure_remote_dir(&remote_path).await?;
                    summary.directories += 1;

                    let mut entries = tokio::fs::read_dir(&local_path).await?;
                    while let Some(entry) = entries.next_entry().await? {
                        let name = match entry.file_name().into_string() {
                            Ok(name) => name,
                            Err(raw) => {
                                warn!("Skipping non UTF-8 name {:?} in {:?}", raw, local_path);
                                summary.skipped += 1;
                                continue;
                            }
                        };

                        let mut child_relative = relative.clone();
                        child_relative.push(name.clone());
                        self.upload_entry(
                            entry.path(),
                            join_remote_path(&remote_path, &name),
                            child_relative,
                            depth + 1,
                            &mut *progress,
                            &mut *summary,
                        )
                        .await?;
                    }
                }
                EntryKind::File => {
                    progress.update_label(&relative_label(&local_name(&local_path), &relative));

                    let mut file = LocalFileHandle::open(&local_path, OpenMode::Read).await?;
                    let uploaded = self
                        .upload_atomic(&mut file, &remote_path, |_, n| {
                            progress.add_completed_bytes(n)
                        })
                        .await;
                    let closed = file.close().await;
                    let bytes = settle(uploaded, closed, &remote_path)?;

                    summary.files += 1;
                    summary.bytes += bytes;
                }
                EntryKind::Symlink => {
                    match tokio::fs::read_link(&local_path).await {
                        Ok(target) => warn!("Skipping symlink {:?} -> {:?}", local_path, target),
                        Err(_) => warn!("Skipping symlink {:?}", local_path),
                    }
                    summary.skipped += 1;
                }
                EntryKind::Other => {
                    warn!("Skipping special file {:?}", local_path);
                    summary.skipped += 1;
                }
            }
            Ok(())
        })
    }

    fn download_entry<'s>(
        &'s self,
        entry: RemoteEntryStat,
        local_path: PathBuf,
        relative: Vec<String>,
        depth: usize,
        progress: &'s mut dyn ProgressSink,
        summary: &'s mut TransferSummary,
    ) -> BoxFuture<'s, Result<(), SftpError>> {
        Box::pin(async move {
            check_transfer_control(self.control)?;
            self.check_depth(depth, &entry.full_path)?;

            match entry.kind {
                EntryKind::Directory => {
                    self.ensure_local_dir(&local_path, entry.permissions()).await?;
                    summary.directories += 1;

                    for child in self.session.readdir(&entry.full_path).await? {
                        let child_local = join_local_path(&local_path, &child.name);
                        let mut child_relative = relative.clone();
                        child_relative.push(child.name.clone());
                        self.download_entry(
                            child,
                            child_local,
                            child_relative,
                            depth + 1,
                            &mut *progress,
                            &mut *summary,
                        )
                        .await?;
                    }
                }
                EntryKind::File => {
                    progress.update_label(&relative_label(&entry.name, &relative));

                    let mut file = LocalFileHandle::open(&local_path, OpenMode::Write).await?;
                    let downloaded = self
                        .download_into(&entry.full_path, &mut file, |_, n| {
                            progress.add_completed_bytes(n)
                        })
                        .await;
                    let closed = file.close().await;
                    let bytes = settle(downloaded, closed, &entry.full_path)?;

                    summary.files += 1;
                    summary.bytes += bytes;
                }
                EntryKind::Symlink => {
                    match self.session.readlink(&entry.full_path).await {
                        Ok(target) => warn!("Skipping symlink {} -> {}", entry.full_path, target),
                        Err(_) => warn!("Skipping symlink {}", entry.full_path),
                    }
                    summary.skipped += 1;
                }
                EntryKind::Other => {
                    warn!(
                        "Skipping special file {} (mode {:o})",
                        entry.full_path, entry.mode
                    );
                    summary.skipped += 1;
                }
            }
            Ok(())
        })
    }

    /// Write `reader` to `path + temp_suffix`, then move it over `path`.
    ///
    /// Any failure removes the temporary file (best effort) and leaves `path`
    /// as it was.
    async fn upload_atomic<R, F>(
        &self,
        reader: &mut R,
        path: &str,
        mut on_chunk: F,
    ) -> Result<u64, SftpError>
    where
        R: ChunkReader + ?Sized,
        F: FnMut(&mut R, u64),
    {
        let temp_path = upload_temp_path(path, &self.config.temp_suffix);

        let result: Result<u64, SftpError> = async {
            let mut handle = self.session.open(&temp_path, OpenMode::Write).await?;
            let pumped = pump(reader, &mut handle, self.control, |r, _, n| on_chunk(r, n)).await;
            let closed = handle.close().await;
            let bytes = settle(pumped, closed, &temp_path)?;

            // SFTP v3 rename does not overwrite
            best_effort("remove previous upload target", self.session.unlink(path)).await;
            self.session.rename(&temp_path, path).await?;
            Ok(bytes)
        }
        .await;

        if let Err(e) = &result {
            debug!("Upload to {} failed ({}), removing {}", path, e, temp_path);
            best_effort("remove temporary upload file", self.session.unlink(&temp_path)).await;
        }
        result
    }

    async fn download_into<W, F>(
        &self,
        path: &str,
        writer: &mut W,
        mut on_chunk: F,
    ) -> Result<u64, SftpError>
    where
        W: ChunkWriter + ?Sized,
        F: FnMut(&mut W, u64),
    {
        let mut handle = self.session.open(path, OpenMode::Read).await?;
        let pumped = pump(&mut handle, writer, self.control, |_, w, n| on_chunk(w, n)).await;
        let closed = handle.close().await;
        settle(pumped, closed, path)
    }

    /// Create a remote directory; an existing directory is fine
    async fn ensure_remote_dir(&self, path: &str) -> Result<(), SftpError> {
        match self.session.mkdir(path).await {
            Ok(()) => {
                debug!("Created remote directory {}", path);
                Ok(())
            }
            Err(e) => match self.session.stat(path).await {
                Ok(stat) if stat.is_directory() => Ok(()),
                _ => Err(e),
            },
        }
    }

    /// Create a local directory; an existing directory is fine.
    ///
    /// On Unix the remote permission bits are applied (subject to umask), with
    /// owner rwx always kept so the directory can be filled.
    async fn ensure_local_dir(&self, path: &Path, mode: u32) -> Result<(), SftpError> {
        let mut builder = tokio::fs::DirBuilder::new();
        #[cfg(unix)]
        {
            if self.config.preserve_directory_mode && mode != 0 {
                builder.mode(mode | 0o700);
            }
        }
        #[cfg(not(unix))]
        let _ = mode;

        match builder.create(path).await {
            Ok(()) => {
                debug!("Created local directory {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // The destination itself may be reached through a link
                if tokio::fs::metadata(path).await?.is_dir() {
                    Ok(())
                } else {
                    Err(e.into())
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}
