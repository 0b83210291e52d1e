//! Remote session
//!
//! One [`RemoteSession`] per SFTP channel. It exposes the remote primitives
//! as awaitable calls, hands out [`RemoteFileHandle`]s and runs transfer
//! jobs. Once the channel ends the session flips its closed flag exactly once,
//! cancels its running jobs, and every pending or later call fails with
//! [`SftpError::ConnectionClosed`].

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::channel::SftpChannel;
use super::engine::DirectoryTransferEngine;
use super::error::SftpError;
use super::handle::RemoteFileHandle;
use super::path_utils::{is_safe_entry_name, join_remote_path};
use super::progress::{ProgressSink, TransferSink, TransferSource};
use super::transfer::{TransferControl, TransferGuard, TransferManager};
use super::types::{OpenMode, RemoteEntryStat, TransferSummary};
use crate::config::TransferConfig;

/// State shared by a session and the handles it opened
pub(crate) struct SessionShared {
    pub(crate) channel: Arc<dyn SftpChannel>,
    closed_rx: watch::Receiver<bool>,
    watcher: JoinHandle<()>,
    io_timeout: Duration,
}

async fn wait_closed(mut rx: watch::Receiver<bool>) {
    // A dropped sender also ends the wait
    let _ = rx.wait_for(|closed| *closed).await;
}

impl SessionShared {
    pub(crate) fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Run a channel call, failing it as soon as the session closes
    pub(crate) async fn call<T, F>(&self, request: F) -> Result<T, SftpError>
    where
        F: Future<Output = Result<T, SftpError>>,
    {
        if self.is_closed() {
            return Err(SftpError::ConnectionClosed);
        }

        tokio::select! {
            biased;
            _ = wait_closed(self.closed_rx.clone()) => Err(SftpError::ConnectionClosed),
            result = request => result,
        }
    }

    /// Like [`call`](Self::call), bounded by the I/O timeout
    pub(crate) async fn io<T, F>(&self, request: F) -> Result<T, SftpError>
    where
        F: Future<Output = Result<T, SftpError>>,
    {
        match tokio::time::timeout(self.io_timeout, self.call(request)).await {
            Ok(result) => result,
            Err(_) => Err(SftpError::Timeout(format!(
                "SFTP I/O did not complete within {}s",
                self.io_timeout.as_secs()
            ))),
        }
    }

    /// Wait until a request that returned `WouldBlock` may be reissued
    pub(crate) async fn wait_ready(&self) -> Result<(), SftpError> {
        self.io(async {
            self.channel.ready().await;
            Ok::<(), SftpError>(())
        })
        .await
    }
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

/// Handle to one SFTP channel. Cheap to clone; clones share the channel.
#[derive(Clone)]
pub struct RemoteSession {
    shared: Arc<SessionShared>,
    config: Arc<TransferConfig>,
    transfers: Arc<TransferManager>,
}

impl RemoteSession {
    /// Wrap an open channel. Must be called from within a Tokio runtime.
    pub fn new(channel: Arc<dyn SftpChannel>, config: TransferConfig) -> Self {
        let (closed_tx, closed_rx) = watch::channel(false);
        let transfers = Arc::new(TransferManager::new());

        let watched = channel.clone();
        let jobs = transfers.clone();
        let watcher = tokio::spawn(async move {
            watched.closed().await;
            info!("SFTP channel closed");
            closed_tx.send_replace(true);
            jobs.cancel_all();
        });

        Self {
            shared: Arc::new(SessionShared {
                channel,
                closed_rx,
                watcher,
                io_timeout: Duration::from_secs(config.io_timeout_secs),
            }),
            config: Arc::new(config),
            transfers,
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Running jobs of this session, for cancellation by id
    pub fn transfers(&self) -> &Arc<TransferManager> {
        &self.transfers
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Receiver of the closed flag. It changes at most once, to `true`.
    pub fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.shared.closed_rx.clone()
    }

    /// Resolves once the channel has ended
    pub async fn closed(&self) {
        wait_closed(self.shared.closed_rx.clone()).await;
    }

    /// Ask the channel to end; observers are notified through `closed`
    pub async fn shutdown(&self) -> Result<(), SftpError> {
        if self.is_closed() {
            return Ok(());
        }
        info!("Shutting down SFTP session");
        self.transfers.cancel_all();
        self.shared.channel.shutdown().await
    }

    /// List a directory. `.` and `..` are omitted; order is the server's.
    pub async fn readdir(&self, path: &str) -> Result<Vec<RemoteEntryStat>, SftpError> {
        debug!("readdir {}", path);
        let entries = self.shared.io(self.shared.channel.readdir(path)).await?;

        Ok(entries
            .into_iter()
            .filter(|entry| entry.file_name != "." && entry.file_name != "..")
            .filter(|entry| {
                let safe = is_safe_entry_name(&entry.file_name);
                if !safe {
                    warn!("Ignoring unsafe entry name {:?} in {}", entry.file_name, path);
                }
                safe
            })
            .map(|entry| {
                RemoteEntryStat::from_attributes(
                    &join_remote_path(path, &entry.file_name),
                    &entry.attrs,
                )
            })
            .collect())
    }

    /// Metadata, following a terminal symlink
    pub async fn stat(&self, path: &str) -> Result<RemoteEntryStat, SftpError> {
        debug!("stat {}", path);
        let attrs = self.shared.io(self.shared.channel.stat(path)).await?;
        Ok(RemoteEntryStat::from_attributes(path, &attrs))
    }

    /// Metadata of the path itself; a symlink reports as a symlink
    pub async fn lstat(&self, path: &str) -> Result<RemoteEntryStat, SftpError> {
        debug!("lstat {}", path);
        let attrs = self.shared.io(self.shared.channel.lstat(path)).await?;
        Ok(RemoteEntryStat::from_attributes(path, &attrs))
    }

    pub async fn readlink(&self, path: &str) -> Result<String, SftpError> {
        debug!("readlink {}", path);
        self.shared.io(self.shared.channel.readlink(path)).await
    }

    /// Open a remote file. `OpenMode::Write` creates or truncates.
    pub async fn open(&self, path: &str, mode: OpenMode) -> Result<RemoteFileHandle, SftpError> {
        debug!("open {} ({:?})", path, mode);
        let handle = self.shared.io(self.shared.channel.open(path, mode)).await?;
        Ok(RemoteFileHandle::new(
            self.shared.clone(),
            handle,
            path.to_string(),
            mode,
        ))
    }

    pub async fn rmdir(&self, path: &str) -> Result<(), SftpError> {
        debug!("rmdir {}", path);
        self.shared.io(self.shared.channel.rmdir(path)).await
    }

    pub async fn mkdir(&self, path: &str) -> Result<(), SftpError> {
        debug!("mkdir {}", path);
        self.shared.io(self.shared.channel.mkdir(path)).await
    }

    pub async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), SftpError> {
        debug!("rename {} -> {}", old_path, new_path);
        self.shared
            .io(self.shared.channel.rename(old_path, new_path))
            .await
    }

    pub async fn unlink(&self, path: &str) -> Result<(), SftpError> {
        debug!("unlink {}", path);
        self.shared.io(self.shared.channel.unlink(path)).await
    }

    /// Register a job with this session's transfer manager
    fn begin_job(&self, control: Option<Arc<TransferControl>>) -> (Arc<TransferControl>, TransferGuard) {
        let job_id = uuid::Uuid::new_v4().to_string();
        let control = control.unwrap_or_default();
        self.transfers.track(&job_id, control.clone());
        if self.is_closed() {
            control.cancel();
        }
        let guard = TransferGuard::new(Some(&self.transfers), job_id);
        (control, guard)
    }

    fn engine<'a>(&'a self, control: &'a TransferControl) -> DirectoryTransferEngine<'a> {
        DirectoryTransferEngine::new(self, control)
    }

    /// Upload a single file atomically: data goes to `path + temp_suffix`,
    /// which then replaces `path`. Returns the number of bytes written.
    ///
    /// On success `source.close()` is called; on failure the temporary file
    /// is removed (best effort) and `source.cancel()` is called before the
    /// error is returned.
    pub async fn upload(
        &self,
        path: &str,
        source: &mut dyn TransferSource,
        control: Option<Arc<TransferControl>>,
    ) -> Result<u64, SftpError> {
        let (control, guard) = self.begin_job(control);
        info!(
            "Uploading {:?} to {} (job {})",
            source.local_path(),
            path,
            guard.transfer_id()
        );

        let engine = self.engine(&control);
        match engine.upload_stream(source, path).await {
            Ok(bytes) => {
                source.close();
                info!("Upload of {} complete: {} bytes", path, bytes);
                Ok(bytes)
            }
            Err(e) => {
                warn!("Upload of {} failed: {}", path, e);
                source.cancel();
                Err(e)
            }
        }
    }

    /// Download a single file into `sink`. Returns the number of bytes read.
    ///
    /// On failure `sink.cancel()` is called before the error is returned;
    /// whatever the sink already received stays where it is.
    pub async fn download(
        &self,
        path: &str,
        sink: &mut dyn TransferSink,
        control: Option<Arc<TransferControl>>,
    ) -> Result<u64, SftpError> {
        let (control, guard) = self.begin_job(control);
        info!(
            "Downloading {} to {:?} (job {})",
            path,
            sink.local_path(),
            guard.transfer_id()
        );

        let engine = self.engine(&control);
        match engine.download_stream(path, sink).await {
            Ok(bytes) => {
                sink.close();
                info!("Download of {} complete: {} bytes", path, bytes);
                Ok(bytes)
            }
            Err(e) => {
                warn!("Download of {} failed: {}", path, e);
                sink.cancel();
                Err(e)
            }
        }
    }

    /// Recursively upload `local_path` into `remote_path`.
    ///
    /// Directories are created as needed, each file is uploaded atomically
    /// and symlinks or special files are skipped. A plain file root is
    /// uploaded as a single file.
    pub async fn upload_directory(
        &self,
        local_path: &Path,
        remote_path: &str,
        progress: &mut dyn ProgressSink,
        control: Option<Arc<TransferControl>>,
    ) -> Result<TransferSummary, SftpError> {
        let (control, guard) = self.begin_job(control);
        info!(
            "Uploading directory {:?} to {} (job {})",
            local_path,
            remote_path,
            guard.transfer_id()
        );

        let engine = self.engine(&control);
        match engine.upload_tree(local_path, remote_path, progress).await {
            Ok(summary) => {
                progress.close();
                info!(
                    "Directory upload complete: {} files, {} dirs, {} skipped, {} bytes",
                    summary.files, summary.directories, summary.skipped, summary.bytes
                );
                Ok(summary)
            }
            Err(e) => {
                warn!("Directory upload of {:?} failed: {}", local_path, e);
                progress.cancel();
                Err(e)
            }
        }
    }

    /// Recursively download `remote_path` into `local_path`, the mirror of
    /// [`upload_directory`](Self::upload_directory).
    pub async fn download_directory(
        &self,
        remote_path: &str,
        local_path: &Path,
        progress: &mut dyn ProgressSink,
        control: Option<Arc<TransferControl>>,
    ) -> Result<TransferSummary, SftpError> {
        let (control, guard) = self.begin_job(control);
        info!(
            "Downloading directory {} to {:?} (job {})",
            remote_path,
            local_path,
            guard.transfer_id()
        );

        let engine = self.engine(&control);
        match engine.download_tree(remote_path, local_path, progress).await {
            Ok(summary) => {
                progress.close();
                info!(
                    "Directory download complete: {} files, {} dirs, {} skipped, {} bytes",
                    summary.files, summary.directories, summary.skipped, summary.bytes
                );
                Ok(summary)
            }
            Err(e) => {
                warn!("Directory download of {} failed: {}", remote_path, e);
                progress.cancel();
                Err(e)
            }
        }
    }
}
