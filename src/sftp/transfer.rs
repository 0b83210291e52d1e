//! Transfer control for SFTP jobs
//!
//! Cooperative cancellation: a job checks its [`TransferControl`] between
//! chunks and between directory entries, never in the middle of a request.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::error::SftpError;

/// Transfer control signals
#[derive(Debug)]
pub struct TransferControl {
    /// Cancellation signal via watch channel
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl TransferControl {
    pub fn new() -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            cancel_tx,
            cancel_rx,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }
}

impl Default for TransferControl {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that unregisters a transfer from [`TransferManager`] on drop,
/// whichever way the job returns.
pub struct TransferGuard {
    manager: Option<Arc<TransferManager>>,
    transfer_id: String,
}

impl TransferGuard {
    /// If `manager` is `None` the guard is a no-op.
    pub fn new(manager: Option<&Arc<TransferManager>>, transfer_id: String) -> Self {
        Self {
            manager: manager.cloned(),
            transfer_id,
        }
    }

    pub fn transfer_id(&self) -> &str {
        &self.transfer_id
    }
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        if let Some(tm) = &self.manager {
            tm.unregister(&self.transfer_id);
        }
    }
}

/// Registry of running jobs, so a UI (or a closing session) can cancel them
pub struct TransferManager {
    controls: RwLock<HashMap<String, Arc<TransferControl>>>,
}

impl TransferManager {
    pub fn new() -> Self {
        Self {
            controls: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new transfer and get its control handle
    pub fn register(&self, transfer_id: &str) -> Arc<TransferControl> {
        let control = Arc::new(TransferControl::new());
        self.track(transfer_id, control.clone());
        control
    }

    /// Register a caller-supplied control handle
    pub fn track(&self, transfer_id: &str, control: Arc<TransferControl>) {
        self.controls
            .write()
            .insert(transfer_id.to_string(), control);
        debug!("Registered transfer: {}", transfer_id);
    }

    /// Remove a transfer from tracking
    pub fn unregister(&self, transfer_id: &str) {
        self.controls.write().remove(transfer_id);
        debug!("Unregistered transfer: {}", transfer_id);
    }

    /// Get the number of currently registered (tracked) transfers
    pub fn registered_count(&self) -> usize {
        self.controls.read().len()
    }

    /// Cancel a specific transfer
    pub fn cancel(&self, transfer_id: &str) -> bool {
        if let Some(control) = self.controls.read().get(transfer_id) {
            control.cancel();
            info!("Cancelled transfer: {}", transfer_id);
            true
        } else {
            warn!("Transfer not found for cancel: {}", transfer_id);
            false
        }
    }

    /// Cancel all active transfers
    pub fn cancel_all(&self) {
        let controls = self.controls.read();
        for (id, control) in controls.iter() {
            control.cancel();
            info!("Cancelled transfer: {}", id);
        }
    }
}

impl Default for TransferManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Check loop helper for cancel during transfer
pub fn check_transfer_control(control: &TransferControl) -> Result<(), SftpError> {
    if control.is_cancelled() {
        return Err(SftpError::TransferCancelled);
    }
    Ok(())
}

/// Run an operation whose failure must not fail the job.
///
/// The error is logged (a missing path at debug level, anything else as a
/// warning) and `false` is returned.
pub async fn best_effort<F>(what: &str, op: F) -> bool
where
    F: Future<Output = Result<(), SftpError>>,
{
    match op.await {
        Ok(()) => true,
        Err(e) if e.is_not_found() => {
            debug!("best-effort {} skipped: {}", what, e);
            false
        }
        Err(e) => {
            warn!("best-effort {} failed: {}", what, e);
            false
        }
    }
}
