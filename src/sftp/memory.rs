//! In-memory channel
//!
//! A [`SftpChannel`] over an in-process tree, for headless use and tests.
//! It follows SFTP v3 server semantics where they matter to the engine:
//! `rename` refuses to overwrite, `mkdir` fails on an existing path and
//! `rmdir` only removes empty directories.
//!
//! [`MemoryFaults`] injects the failures a real connection produces: a write
//! that fails on the Nth call, short writes, `WouldBlock` answers, reads or
//! closes that never complete, and closing the connection.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use super::channel::{ChannelHandle, ChannelIo, SftpChannel};
use super::error::SftpError;
use super::types::{mode_bits, EntryAttributes, OpenMode, RemoteDirEntry};

const MAX_SYMLINK_HOPS: usize = 8;
const DEFAULT_MTIME: u32 = 1_700_000_000;

#[derive(Debug, Clone)]
enum MemoryNode {
    File { data: Vec<u8>, mode: u32 },
    Directory { mode: u32 },
    Symlink { target: String },
    /// Device, socket or fifo; only the type bits matter
    Special { mode: u32 },
}

impl MemoryNode {
    fn attributes(&self) -> EntryAttributes {
        let (permissions, size) = match self {
            MemoryNode::File { data, mode } => (mode_bits::S_IFREG | mode, data.len() as u64),
            MemoryNode::Directory { mode } => (mode_bits::S_IFDIR | mode, 4096),
            MemoryNode::Symlink { target } => (mode_bits::S_IFLNK | 0o777, target.len() as u64),
            MemoryNode::Special { mode } => (*mode, 0),
        };
        EntryAttributes {
            permissions: Some(permissions),
            size: Some(size),
            mtime: Some(DEFAULT_MTIME),
        }
    }
}

#[derive(Debug)]
struct OpenFile {
    path: String,
    mode: OpenMode,
}

/// Failure injection knobs. All counters are 1-based call numbers.
#[derive(Debug, Default, Clone)]
pub struct MemoryFaults {
    /// Fail the Nth `write` call
    pub fail_write_on: Option<usize>,
    /// Fail every `open` of this path
    pub fail_open_path: Option<String>,
    /// Accept at most this many bytes per `write`
    pub max_write_len: Option<usize>,
    /// Answer every other read/write with `WouldBlock`
    pub would_block: bool,
    /// Reads never complete (until the connection closes)
    pub stall_reads: bool,
    /// Handle closes never complete
    pub stall_closes: bool,
}

#[derive(Default)]
struct MemoryState {
    nodes: BTreeMap<String, MemoryNode>,
    handles: HashMap<String, OpenFile>,
    faults: MemoryFaults,
    next_handle: u64,
    blocked_last: bool,
}

pub struct MemoryChannel {
    state: Mutex<MemoryState>,
    write_calls: AtomicUsize,
    closed_tx: watch::Sender<bool>,
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

fn is_child_of(path: &str, parent: &str) -> bool {
    path != parent && parent_of(path) == Some(parent)
}

impl MemoryChannel {
    /// Empty tree with only `/`
    pub fn new() -> Self {
        let mut state = MemoryState::default();
        state
            .nodes
            .insert("/".to_string(), MemoryNode::Directory { mode: 0o755 });
        let (closed_tx, _) = watch::channel(false);
        Self {
            state: Mutex::new(state),
            write_calls: AtomicUsize::new(0),
            closed_tx,
        }
    }

    pub fn set_faults(&self, faults: MemoryFaults) {
        self.state.lock().faults = faults;
    }

    /// Create a directory and any missing parents
    pub fn add_dir(&self, path: &str) {
        let path = normalize(path);
        let mut state = self.state.lock();
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            state
                .nodes
                .entry(current.clone())
                .or_insert(MemoryNode::Directory { mode: 0o755 });
        }
    }

    /// Like [`add_dir`](Self::add_dir), with explicit permission bits for
    /// the last component
    pub fn add_dir_with_mode(&self, path: &str, mode: u32) {
        self.add_dir(path);
        self.state
            .lock()
            .nodes
            .insert(normalize(path), MemoryNode::Directory { mode: mode & 0o7777 });
    }

    /// Create a file (and its parent directories)
    pub fn add_file(&self, path: &str, contents: &[u8]) {
        let path = normalize(path);
        if let Some(parent) = parent_of(&path) {
            self.add_dir(parent);
        }
        self.state.lock().nodes.insert(
            path,
            MemoryNode::File {
                data: contents.to_vec(),
                mode: 0o644,
            },
        );
    }

    pub fn add_symlink(&self, path: &str, target: &str) {
        let path = normalize(path);
        if let Some(parent) = parent_of(&path) {
            self.add_dir(parent);
        }
        self.state.lock().nodes.insert(
            path,
            MemoryNode::Symlink {
                target: target.to_string(),
            },
        );
    }

    /// Add a special file with the given raw mode (e.g. `S_IFSOCK | 0o755`)
    pub fn add_special(&self, path: &str, mode: u32) {
        let path = normalize(path);
        if let Some(parent) = parent_of(&path) {
            self.add_dir(parent);
        }
        self.state
            .lock()
            .nodes
            .insert(path, MemoryNode::Special { mode });
    }

    pub fn file_contents(&self, path: &str) -> Option<Vec<u8>> {
        match self.state.lock().nodes.get(&normalize(path)) {
            Some(MemoryNode::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().nodes.contains_key(&normalize(path))
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(
            self.state.lock().nodes.get(&normalize(path)),
            Some(MemoryNode::Directory { .. })
        )
    }

    /// All paths in the tree, sorted
    pub fn paths(&self) -> Vec<String> {
        self.state.lock().nodes.keys().cloned().collect()
    }

    pub fn open_handles(&self) -> usize {
        self.state.lock().handles.len()
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Simulate the connection going away
    pub fn close_connection(&self) {
        debug!("Memory channel closed");
        self.closed_tx.send_replace(true);
    }

    fn ensure_open(&self) -> Result<(), SftpError> {
        if *self.closed_tx.borrow() {
            Err(SftpError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    /// Follow symlinks in every component until a non-link node is reached
    fn resolve(state: &MemoryState, path: &str) -> Result<String, SftpError> {
        let mut hops = 0;
        Self::resolve_within(state, path, &mut hops)
    }

    /// Follow symlinks in the parent components only; the last component is
    /// kept as is, like `lstat` and `rename` on a server
    fn locate(state: &MemoryState, path: &str) -> Result<String, SftpError> {
        let mut hops = 0;
        Self::locate_within(state, path, &mut hops)
    }

    fn resolve_within(
        state: &MemoryState,
        path: &str,
        hops: &mut usize,
    ) -> Result<String, SftpError> {
        let mut current = Self::locate_within(state, path, hops)?;
        loop {
            match state.nodes.get(&current) {
                Some(MemoryNode::Symlink { target }) => {
                    *hops += 1;
                    if *hops > MAX_SYMLINK_HOPS {
                        return Err(SftpError::ProtocolError(format!(
                            "Too many symlinks: {}",
                            path
                        )));
                    }
                    let next = if target.starts_with('/') {
                        target.clone()
                    } else {
                        let parent = parent_of(&current).unwrap_or("/");
                        format!("{}/{}", parent.trim_end_matches('/'), target)
                    };
                    current = Self::locate_within(state, &next, hops)?;
                }
                Some(_) => return Ok(current),
                None => return Err(SftpError::FileNotFound(current)),
            }
        }
    }

    fn locate_within(
        state: &MemoryState,
        path: &str,
        hops: &mut usize,
    ) -> Result<String, SftpError> {
        let path = normalize(path);
        let Some(parent) = parent_of(&path) else {
            return Ok(path);
        };
        let name = path.rsplit('/').next().unwrap_or_default();
        let dir = Self::resolve_within(state, parent, hops)?;
        Ok(format!("{}/{}", dir.trim_end_matches('/'), name))
    }

    fn should_block(state: &mut MemoryState) -> bool {
        if !state.faults.would_block {
            return false;
        }
        state.blocked_last = !state.blocked_last;
        state.blocked_last
    }

    fn require_parent_dir(state: &MemoryState, path: &str) -> Result<(), SftpError> {
        let parent = parent_of(path).ok_or_else(|| SftpError::InvalidPath(path.to_string()))?;
        match state.nodes.get(parent) {
            Some(MemoryNode::Directory { .. }) => Ok(()),
            Some(_) => Err(SftpError::ProtocolError(format!("Not a directory: {}", parent))),
            None => Err(SftpError::FileNotFound(parent.to_string())),
        }
    }
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SftpChannel for MemoryChannel {
    async fn readdir(&self, path: &str) -> Result<Vec<RemoteDirEntry>, SftpError> {
        self.ensure_open()?;
        let state = self.state.lock();
        let dir = Self::resolve(&state, path)?;
        if !matches!(state.nodes.get(&dir), Some(MemoryNode::Directory { .. })) {
            return Err(SftpError::ProtocolError(format!("Not a directory: {}", dir)));
        }

        Ok(state
            .nodes
            .iter()
            .filter(|(p, _)| is_child_of(p, &dir))
            .map(|(p, node)| RemoteDirEntry {
                file_name: p.rsplit('/').next().unwrap_or_default().to_string(),
                attrs: node.attributes(),
            })
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<EntryAttributes, SftpError> {
        self.ensure_open()?;
        let state = self.state.lock();
        let resolved = Self::resolve(&state, path)?;
        state
            .nodes
            .get(&resolved)
            .map(MemoryNode::attributes)
            .ok_or(SftpError::FileNotFound(resolved))
    }

    async fn lstat(&self, path: &str) -> Result<EntryAttributes, SftpError> {
        self.ensure_open()?;
        let state = self.state.lock();
        let path = Self::locate(&state, path)?;
        state
            .nodes
            .get(&path)
            .map(MemoryNode::attributes)
            .ok_or(SftpError::FileNotFound(path))
    }

    async fn readlink(&self, path: &str) -> Result<String, SftpError> {
        self.ensure_open()?;
        let state = self.state.lock();
        let path = Self::locate(&state, path)?;
        match state.nodes.get(&path) {
            Some(MemoryNode::Symlink { target }) => Ok(target.clone()),
            Some(_) => Err(SftpError::ProtocolError(format!("Not a symlink: {}", path))),
            None => Err(SftpError::FileNotFound(path)),
        }
    }

    async fn open(&self, path: &str, mode: OpenMode) -> Result<ChannelHandle, SftpError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        let path = normalize(path);

        if state.faults.fail_open_path.as_deref() == Some(path.as_str()) {
            return Err(SftpError::PermissionDenied(path));
        }

        let target = match mode {
            OpenMode::Read => {
                let resolved = Self::resolve(&state, &path)?;
                if !matches!(state.nodes.get(&resolved), Some(MemoryNode::File { .. })) {
                    return Err(SftpError::ProtocolError(format!("Not a file: {}", resolved)));
                }
                resolved
            }
            OpenMode::Write => {
                let resolved = match Self::resolve(&state, &path) {
                    Ok(p) => p,
                    Err(SftpError::FileNotFound(_)) => Self::locate(&state, &path)?,
                    Err(e) => return Err(e),
                };
                let existing = state
                    .nodes
                    .get(&resolved)
                    .map(|node| matches!(node, MemoryNode::File { .. }));
                match existing {
                    Some(true) => {
                        if let Some(MemoryNode::File { data, .. }) = state.nodes.get_mut(&resolved) {
                            data.clear();
                        }
                    }
                    Some(false) => {
                        return Err(SftpError::ProtocolError(format!(
                            "Not a file: {}",
                            resolved
                        )))
                    }
                    None => {
                        Self::require_parent_dir(&state, &resolved)?;
                        state.nodes.insert(
                            resolved.clone(),
                            MemoryNode::File {
                                data: Vec::new(),
                                mode: 0o644,
                            },
                        );
                    }
                }
                resolved
            }
        };

        state.next_handle += 1;
        let id = format!("mem-{}", state.next_handle);
        state.handles.insert(id.clone(), OpenFile { path: target, mode });
        Ok(ChannelHandle(id))
    }

    async fn read(
        &self,
        handle: &ChannelHandle,
        offset: u64,
        len: usize,
    ) -> Result<ChannelIo<Bytes>, SftpError> {
        self.ensure_open()?;
        let stall = self.state.lock().faults.stall_reads;
        if stall {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock();
        if Self::should_block(&mut state) {
            return Ok(ChannelIo::WouldBlock);
        }

        let open = state
            .handles
            .get(&handle.0)
            .ok_or_else(|| SftpError::InvalidHandle(handle.to_string()))?;
        if open.mode != OpenMode::Read {
            return Err(SftpError::ProtocolError("Handle not open for reading".into()));
        }

        match state.nodes.get(&open.path) {
            Some(MemoryNode::File { data, .. }) => {
                let start = (offset as usize).min(data.len());
                let end = start.saturating_add(len).min(data.len());
                Ok(ChannelIo::Ready(Bytes::copy_from_slice(&data[start..end])))
            }
            _ => Err(SftpError::FileNotFound(open.path.clone())),
        }
    }

    async fn write(
        &self,
        handle: &ChannelHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<ChannelIo<usize>, SftpError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if Self::should_block(&mut state) {
            return Ok(ChannelIo::WouldBlock);
        }

        let call = self.write_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if state.faults.fail_write_on == Some(call) {
            return Err(SftpError::ProtocolError(format!(
                "Injected failure on write #{}",
                call
            )));
        }

        let accepted = state
            .faults
            .max_write_len
            .map(|max| data.len().min(max))
            .unwrap_or(data.len());

        let open = state
            .handles
            .get(&handle.0)
            .ok_or_else(|| SftpError::InvalidHandle(handle.to_string()))?;
        if open.mode != OpenMode::Write {
            return Err(SftpError::ProtocolError("Handle not open for writing".into()));
        }
        let path = open.path.clone();

        match state.nodes.get_mut(&path) {
            Some(MemoryNode::File { data: contents, .. }) => {
                let start = offset as usize;
                let end = start + accepted;
                if contents.len() < end {
                    contents.resize(end, 0);
                }
                contents[start..end].copy_from_slice(&data[..accepted]);
                Ok(ChannelIo::Ready(accepted))
            }
            _ => Err(SftpError::FileNotFound(path)),
        }
    }

    async fn close(&self, handle: &ChannelHandle) -> Result<(), SftpError> {
        let stall = self.state.lock().faults.stall_closes;
        if stall {
            std::future::pending::<()>().await;
        }

        // A handle may be released even after the connection dropped
        self.state
            .lock()
            .handles
            .remove(&handle.0)
            .map(|_| ())
            .ok_or_else(|| SftpError::InvalidHandle(handle.to_string()))
    }

    async fn rmdir(&self, path: &str) -> Result<(), SftpError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        let path = Self::locate(&state, path)?;
        match state.nodes.get(&path) {
            Some(MemoryNode::Directory { .. }) => {}
            Some(_) => return Err(SftpError::ProtocolError(format!("Not a directory: {}", path))),
            None => return Err(SftpError::FileNotFound(path)),
        }
        if state.nodes.keys().any(|p| is_child_of(p, &path)) {
            return Err(SftpError::ProtocolError(format!("Directory not empty: {}", path)));
        }
        state.nodes.remove(&path);
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<(), SftpError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        let path = Self::locate(&state, path)?;
        if state.nodes.contains_key(&path) {
            return Err(SftpError::ProtocolError(format!("Failure: {} exists", path)));
        }
        Self::require_parent_dir(&state, &path)?;
        state
            .nodes
            .insert(path, MemoryNode::Directory { mode: 0o755 });
        Ok(())
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), SftpError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        let old_path = Self::locate(&state, old_path)?;
        let new_path = Self::locate(&state, new_path)?;

        if !state.nodes.contains_key(&old_path) {
            return Err(SftpError::FileNotFound(old_path));
        }
        if state.nodes.contains_key(&new_path) {
            return Err(SftpError::ProtocolError(format!("Failure: {} exists", new_path)));
        }
        Self::require_parent_dir(&state, &new_path)?;

        let prefix = format!("{}/", old_path);
        let moved: Vec<String> = state
            .nodes
            .keys()
            .filter(|p| **p == old_path || p.starts_with(&prefix))
            .cloned()
            .collect();
        for path in moved {
            if let Some(node) = state.nodes.remove(&path) {
                let renamed = format!("{}{}", new_path, &path[old_path.len()..]);
                state.nodes.insert(renamed, node);
            }
        }
        Ok(())
    }

    async fn unlink(&self, path: &str) -> Result<(), SftpError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        let path = Self::locate(&state, path)?;
        match state.nodes.get(&path) {
            Some(MemoryNode::Directory { .. }) => {
                Err(SftpError::ProtocolError(format!("Is a directory: {}", path)))
            }
            Some(_) => {
                state.nodes.remove(&path);
                Ok(())
            }
            None => Err(SftpError::FileNotFound(path)),
        }
    }

    async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn shutdown(&self) -> Result<(), SftpError> {
        self.close_connection();
        Ok(())
    }
}
