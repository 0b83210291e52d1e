//! SFTP data types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::path_utils::remote_file_name;

/// Entry kind, derived from the `S_IFMT` bits of a stat result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    /// Device, socket, fifo or anything the server did not describe
    Other,
}

impl EntryKind {
    /// Classify raw mode bits. A mode of `None` means the server sent no
    /// permissions attribute, which we cannot classify.
    pub fn from_mode(mode: Option<u32>) -> Self {
        match mode.map(|m| m & mode_bits::S_IFMT) {
            Some(mode_bits::S_IFDIR) => EntryKind::Directory,
            Some(mode_bits::S_IFREG) => EntryKind::File,
            Some(mode_bits::S_IFLNK) => EntryKind::Symlink,
            _ => EntryKind::Other,
        }
    }

    /// Classify a local entry from `symlink_metadata`
    pub fn from_local(file_type: std::fs::FileType) -> Self {
        if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        }
    }
}

/// Unix file type bits, as carried in the SFTP permissions attribute
pub mod mode_bits {
    pub const S_IFMT: u32 = 0o170000;
    pub const S_IFSOCK: u32 = 0o140000;
    pub const S_IFLNK: u32 = 0o120000;
    pub const S_IFREG: u32 = 0o100000;
    pub const S_IFBLK: u32 = 0o060000;
    pub const S_IFDIR: u32 = 0o040000;
    pub const S_IFCHR: u32 = 0o020000;
    pub const S_IFIFO: u32 = 0o010000;
    /// Permission part of the mode
    pub const PERMISSIONS: u32 = 0o7777;
}

/// Protocol-native attributes, as returned by a channel's stat/lstat/readdir
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryAttributes {
    /// Type and permission bits
    pub permissions: Option<u32>,
    pub size: Option<u64>,
    /// Modification time, seconds since the Unix epoch
    pub mtime: Option<u32>,
}

/// One child returned by a channel's readdir
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDirEntry {
    pub file_name: String,
    pub attrs: EntryAttributes,
}

/// Snapshot of one remote path's metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntryStat {
    /// Last path component
    pub name: String,
    /// Absolute remote path
    pub full_path: String,
    pub kind: EntryKind,
    /// Raw permission/type bits (0 if the server did not send them)
    pub mode: u32,
    /// Size in bytes, meaningful only for regular files
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl RemoteEntryStat {
    pub fn from_attributes(full_path: &str, attrs: &EntryAttributes) -> Self {
        let modified = attrs
            .mtime
            .and_then(|t| DateTime::<Utc>::from_timestamp(t as i64, 0))
            .unwrap_or_default();

        Self {
            name: remote_file_name(full_path).to_string(),
            full_path: full_path.to_string(),
            kind: EntryKind::from_mode(attrs.permissions),
            mode: attrs.permissions.unwrap_or(0),
            size: attrs.size.unwrap_or(0),
            modified,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == EntryKind::Symlink
    }

    /// Permission bits without the file type
    pub fn permissions(&self) -> u32 {
        self.mode & mode_bits::PERMISSIONS
    }
}

/// Open mode for remote and local file handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenMode {
    Read,
    /// Create or truncate
    Write,
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Outcome of a directory transfer job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSummary {
    pub files: u64,
    pub directories: u64,
    /// Symlinks and special files that were not transferred
    pub skipped: u64,
    pub bytes: u64,
}

/// Constants for SFTP operations
pub mod constants {
    /// Maximum chunk size for a single read (256 KB)
    pub const CHUNK_SIZE: usize = 256 * 1024;

    /// Suffix of the temporary file an upload is written to before rename
    pub const DEFAULT_TEMP_SUFFIX: &str = ".tabby-upload";

    /// Default bound on directory recursion
    pub const DEFAULT_MAX_DEPTH: usize = 64;

    /// Default per-operation I/O timeout in seconds (5 minutes)
    pub const DEFAULT_IO_TIMEOUT_SECS: u64 = 300;
}
