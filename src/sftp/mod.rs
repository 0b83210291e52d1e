//! SFTP transfer module
//!
//! Remote file primitives over an SFTP channel, plus recursive directory
//! upload and download with atomic per-file uploads and progress reporting.

pub mod channel;
pub mod engine;
pub mod error;
pub mod handle;
pub mod local;
pub mod memory;
pub mod path_utils;
pub mod progress;
pub mod russh_channel;
pub mod session;
pub mod transfer;
pub mod types;

pub use channel::{ChannelHandle, ChannelIo, SftpChannel};
pub use engine::DirectoryTransferEngine;
pub use error::SftpError;
pub use handle::RemoteFileHandle;
pub use local::LocalFileHandle;
pub use memory::{MemoryChannel, MemoryFaults};
pub use progress::{
    ChunkReader, ChunkWriter, EventProgress, LocalFileSink, LocalFileSource, NullProgress,
    ProgressSink, TransferProgress, TransferSink, TransferSource, TransferState,
};
pub use russh_channel::RusshSftpChannel;
pub use session::RemoteSession;
pub use transfer::{
    best_effort, check_transfer_control, TransferControl, TransferGuard, TransferManager,
};
pub use types::*;
