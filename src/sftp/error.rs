//! SFTP Error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SftpError {
    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("SFTP subsystem not available: {0}")]
    SubsystemNotAvailable(String),

    #[error("SFTP protocol error: {0}")]
    ProtocolError(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid file handle: {0}")]
    InvalidHandle(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Transfer cancelled")]
    TransferCancelled,

    #[error("Directory depth limit of {limit} exceeded at {path}")]
    DepthLimitExceeded { path: String, limit: usize },
}

impl SftpError {
    /// Whether this error came from the user cancelling the transfer
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SftpError::TransferCancelled)
    }

    /// Whether the remote side reported that the path does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            SftpError::FileNotFound(_) => true,
            SftpError::IoError(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<russh_sftp::client::error::Error> for SftpError {
    fn from(err: russh_sftp::client::error::Error) -> Self {
        map_sftp_error(err, "")
    }
}

impl From<russh::Error> for SftpError {
    fn from(err: russh::Error) -> Self {
        SftpError::ChannelError(err.to_string())
    }
}

/// Map russh-sftp errors to our error type, keeping the path for the common cases
pub fn map_sftp_error(err: russh_sftp::client::error::Error, path: &str) -> SftpError {
    let err_str = err.to_string();
    if err_str.contains("No such file") || err_str.contains("not found") {
        SftpError::FileNotFound(path.to_string())
    } else if err_str.contains("Permission denied") {
        SftpError::PermissionDenied(path.to_string())
    } else if err_str.contains("Connection lost") || err_str.contains("session closed") {
        SftpError::ConnectionClosed
    } else {
        SftpError::ProtocolError(err_str)
    }
}

// Make SftpError serializable for frontend event payloads
impl serde::Serialize for SftpError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
