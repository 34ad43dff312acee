use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),

    #[error("frame exceeds {0} bytes")]
    FrameTooLarge(usize),
}

impl ProtocolError {
    /// Decode failures poison a single frame; the stream stays usable.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ProtocolError::Io(_))
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file is {size} bytes, limit is {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("invalid file name '{0}'")]
    InvalidFileName(String),

    #[error("{} is not a regular file", .0.display())]
    NotAFile(PathBuf),

    #[error("another outgoing transfer is in progress")]
    Busy,

    #[error("connection closed")]
    ConnectionClosed,
}
