/// Core error types shared across the rootbox crate
use thiserror::Error;

/// Custom error types for rootbox operations
#[derive(Error, Debug)]
pub enum RootboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Short read or sequence desync on the synchronization channel
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer process sent the reserved error sentinel
    #[error("An error occurred in the peer process (expected sequence number {0})")]
    RemoteFailure(i32),

    /// Channel, descriptor, or memory allocation failure
    #[error("Resource error: {0}")]
    Resource(String),

    /// Syscall failure during a storage create/mount/umount/destroy
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation not implemented by the selected storage backend
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

/// Result type alias for rootbox operations
pub type Result<T> = std::result::Result<T, RootboxError>;
