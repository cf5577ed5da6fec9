//! Remote I/O collaborator.
//!
//! The reader only needs to open a file by URL, learn its size, read a byte
//! range from it and close it. Every call is asynchronous; a caller that loses
//! interest simply drops the future. Timeouts, if any, are the transport's
//! business and surface as ordinary errors.

pub mod fs;
pub mod memory;

pub use self::fs::FsTransport;
pub use self::memory::MemoryTransport;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Not found: {url}")]
    NotFound { url: String },

    #[error("Server unavailable for {url}: {reason}")]
    Unavailable { url: String, reason: String },

    #[error("Read out of range on {url}: offset {offset} length {length}, size {size}")]
    OutOfRange {
        url: String,
        offset: u64,
        length: usize,
        size: u64,
    },

    #[error("File already closed: {url}")]
    Closed { url: String },

    #[error("IO error on {url}: {reason}")]
    Io { url: String, reason: String },
}

impl TransportError {
    pub(crate) fn io(url: &str, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            return TransportError::NotFound {
                url: url.to_string(),
            };
        }
        TransportError::Io {
            url: url.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Opens remote files.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<Box<dyn RemoteFile>, TransportError>;
}

/// An open remote file.
#[async_trait]
pub trait RemoteFile: Send + Sync {
    fn url(&self) -> &str;

    /// Size of the file in bytes
    async fn size(&self) -> Result<u64, TransportError>;

    /// Read up to `length` bytes at `offset`
    async fn read_at(&self, offset: u64, length: usize) -> Result<Bytes, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}
