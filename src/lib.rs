//! Library entrypoint for ecstore.
//!
//! Read path of an erasure-coded object store: an object is split into
//! blocks, each block into `k` data and `p` parity stripes, and every stripe
//! lives as a named chunk inside one placement-group member's container.
//! [`Reader`] opens an object and serves arbitrary byte ranges of it,
//! reconstructing stripes that are missing or corrupt.

pub mod addressing;
pub mod archive;
pub mod archive_format;
pub mod cache;
pub mod config;
pub mod erasure;
pub mod fetcher;
pub mod metadata;
pub mod reader;
pub mod recovery;
pub mod transport;

pub use archive::{ArchiveSet, ArchiveSummary, DirectorySource};
pub use archive_format::ArchiveBuilder;
pub use cache::StripeError;
pub use config::{CacheConfig, ConfigError, ObjectConfig, ReaderConfig};
pub use erasure::{encode_block, ErasureCodec, ErasureError, ReedSolomonCodec};
pub use metadata::{MetadataError, MetadataImage, MetadataResolver};
pub use reader::{OpenSummary, Reader, ReaderError};
pub use transport::{FsTransport, MemoryTransport, RemoteFile, Transport, TransportError};
