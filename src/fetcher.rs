//! Fetches one stripe's chunk from its owning server and verifies it against
//! the checksum in that server's directory.

use crate::archive::{ArchiveError, ArchiveSet};
use crate::archive_format::checksum;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Transport failure reading {chunk} from {url}: {reason}")]
    Transport {
        chunk: String,
        url: String,
        reason: String,
    },

    #[error("Short read of {chunk}: expected {expected} bytes, got {actual}")]
    ShortRead {
        chunk: String,
        expected: usize,
        actual: usize,
    },

    #[error("Checksum mismatch for {chunk}: expected {expected:08x}, calculated {calculated:08x}")]
    Integrity {
        chunk: String,
        expected: u32,
        calculated: u32,
    },
}

/// A chunk that passed verification, or proof that no directory lists it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchedStripe {
    Present(Bytes),
    /// Not in any directory: the stripe lies past the end of the object
    Absent,
}

impl FetchedStripe {
    pub fn into_bytes(self) -> Bytes {
        match self {
            FetchedStripe::Present(data) => data,
            FetchedStripe::Absent => Bytes::new(),
        }
    }
}

pub struct StripeFetcher {
    archives: Arc<ArchiveSet>,
}

impl StripeFetcher {
    pub fn new(archives: Arc<ArchiveSet>) -> Self {
        Self { archives }
    }

    pub async fn fetch(&self, chunk: &str) -> Result<FetchedStripe, FetchError> {
        let Some(archive) = self.archives.locate(chunk) else {
            debug!("Chunk {} is not listed anywhere, past end of object", chunk);
            return Ok(FetchedStripe::Absent);
        };

        let transport_error = |e: ArchiveError| FetchError::Transport {
            chunk: chunk.to_string(),
            url: archive.url().to_string(),
            reason: e.to_string(),
        };

        let expected_len = archive.stat(chunk).map_err(transport_error)? as usize;
        let expected_checksum = archive.entry(chunk).map_err(transport_error)?.checksum;

        debug!("Reading {} ({} bytes) from {}", chunk, expected_len, archive.url());
        let data = archive.read_chunk(chunk).await.map_err(transport_error)?;
        if data.len() != expected_len {
            warn!(
                "Short read of {} from {}: {} of {} bytes",
                chunk,
                archive.url(),
                data.len(),
                expected_len
            );
            return Err(FetchError::ShortRead {
                chunk: chunk.to_string(),
                expected: expected_len,
                actual: data.len(),
            });
        }

        let calculated = checksum(&data);
        if calculated != expected_checksum {
            warn!(
                "Checksum mismatch for {} from {}: expected {:08x}, calculated {:08x}",
                chunk,
                archive.url(),
                expected_checksum,
                calculated
            );
            return Err(FetchError::Integrity {
                chunk: chunk.to_string(),
                expected: expected_checksum,
                calculated,
            });
        }

        Ok(FetchedStripe::Present(data))
    }

    /// Recorded size and checksum of a chunk, when some directory lists it
    pub fn expected(&self, chunk: &str) -> Option<(usize, u32)> {
        let entry = self.archives.locate(chunk)?.entry(chunk).ok()?;
        Some((entry.uncompressed_size as usize, entry.checksum))
    }

    pub fn archives(&self) -> &ArchiveSet {
        &self.archives
    }
}
