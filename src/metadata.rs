//! Metadata bootstrap.
//!
//! Every placement-group member keeps a replica of `{object}.metadata`: one
//! local record per data container, named by the container URL, whose payload
//! is that container's central directory. The resolver walks the placement
//! group in order and keeps the first replica that parses cleanly.

use crate::addressing::metadata_url;
use crate::archive_format::{
    checksum, peek_signature, ArchiveFormatError, LocalRecordHeader, LOCAL_RECORD_SIGNATURE,
};
use crate::config::ObjectConfig;
use crate::transport::{RemoteFile, Transport, TransportError};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Metadata format error: {0}")]
    Format(#[from] ArchiveFormatError),

    #[error("Metadata replica {url} is too large to read ({size} bytes)")]
    TooLarge { url: String, size: u64 },

    #[error("No usable metadata replica after {attempts} attempts, last error: {last}")]
    Exhausted { attempts: usize, last: String },
}

/// Container URL -> raw central directory of that container.
///
/// Bootstrap-only; dropped once the archive set is built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataImage {
    records: HashMap<String, Bytes>,
}

impl MetadataImage {
    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.records.get(name)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn remove(&mut self, name: &str) -> Option<Bytes> {
        self.records.remove(name)
    }
}

/// Parse a metadata image.
///
/// Reads at most `max_count` records. A signature mismatch (including running
/// out of bytes) ends the image, which is only acceptable once `min_count`
/// records have been read. Any record that overruns the buffer or fails its
/// checksum rejects the whole image.
pub fn parse_metadata_image(
    data: &Bytes,
    min_count: usize,
    max_count: usize,
) -> Result<MetadataImage, ArchiveFormatError> {
    let mut image = MetadataImage::default();
    let mut pos = 0usize;

    for i in 0..max_count {
        let rest = &data[pos..];
        if peek_signature(rest) != Some(LOCAL_RECORD_SIGNATURE) {
            if i < min_count {
                return Err(ArchiveFormatError::TooFewRecords {
                    found: i,
                    required: min_count,
                });
            }
            break;
        }

        let header = LocalRecordHeader::parse(rest)?;
        header.require_stored()?;
        let header_length = header.header_length();
        let payload_length = header.uncompressed_size as usize;
        if header_length + payload_length > rest.len() {
            return Err(ArchiveFormatError::Truncated {
                needed: header_length + payload_length,
                available: rest.len(),
            });
        }

        let start = pos + header_length;
        let payload = data.slice(start..start + payload_length);
        let calculated = checksum(&payload);
        if calculated != header.checksum {
            return Err(ArchiveFormatError::ChecksumMismatch {
                name: header.name,
                expected: header.checksum,
                calculated,
            });
        }

        debug!("Metadata record {} ({} bytes)", header.name, payload_length);
        image.records.insert(header.name, payload);
        pos = start + payload_length;
    }

    Ok(image)
}

/// A metadata image together with where it came from.
#[derive(Debug, Clone)]
pub struct ResolvedMetadata {
    pub image: MetadataImage,
    pub url: String,
    /// Placement-group members tried, including the one that succeeded
    pub attempts: usize,
}

/// Fetches the first valid metadata replica, in placement-group order.
pub struct MetadataResolver {
    transport: Arc<dyn Transport>,
    config: Arc<ObjectConfig>,
}

impl MetadataResolver {
    pub fn new(transport: Arc<dyn Transport>, config: Arc<ObjectConfig>) -> Self {
        Self { transport, config }
    }

    pub async fn resolve(&self) -> Result<ResolvedMetadata, MetadataError> {
        let mut last = String::from("empty placement group");

        for (index, server) in self.config.placement_group.iter().enumerate() {
            let attempt = MetadataAttempt {
                index,
                url: metadata_url(server, &self.config.object),
            };
            match attempt.run(self.transport.as_ref(), &self.config).await {
                Ok(image) => {
                    info!(
                        "Resolved metadata for {} from {} ({} records, attempt {})",
                        self.config.object,
                        attempt.url,
                        image.len(),
                        index + 1
                    );
                    return Ok(ResolvedMetadata {
                        image,
                        url: attempt.url,
                        attempts: index + 1,
                    });
                }
                Err(e) => {
                    warn!("Metadata replica {} unusable: {}", attempt.url, e);
                    last = e.to_string();
                }
            }
        }

        Err(MetadataError::Exhausted {
            attempts: self.config.placement_group.len(),
            last,
        })
    }
}

/// One try against one placement-group member.
struct MetadataAttempt {
    index: usize,
    url: String,
}

impl MetadataAttempt {
    async fn run(
        &self,
        transport: &dyn Transport,
        config: &ObjectConfig,
    ) -> Result<MetadataImage, MetadataError> {
        debug!("Opening metadata replica #{}: {}", self.index, self.url);
        let file = transport.open(&self.url).await?;

        let result = Self::read_and_parse(file.as_ref(), config).await;

        // release on every path once the open succeeded
        if let Err(e) = file.close().await {
            debug!("Closing {} failed: {}", self.url, e);
        }
        result
    }

    async fn read_and_parse(
        file: &dyn RemoteFile,
        config: &ObjectConfig,
    ) -> Result<MetadataImage, MetadataError> {
        let size = file.size().await?;
        let length = usize::try_from(size).map_err(|_| MetadataError::TooLarge {
            url: file.url().to_string(),
            size,
        })?;
        let data = file.read_at(0, length).await?;
        let image = parse_metadata_image(
            &data,
            config.stripe_count(),
            config.placement_group.len(),
        )?;
        Ok(image)
    }
}
