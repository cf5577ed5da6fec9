//! Per-server data containers.
//!
//! Handles live in one arena indexed by a small integer. The chunk location
//! map and the URL index both store arena indices, so a handle has exactly one
//! owner. The whole set is built once during open and is read-only afterwards.

use crate::addressing::data_url;
use crate::archive_format::{
    parse_directory, ArchiveFormatError, DirectoryEntry, EndOfDirectory,
    END_OF_DIRECTORY_BASE_SIZE,
};
use crate::config::ObjectConfig;
use crate::metadata::MetadataImage;
use crate::transport::{RemoteFile, Transport, TransportError};
use bytes::Bytes;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Longest trailer comment a ZIP-style container may carry
const MAX_TRAILER_COMMENT: u64 = u16::MAX as u64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArchiveError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Archive format error: {0}")]
    Format(#[from] ArchiveFormatError),

    #[error("Archive {url} is not open: {reason}")]
    NotOpen { url: String, reason: String },

    #[error("Chunk {name} not found in {url}")]
    ChunkNotFound { name: String, url: String },
}

/// Where a handle's directory came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectorySource {
    /// Seeded from the metadata image
    Metadata,
    /// Read from the container's own trailer
    Trailer,
    /// Listed, or reachable, but no directory could be established
    Missing,
    /// Neither listed in the metadata image nor reachable: holds no chunks
    Unlisted,
}

/// One per-server data container.
pub struct ArchiveHandle {
    url: String,
    file: Option<Box<dyn RemoteFile>>,
    open_error: Option<TransportError>,
    directory: HashMap<String, DirectoryEntry>,
    source: DirectorySource,
}

impl ArchiveHandle {
    /// Open the container without touching its directory.
    pub async fn open_only(transport: &dyn Transport, url: String) -> Self {
        debug!("Opening data container {}", url);
        let (file, open_error) = match transport.open(&url).await {
            Ok(file) => (Some(file), None),
            Err(e) => {
                warn!("Data container {} failed to open: {}", url, e);
                (None, Some(e))
            }
        };
        Self {
            url,
            file,
            open_error,
            directory: HashMap::new(),
            source: DirectorySource::Missing,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn directory_source(&self) -> DirectorySource {
        self.source
    }

    pub fn chunk_names(&self) -> impl Iterator<Item = &str> {
        self.directory.keys().map(String::as_str)
    }

    pub fn chunk_count(&self) -> usize {
        self.directory.len()
    }

    /// Install a central directory obtained out of band.
    pub fn set_directory(&mut self, raw: &[u8]) -> Result<(), ArchiveFormatError> {
        self.install(parse_directory(raw)?, DirectorySource::Metadata);
        Ok(())
    }

    /// Read the directory from the container's own trailer: one read for the
    /// tail, one for the directory.
    pub async fn load_trailing_directory(&mut self) -> Result<(), ArchiveError> {
        let file = self.file()?;
        let size = file.size().await?;
        let tail_len = size.min(END_OF_DIRECTORY_BASE_SIZE as u64 + MAX_TRAILER_COMMENT);
        let tail = file.read_at(size - tail_len, tail_len as usize).await?;
        let trailer = EndOfDirectory::find(&tail)?;

        let raw = file
            .read_at(
                trailer.directory_offset as u64,
                trailer.directory_size as usize,
            )
            .await?;
        if raw.len() != trailer.directory_size as usize {
            return Err(ArchiveFormatError::Truncated {
                needed: trailer.directory_size as usize,
                available: raw.len(),
            }
            .into());
        }

        self.install(parse_directory(&raw)?, DirectorySource::Trailer);
        Ok(())
    }

    fn install(&mut self, entries: Vec<DirectoryEntry>, source: DirectorySource) {
        self.directory = entries
            .into_iter()
            .map(|entry| (entry.name.clone(), entry))
            .collect();
        self.source = source;
        debug!(
            "Directory of {} has {} chunks ({:?})",
            self.url,
            self.directory.len(),
            source
        );
    }

    fn file(&self) -> Result<&dyn RemoteFile, ArchiveError> {
        self.file.as_deref().ok_or_else(|| ArchiveError::NotOpen {
            url: self.url.clone(),
            reason: self
                .open_error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "closed".to_string()),
        })
    }

    pub fn entry(&self, name: &str) -> Result<&DirectoryEntry, ArchiveError> {
        self.directory
            .get(name)
            .ok_or_else(|| ArchiveError::ChunkNotFound {
                name: name.to_string(),
                url: self.url.clone(),
            })
    }

    /// Size of a chunk as recorded in the directory
    pub fn stat(&self, name: &str) -> Result<u64, ArchiveError> {
        Ok(self.entry(name)?.uncompressed_size as u64)
    }

    /// Read a chunk's full payload. The payload is returned unverified.
    pub async fn read_chunk(&self, name: &str) -> Result<Bytes, ArchiveError> {
        let entry = self.entry(name)?;
        let file = self.file()?;
        let data = file
            .read_at(entry.payload_offset(), entry.uncompressed_size as usize)
            .await?;
        Ok(data)
    }

    pub async fn close(&self) {
        if let Some(file) = &self.file {
            if let Err(e) = file.close().await {
                debug!("Closing {} failed: {}", self.url, e);
            }
        }
    }
}

/// Per-archive line of the open summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveSummary {
    pub url: String,
    pub reachable: bool,
    pub directory: DirectorySource,
    pub chunks: usize,
}

/// Arena of archive handles plus the chunk location map.
pub struct ArchiveSet {
    handles: Vec<ArchiveHandle>,
    by_url: HashMap<String, usize>,
    locations: HashMap<String, usize>,
}

impl ArchiveSet {
    /// Open every placement-group member's data container concurrently.
    pub async fn open_all(transport: &dyn Transport, config: &ObjectConfig) -> Vec<ArchiveHandle> {
        let opens = config
            .placement_group
            .iter()
            .map(|server| ArchiveHandle::open_only(transport, data_url(server, &config.object)));
        join_all(opens).await
    }

    /// Seed every handle's directory and build the location map.
    ///
    /// Handles are seeded from the metadata image even when their open failed,
    /// so their chunks stay addressable and a later read fails over to
    /// recovery. Reachable handles with no usable metadata record fall back to
    /// their own trailers, all read concurrently. An unreachable handle the
    /// image does not list is taken to hold nothing.
    pub async fn assemble(mut handles: Vec<ArchiveHandle>, mut image: MetadataImage) -> Self {
        let mut listed = Vec::with_capacity(handles.len());
        for handle in handles.iter_mut() {
            let raw = image.remove(handle.url());
            listed.push(raw.is_some());
            if let Some(raw) = raw {
                if let Err(e) = handle.set_directory(&raw) {
                    warn!("Directory record for {} is invalid: {}", handle.url(), e);
                }
            }
        }

        let trailers = handles
            .iter_mut()
            .filter(|h| h.is_open() && h.directory_source() == DirectorySource::Missing)
            .map(|handle| async move {
                if let Err(e) = handle.load_trailing_directory().await {
                    warn!("Reading trailing directory of {} failed: {}", handle.url(), e);
                }
            });
        join_all(trailers).await;

        for (handle, listed) in handles.iter_mut().zip(listed) {
            if !listed && !handle.is_open() {
                debug!("{} is unlisted and unreachable, holds no chunks", handle.url());
                handle.source = DirectorySource::Unlisted;
            }
        }

        for name in image.names() {
            debug!("Metadata record {} matches no placement-group member", name);
        }

        Self::index(handles)
    }

    fn index(handles: Vec<ArchiveHandle>) -> Self {
        let mut by_url = HashMap::with_capacity(handles.len());
        let mut locations = HashMap::new();

        for (index, handle) in handles.iter().enumerate() {
            by_url.insert(handle.url().to_string(), index);
            for name in handle.chunk_names() {
                if let Some(previous) = locations.insert(name.to_string(), index) {
                    warn!(
                        "Chunk {} listed by both {} and {}, using the latter",
                        name,
                        handles[previous].url(),
                        handle.url()
                    );
                }
            }
        }

        info!(
            "Indexed {} chunks across {} archives",
            locations.len(),
            handles.len()
        );

        Self {
            handles,
            by_url,
            locations,
        }
    }

    /// Owning archive of a chunk, `None` when no directory lists it
    pub fn locate(&self, chunk: &str) -> Option<&ArchiveHandle> {
        self.locations.get(chunk).map(|&index| &self.handles[index])
    }

    pub fn by_url(&self, url: &str) -> Option<&ArchiveHandle> {
        self.by_url.get(url).map(|&index| &self.handles[index])
    }

    pub fn handles(&self) -> &[ArchiveHandle] {
        &self.handles
    }

    pub fn chunk_count(&self) -> usize {
        self.locations.len()
    }

    /// Whether every archive that may hold chunks has a directory, so that a
    /// chunk missing from the location map really does not exist.
    pub fn is_complete(&self) -> bool {
        self.handles
            .iter()
            .all(|h| h.directory_source() != DirectorySource::Missing)
    }

    pub fn summary(&self) -> Vec<ArchiveSummary> {
        self.handles
            .iter()
            .map(|h| ArchiveSummary {
                url: h.url().to_string(),
                reachable: h.is_open(),
                directory: h.directory_source(),
                chunks: h.chunk_count(),
            })
            .collect()
    }

    pub async fn close_all(&self) {
        join_all(self.handles.iter().map(ArchiveHandle::close)).await;
    }
}
