//! Reader Module
//!
//! Entry point of the read path. `open` resolves the metadata image while the
//! per-server data containers are opened, then builds the chunk location map.
//! `read` splits a logical byte range into stripe sub-ranges and serves each
//! one through the stripe cache, fetching and recovering stripes on demand.

use crate::addressing::{chunk_name, decompose, AddressingError, StripeSpan};
use crate::archive::{ArchiveHandle, ArchiveSet, ArchiveSummary};
use crate::cache::{CacheEntry, ReadTicket, StripeCache, StripeError, StripeResult};
use crate::config::{CacheConfig, ConfigError, ObjectConfig, ReaderConfig};
use crate::erasure::{ErasureCodec, ErasureError, ReedSolomonCodec};
use crate::fetcher::StripeFetcher;
use crate::metadata::{MetadataError, MetadataResolver};
use crate::recovery::ErasureRecovery;
use crate::transport::Transport;
use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Erasure coding error: {0}")]
    Erasure(#[from] ErasureError),

    #[error("Codec geometry {data}+{parity} does not match object geometry {expected_data}+{expected_parity}")]
    CodecMismatch {
        expected_data: usize,
        expected_parity: usize,
        data: usize,
        parity: usize,
    },

    #[error("Reader was already opened")]
    AlreadyOpened,

    #[error("Reader is not open")]
    NotOpen,

    #[error("Metadata resolution failed: {0}")]
    Resolution(#[from] MetadataError),

    #[error("Addressing error: {0}")]
    Addressing(#[from] AddressingError),

    #[error(transparent)]
    Stripe(#[from] StripeError),
}

/// What `open` found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenSummary {
    pub object: String,
    pub metadata_url: String,
    pub metadata_attempts: usize,
    pub chunks: usize,
    pub archives: Vec<ArchiveSummary>,
}

pub struct Reader {
    config: Arc<ObjectConfig>,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn ErasureCodec>,
    cache_config: CacheConfig,
    opened: AtomicBool,
    inner: OnceLock<Arc<ReaderInner>>,
}

impl Reader {
    pub fn new(config: ObjectConfig, transport: Arc<dyn Transport>) -> Result<Self, ReaderError> {
        config.validate()?;
        let codec = ReedSolomonCodec::new(config.data_stripes, config.parity_stripes)?;
        Ok(Self {
            config: Arc::new(config),
            transport,
            codec: Arc::new(codec),
            cache_config: CacheConfig::default(),
            opened: AtomicBool::new(false),
            inner: OnceLock::new(),
        })
    }

    pub fn from_config(config: ReaderConfig, transport: Arc<dyn Transport>) -> Result<Self, ReaderError> {
        Ok(Self::new(config.object, transport)?.with_cache_config(config.cache))
    }

    pub fn with_cache_config(mut self, cache: CacheConfig) -> Self {
        self.cache_config = cache;
        self
    }

    /// Replace the erasure codec; its geometry must match the object's.
    pub fn with_codec(mut self, codec: Arc<dyn ErasureCodec>) -> Result<Self, ReaderError> {
        if codec.data_stripes() != self.config.data_stripes
            || codec.parity_stripes() != self.config.parity_stripes
        {
            return Err(ReaderError::CodecMismatch {
                expected_data: self.config.data_stripes,
                expected_parity: self.config.parity_stripes,
                data: codec.data_stripes(),
                parity: codec.parity_stripes(),
            });
        }
        self.codec = codec;
        Ok(self)
    }

    pub fn config(&self) -> &ObjectConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.inner.get().is_some()
    }

    /// Resolve metadata and open every data container, concurrently.
    ///
    /// May be called once. If every metadata replica fails the reader stays
    /// unusable.
    pub async fn open(&self) -> Result<OpenSummary, ReaderError> {
        if self.opened.swap(true, Ordering::SeqCst) {
            return Err(ReaderError::AlreadyOpened);
        }

        info!(
            "Opening {} across {} servers ({}+{})",
            self.config.object,
            self.config.placement_group.len(),
            self.config.data_stripes,
            self.config.parity_stripes
        );

        let resolver = MetadataResolver::new(Arc::clone(&self.transport), Arc::clone(&self.config));
        let (resolved, handles) = tokio::join!(
            resolver.resolve(),
            ArchiveSet::open_all(self.transport.as_ref(), &self.config)
        );

        let resolved = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                error!("Cannot open {}: {}", self.config.object, e);
                join_all(handles.iter().map(ArchiveHandle::close)).await;
                return Err(e.into());
            }
        };

        let archives = Arc::new(ArchiveSet::assemble(handles, resolved.image).await);
        let summary = OpenSummary {
            object: self.config.object.clone(),
            metadata_url: resolved.url,
            metadata_attempts: resolved.attempts,
            chunks: archives.chunk_count(),
            archives: archives.summary(),
        };

        let cache = Arc::new(StripeCache::new(
            self.config.stripe_count(),
            &self.cache_config,
        ));
        let fetcher = Arc::new(StripeFetcher::new(Arc::clone(&archives)));
        let recovery = ErasureRecovery::new(
            Arc::clone(&self.config),
            Arc::clone(&self.codec),
            Arc::clone(&cache),
            Arc::clone(&fetcher),
        );

        let inner = Arc::new(ReaderInner {
            config: Arc::clone(&self.config),
            archives,
            cache,
            fetcher,
            recovery,
        });
        self.inner
            .set(inner)
            .map_err(|_| ReaderError::AlreadyOpened)?;

        info!(
            "Opened {}: metadata from {}, {} chunks indexed",
            summary.object, summary.metadata_url, summary.chunks
        );
        Ok(summary)
    }

    /// Read `buf.len()` bytes of the object starting at `offset`.
    ///
    /// Returns the number of bytes copied. Parts of the range past the end of
    /// the object copy nothing and leave `buf` untouched there. Every stripe
    /// sub-range is attempted; on failure the first error in range order is
    /// returned and the sub-ranges that succeeded are still filled in.
    pub async fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, ReaderError> {
        let inner = self.inner()?;
        let spans = decompose(
            offset,
            buf.len(),
            self.config.block_size,
            self.config.data_stripes,
        )?;
        debug!("Read {}+{} -> {} stripe ranges", offset, buf.len(), spans.len());

        let mut rest = buf;
        let mut reads = Vec::with_capacity(spans.len());
        for span in spans {
            let (dest, tail) = std::mem::take(&mut rest).split_at_mut(span.length);
            rest = tail;
            reads.push(inner.read_span(span, dest));
        }

        let mut copied = 0;
        let mut first_error = None;
        for outcome in join_all(reads).await {
            match outcome {
                Ok(n) => copied += n,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(copied),
        }
    }

    pub fn summary(&self) -> Option<Vec<ArchiveSummary>> {
        self.inner.get().map(|inner| inner.archives.summary())
    }

    /// Number of blocks currently held by the stripe cache
    pub fn cached_blocks(&self) -> usize {
        self.inner.get().map_or(0, |inner| inner.cache.len())
    }

    /// Close every data container. Later reads of stripes not yet cached fail
    /// over to recovery and then to an error.
    pub async fn close(&self) -> Result<(), ReaderError> {
        let inner = self.inner()?;
        inner.archives.close_all().await;
        info!("Closed {}", self.config.object);
        Ok(())
    }

    fn inner(&self) -> Result<&Arc<ReaderInner>, ReaderError> {
        self.inner.get().ok_or(ReaderError::NotOpen)
    }
}

/// State built by a successful open, shared with spawned loads.
struct ReaderInner {
    config: Arc<ObjectConfig>,
    archives: Arc<ArchiveSet>,
    cache: Arc<StripeCache>,
    fetcher: Arc<StripeFetcher>,
    recovery: ErasureRecovery,
}

impl ReaderInner {
    async fn read_span(self: &Arc<Self>, span: StripeSpan, dest: &mut [u8]) -> Result<usize, StripeError> {
        let entry = self.cache.get(span.block, span.stripe);
        let data = match entry.read(span.offset, span.length) {
            ReadTicket::Ready(result) => result?,
            ReadTicket::Queued { reply, load } => {
                if load {
                    tokio::spawn(Arc::clone(self).load(Arc::clone(&entry)));
                }
                reply.await.map_err(|_| StripeError::Abandoned {
                    chunk: chunk_name(&self.config.object, span.block, span.stripe),
                })??
            }
        };

        dest[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    /// Fetch one stripe, recover it if needed, and install the outcome.
    async fn load(self: Arc<Self>, entry: Arc<CacheEntry>) {
        let guard = LoadGuard::new(Arc::clone(&entry), &self.config.object);
        let chunk = chunk_name(&self.config.object, entry.block(), entry.stripe());

        let result = match entry.raw_outcome(|| self.fetcher.fetch(&chunk)).await {
            Ok(fetched) => Ok(fetched.into_bytes()),
            Err(cause) => {
                self.recovery
                    .recover(entry.block(), entry.stripe(), &cause)
                    .await
            }
        };

        if let Err(e) = &result {
            error!("Stripe {} failed: {}", chunk, e);
        }
        guard.finish(result);
    }
}

/// Completes the entry with `Abandoned` if a load ends without installing an
/// outcome, so queued readers are never left waiting.
struct LoadGuard {
    entry: Option<Arc<CacheEntry>>,
    chunk: String,
}

impl LoadGuard {
    fn new(entry: Arc<CacheEntry>, object: &str) -> Self {
        let chunk = chunk_name(object, entry.block(), entry.stripe());
        Self {
            entry: Some(entry),
            chunk,
        }
    }

    fn finish(mut self, result: StripeResult) {
        if let Some(entry) = self.entry.take() {
            entry.complete(result);
        }
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            warn!("Load of {} ended without a result", self.chunk);
            entry.complete(Err(StripeError::Abandoned {
                chunk: std::mem::take(&mut self.chunk),
            }));
        }
    }
}
