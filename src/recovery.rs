//! Rebuilds a stripe that could not be fetched or failed verification from
//! its siblings in the same block.
//!
//! Siblings are read through their cache entries' fetch-once cells, never
//! through their load path, so recovering one stripe never waits on the
//! recovery of another.

use crate::addressing::chunk_name;
use crate::archive_format::checksum;
use crate::cache::{CacheEntry, StripeCache, StripeError, StripeResult};
use crate::config::ObjectConfig;
use crate::erasure::ErasureCodec;
use crate::fetcher::{FetchError, FetchedStripe, StripeFetcher};
use bytes::Bytes;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ErasureRecovery {
    config: Arc<ObjectConfig>,
    codec: Arc<dyn ErasureCodec>,
    cache: Arc<StripeCache>,
    fetcher: Arc<StripeFetcher>,
}

impl ErasureRecovery {
    pub fn new(
        config: Arc<ObjectConfig>,
        codec: Arc<dyn ErasureCodec>,
        cache: Arc<StripeCache>,
        fetcher: Arc<StripeFetcher>,
    ) -> Self {
        Self {
            config,
            codec,
            cache,
            fetcher,
        }
    }

    /// Reconstruct stripe `target` of `block`, whose own fetch failed with
    /// `cause`.
    pub async fn recover(&self, block: u64, target: usize, cause: &FetchError) -> StripeResult {
        let chunk = chunk_name(&self.config.object, block, target);
        let needed = self.config.data_stripes;
        let unrecoverable = |available: usize| StripeError::Unrecoverable {
            chunk: chunk.clone(),
            needed,
            available,
            cause: cause.to_string(),
        };

        let Some((expected_len, expected_checksum)) = self.fetcher.expected(&chunk) else {
            return Err(unrecoverable(0));
        };

        warn!("Recovering {} after: {}", chunk, cause);
        let mut stripes = self.gather(block, target).await;
        let available = stripes.iter().filter(|s| s.is_some()).count();
        if available < needed {
            let error = unrecoverable(available);
            tracing::error!("{}", error);
            return Err(error);
        }

        let reconstruction = |reason: String| StripeError::Reconstruction {
            chunk: chunk.clone(),
            reason,
        };

        self.codec
            .reconstruct(&mut stripes)
            .map_err(|e| reconstruction(e.to_string()))?;
        let mut rebuilt = stripes[target]
            .take()
            .ok_or_else(|| reconstruction("decoder left the stripe empty".to_string()))?;

        if expected_len > rebuilt.len() {
            return Err(reconstruction(format!(
                "directory size {} exceeds stripe size {}",
                expected_len,
                rebuilt.len()
            )));
        }
        rebuilt.truncate(expected_len);

        let calculated = checksum(&rebuilt);
        if calculated != expected_checksum {
            return Err(reconstruction(format!(
                "checksum mismatch: expected {expected_checksum:08x}, calculated {calculated:08x}"
            )));
        }

        info!("Reconstructed {} from {} siblings", chunk, available);
        Ok(Bytes::from(rebuilt))
    }

    /// Every sibling of `target`, zero-padded to the stripe size; `None` for
    /// the target and for siblings that are unusable.
    async fn gather(&self, block: u64, target: usize) -> Vec<Option<Vec<u8>>> {
        let cached = self.cache.block(block);
        let stripe_size = self.config.stripe_size();

        let siblings = cached
            .entries()
            .iter()
            .enumerate()
            .map(|(stripe, entry)| async move {
                if stripe == target {
                    return None;
                }
                let mut data = self.sibling(entry).await?.to_vec();
                if data.len() > stripe_size {
                    warn!(
                        "Sibling {}.{} is {} bytes, larger than a stripe",
                        block,
                        stripe,
                        data.len()
                    );
                    return None;
                }
                data.resize(stripe_size, 0);
                Some(data)
            });

        join_all(siblings).await
    }

    async fn sibling(&self, entry: &Arc<CacheEntry>) -> Option<Bytes> {
        let chunk = chunk_name(&self.config.object, entry.block(), entry.stripe());
        match entry.raw_outcome(|| self.fetcher.fetch(&chunk)).await {
            Ok(FetchedStripe::Present(data)) => Some(data),
            Ok(FetchedStripe::Absent) => {
                // past the object's extent only if every archive has a directory
                let is_data = entry.stripe() < self.config.data_stripes;
                if is_data && self.fetcher.archives().is_complete() {
                    Some(Bytes::new())
                } else {
                    debug!("Sibling {} absent and not provably past the end", chunk);
                    None
                }
            }
            Err(e) => {
                debug!("Sibling {} unusable: {}", chunk, e);
                // it may have been reconstructed already
                entry.valid_buffer()
            }
        }
    }
}
