//! Stripe cache.
//!
//! One entry per (block, stripe) touched by a read. Each entry is a small
//! state machine guarded by its own lock:
//!
//! ```text
//! Empty --first read--> Loading --load completes--> Valid
//! ```
//!
//! Only the read that moves an entry out of `Empty` starts a load; every other
//! read while `Loading` is queued and answered, in arrival order, from the one
//! outcome the load installs. `Valid` is terminal.
//!
//! Blocks are kept in an LRU. When a bound is configured, only blocks with no
//! entry in `Loading` are evicted, so eviction never causes a second load of a
//! stripe that is still in flight.

use crate::config::CacheConfig;
use crate::fetcher::{FetchError, FetchedStripe};
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{oneshot, OnceCell};
use tracing::debug;

/// Final error status of an entry, shared by every reader of it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StripeError {
    #[error("Unrecoverable data in {chunk}: {available} usable stripes, need {needed} ({cause})")]
    Unrecoverable {
        chunk: String,
        needed: usize,
        available: usize,
        cause: String,
    },

    #[error("Reconstructed {chunk} failed verification: {reason}")]
    Reconstruction { chunk: String, reason: String },

    #[error("Load of {chunk} ended without a result")]
    Abandoned { chunk: String },
}

pub type StripeResult = Result<Bytes, StripeError>;

/// Raw outcome of fetching and verifying one stripe, before any recovery.
pub type RawOutcome = Result<FetchedStripe, FetchError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Empty,
    Loading,
    Valid,
}

struct PendingRead {
    offset: usize,
    length: usize,
    reply: oneshot::Sender<StripeResult>,
}

struct EntryInner {
    state: EntryState,
    buffer: Bytes,
    status: Result<(), StripeError>,
    pending: VecDeque<PendingRead>,
}

impl EntryInner {
    /// Clamped to the buffer: ranges past its end yield fewer or zero bytes.
    fn slice(&self, offset: usize, length: usize) -> StripeResult {
        self.status.clone()?;
        let start = offset.min(self.buffer.len());
        let end = offset.saturating_add(length).min(self.buffer.len());
        Ok(self.buffer.slice(start..end))
    }
}

/// Answer to [`CacheEntry::read`].
pub enum ReadTicket {
    Ready(StripeResult),
    Queued {
        reply: oneshot::Receiver<StripeResult>,
        /// The caller made the `Empty -> Loading` transition and must start
        /// the load
        load: bool,
    },
}

pub struct CacheEntry {
    block: u64,
    stripe: usize,
    inner: Mutex<EntryInner>,
    raw: OnceCell<RawOutcome>,
}

impl CacheEntry {
    fn new(block: u64, stripe: usize) -> Self {
        Self {
            block,
            stripe,
            inner: Mutex::new(EntryInner {
                state: EntryState::Empty,
                buffer: Bytes::new(),
                status: Ok(()),
                pending: VecDeque::new(),
            }),
            raw: OnceCell::new(),
        }
    }

    pub fn block(&self) -> u64 {
        self.block
    }

    pub fn stripe(&self) -> usize {
        self.stripe
    }

    pub fn state(&self) -> EntryState {
        self.inner.lock().state
    }

    pub fn read(&self, offset: usize, length: usize) -> ReadTicket {
        let mut inner = self.inner.lock();
        match inner.state {
            EntryState::Valid => ReadTicket::Ready(inner.slice(offset, length)),
            EntryState::Empty | EntryState::Loading => {
                let (reply, receiver) = oneshot::channel();
                inner.pending.push_back(PendingRead {
                    offset,
                    length,
                    reply,
                });
                let load = inner.state == EntryState::Empty;
                inner.state = EntryState::Loading;
                ReadTicket::Queued {
                    reply: receiver,
                    load,
                }
            }
        }
    }

    /// Install the load outcome and answer every queued read in order.
    pub fn complete(&self, result: StripeResult) {
        let mut inner = self.inner.lock();
        match result {
            Ok(buffer) => {
                inner.buffer = buffer;
                inner.status = Ok(());
            }
            Err(e) => {
                inner.buffer = Bytes::new();
                inner.status = Err(e);
            }
        }
        inner.state = EntryState::Valid;

        let pending = std::mem::take(&mut inner.pending);
        debug!(
            "Stripe {}.{} valid, answering {} queued reads",
            self.block,
            self.stripe,
            pending.len()
        );
        for request in pending {
            // a reader that went away just drops its answer
            let _ = request.reply.send(inner.slice(request.offset, request.length));
        }
    }

    /// The buffer of a `Valid` entry whose status is OK.
    pub fn valid_buffer(&self) -> Option<Bytes> {
        let inner = self.inner.lock();
        match (inner.state, &inner.status) {
            (EntryState::Valid, Ok(())) => Some(inner.buffer.clone()),
            _ => None,
        }
    }

    /// Fetch-and-verify outcome for this stripe; `fetch` runs at most once
    /// per entry no matter how many callers ask.
    pub async fn raw_outcome<F, Fut>(&self, fetch: F) -> RawOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RawOutcome>,
    {
        self.raw.get_or_init(fetch).await.clone()
    }
}

/// The `k + p` entries of one block.
pub struct CacheBlock {
    entries: Vec<Arc<CacheEntry>>,
}

impl CacheBlock {
    fn new(block: u64, stripes: usize) -> Self {
        Self {
            entries: (0..stripes)
                .map(|stripe| Arc::new(CacheEntry::new(block, stripe)))
                .collect(),
        }
    }

    pub fn entry(&self, stripe: usize) -> &Arc<CacheEntry> {
        &self.entries[stripe]
    }

    pub fn entries(&self) -> &[Arc<CacheEntry>] {
        &self.entries
    }

    /// No entry is loading and nobody outside the cache holds one.
    fn is_idle(&self) -> bool {
        self.entries
            .iter()
            .all(|entry| Arc::strong_count(entry) == 1 && entry.state() != EntryState::Loading)
    }
}

pub struct StripeCache {
    stripes: usize,
    max_blocks: Option<NonZeroUsize>,
    blocks: Mutex<LruCache<u64, Arc<CacheBlock>>>,
}

impl StripeCache {
    pub fn new(stripes: usize, config: &CacheConfig) -> Self {
        Self {
            stripes,
            max_blocks: config.max_blocks,
            blocks: Mutex::new(LruCache::unbounded()),
        }
    }

    /// Entries of `block`, created `Empty` on first access.
    pub fn block(&self, block: u64) -> Arc<CacheBlock> {
        let mut blocks = self.blocks.lock();
        if let Some(existing) = blocks.get(&block) {
            return Arc::clone(existing);
        }

        let created = Arc::new(CacheBlock::new(block, self.stripes));
        blocks.put(block, Arc::clone(&created));
        if let Some(max) = self.max_blocks {
            Self::evict_idle(&mut blocks, max.get(), block);
        }
        created
    }

    pub fn get(&self, block: u64, stripe: usize) -> Arc<CacheEntry> {
        Arc::clone(self.block(block).entry(stripe))
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }

    pub fn contains(&self, block: u64) -> bool {
        self.blocks.lock().contains(&block)
    }

    /// Drop least recently used idle blocks until at most `max` remain. Busy
    /// blocks may keep the cache over its bound for a while.
    fn evict_idle(blocks: &mut LruCache<u64, Arc<CacheBlock>>, max: usize, keep: u64) {
        while blocks.len() > max {
            let victim = blocks
                .iter()
                .rev()
                .find(|(&number, cached)| {
                    number != keep && Arc::strong_count(cached) == 1 && cached.is_idle()
                })
                .map(|(&number, _)| number);
            match victim {
                Some(number) => {
                    debug!("Evicting block {} from stripe cache", number);
                    blocks.pop(&number);
                }
                None => break,
            }
        }
    }
}
