//! In-process transport: every "server" is a map of URL to bytes.
//!
//! Faults can be injected per URL (failed opens, failed reads, flipped bytes)
//! and every operation is counted, which is what the integration tests use to
//! check fallback order and fetch deduplication.

use super::{RemoteFile, Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Default)]
struct State {
    files: HashMap<String, Bytes>,
    failing_opens: HashSet<String>,
    failing_reads: HashSet<String>,
    opens: HashMap<String, usize>,
    reads: Vec<ReadRecord>,
    read_delay: Option<Duration>,
    in_flight: usize,
    peak_in_flight: usize,
}

/// One read issued through the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRecord {
    pub url: String,
    pub offset: u64,
    pub length: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<State>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: impl Into<String>, data: impl Into<Bytes>) {
        self.state.lock().files.insert(url.into(), data.into());
    }

    pub fn remove(&self, url: &str) -> Option<Bytes> {
        self.state.lock().files.remove(url)
    }

    pub fn get(&self, url: &str) -> Option<Bytes> {
        self.state.lock().files.get(url).cloned()
    }

    /// Flip every bit of the byte at `offset` in the stored file.
    pub fn corrupt(&self, url: &str, offset: usize) -> bool {
        let mut state = self.state.lock();
        let Some(data) = state.files.get(url) else {
            return false;
        };
        if offset >= data.len() {
            return false;
        }
        let mut bytes = data.to_vec();
        bytes[offset] ^= 0xff;
        state.files.insert(url.to_string(), Bytes::from(bytes));
        true
    }

    pub fn fail_open(&self, url: impl Into<String>) {
        self.state.lock().failing_opens.insert(url.into());
    }

    pub fn fail_reads(&self, url: impl Into<String>) {
        self.state.lock().failing_reads.insert(url.into());
    }

    /// Delay every read, to widen race windows in concurrency tests.
    pub fn set_read_delay(&self, delay: Duration) {
        self.state.lock().read_delay = Some(delay);
    }

    pub fn open_count(&self, url: &str) -> usize {
        self.state.lock().opens.get(url).copied().unwrap_or(0)
    }

    pub fn reads(&self) -> Vec<ReadRecord> {
        self.state.lock().reads.clone()
    }

    /// Reads of `url` that overlap `[offset, offset + length)`
    pub fn reads_overlapping(&self, url: &str, offset: u64, length: usize) -> usize {
        let end = offset.saturating_add(length as u64);
        self.state
            .lock()
            .reads
            .iter()
            .filter(|r| {
                r.url == url && r.offset < end && offset < r.offset.saturating_add(r.length as u64)
            })
            .count()
    }

    /// Most reads that were ever waiting out the read delay at the same time
    pub fn peak_in_flight(&self) -> usize {
        self.state.lock().peak_in_flight
    }

    pub fn clear_counters(&self) {
        let mut state = self.state.lock();
        state.opens.clear();
        state.reads.clear();
        state.peak_in_flight = state.in_flight;
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, url: &str) -> Result<Box<dyn RemoteFile>, TransportError> {
        let mut state = self.state.lock();
        *state.opens.entry(url.to_string()).or_default() += 1;

        if state.failing_opens.contains(url) {
            debug!("Injected open failure for {}", url);
            return Err(TransportError::Unavailable {
                url: url.to_string(),
                reason: "injected open failure".to_string(),
            });
        }
        if !state.files.contains_key(url) {
            return Err(TransportError::NotFound {
                url: url.to_string(),
            });
        }

        Ok(Box::new(MemoryFile {
            url: url.to_string(),
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryFile {
    url: String,
    state: Arc<Mutex<State>>,
    closed: AtomicBool,
}

impl MemoryFile {
    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed {
                url: self.url.clone(),
            });
        }
        Ok(())
    }

    fn contents(&self) -> Result<Bytes, TransportError> {
        self.state
            .lock()
            .files
            .get(&self.url)
            .cloned()
            .ok_or_else(|| TransportError::NotFound {
                url: self.url.clone(),
            })
    }
}

#[async_trait]
impl RemoteFile for MemoryFile {
    fn url(&self) -> &str {
        &self.url
    }

    async fn size(&self) -> Result<u64, TransportError> {
        self.check_open()?;
        Ok(self.contents()?.len() as u64)
    }

    async fn read_at(&self, offset: u64, length: usize) -> Result<Bytes, TransportError> {
        self.check_open()?;
        let delay = {
            let mut state = self.state.lock();
            state.reads.push(ReadRecord {
                url: self.url.clone(),
                offset,
                length,
            });
            if state.failing_reads.contains(&self.url) {
                return Err(TransportError::Unavailable {
                    url: self.url.clone(),
                    reason: "injected read failure".to_string(),
                });
            }
            if state.read_delay.is_some() {
                state.in_flight += 1;
                state.peak_in_flight = state.peak_in_flight.max(state.in_flight);
            }
            state.read_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
            self.state.lock().in_flight -= 1;
        }

        let data = self.contents()?;
        let size = data.len() as u64;
        if offset > size {
            return Err(TransportError::OutOfRange {
                url: self.url.clone(),
                offset,
                length,
                size,
            });
        }
        let end = offset.saturating_add(length as u64).min(size);
        Ok(data.slice(offset as usize..end as usize))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
