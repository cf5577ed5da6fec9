//! Test helper functions for reader tests
//!
//! Builds an erasure-coded object the way the servers lay it out: one data
//! container per placement-group member plus a replicated metadata image, and
//! installs it into a `MemoryTransport` or a directory tree for `FsTransport`.

#![allow(dead_code)]

use anyhow::Result;
use bytes::Bytes;
use ecstore::addressing::{chunk_name, data_url, metadata_url};
use ecstore::archive_format::{encode_local_record, LOCAL_RECORD_BASE_SIZE};
use ecstore::{encode_block, ArchiveBuilder, MemoryTransport, ObjectConfig, ReedSolomonCodec};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::path::Path;

pub const OBJECT: &str = "obj";

/// Where one chunk ended up.
#[derive(Debug, Clone)]
pub struct ChunkLocation {
    pub url: String,
    pub payload_offset: usize,
    pub length: usize,
}

/// An object encoded into per-server containers, not yet installed anywhere.
pub struct ObjectFixture {
    pub config: ObjectConfig,
    pub data: Vec<u8>,
    /// data container URL -> container bytes
    pub containers: Vec<(String, Bytes)>,
    /// data container URL -> its central directory
    pub directories: Vec<(String, Bytes)>,
    /// metadata URL -> metadata image, identical on every member
    pub metadata: Vec<(String, Bytes)>,
    pub chunks: HashMap<String, ChunkLocation>,
}

/// Deterministic pseudo-random payload
pub fn random_data(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill(&mut data[..]);
    data
}

pub fn memory_servers(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("mem://node{i}/")).collect()
}

/// Server holding stripe `stripe` of block `block`
pub fn owner(block: u64, stripe: usize, servers: usize) -> usize {
    ((block as usize) + stripe) % servers
}

impl ObjectFixture {
    pub fn new(
        servers: Vec<String>,
        data_stripes: usize,
        parity_stripes: usize,
        block_size: u64,
        data: Vec<u8>,
    ) -> Result<Self> {
        let config = ObjectConfig::new(OBJECT, servers, data_stripes, parity_stripes, block_size)?;
        let codec = ReedSolomonCodec::new(data_stripes, parity_stripes)?;
        let stripe_size = config.stripe_size();
        let n = config.placement_group.len();

        let mut per_server: Vec<Vec<(String, Vec<u8>)>> = vec![Vec::new(); n];
        for (block, content) in data.chunks(block_size as usize).enumerate() {
            let block = block as u64;
            let stripes = encode_block(&codec, content, stripe_size)?;
            for (stripe, mut payload) in stripes.into_iter().enumerate() {
                if stripe < data_stripes {
                    // data stripes hold only the bytes that exist
                    let start = (stripe * stripe_size).min(content.len());
                    let len = (content.len() - start).min(stripe_size);
                    if len == 0 {
                        continue;
                    }
                    payload.truncate(len);
                }
                per_server[owner(block, stripe, n)]
                    .push((chunk_name(OBJECT, block, stripe), payload));
            }
        }

        let mut containers = Vec::with_capacity(n);
        let mut directories = Vec::with_capacity(n);
        let mut chunks = HashMap::new();

        for (server, stored) in config.placement_group.iter().zip(per_server) {
            let url = data_url(server, OBJECT);
            let mut builder = ArchiveBuilder::new();
            let mut offset = 0usize;
            for (name, payload) in &stored {
                builder.add(name, payload)?;
                chunks.insert(
                    name.clone(),
                    ChunkLocation {
                        url: url.clone(),
                        payload_offset: offset + LOCAL_RECORD_BASE_SIZE + name.len(),
                        length: payload.len(),
                    },
                );
                offset += LOCAL_RECORD_BASE_SIZE + name.len() + payload.len();
            }
            let built = builder.finish()?;
            directories.push((url.clone(), Bytes::from(built.directory)));
            containers.push((url, Bytes::from(built.bytes)));
        }

        let mut fixture = Self {
            config,
            data,
            containers,
            directories,
            metadata: Vec::new(),
            chunks,
        };
        let image = fixture.metadata_image(&[])?;
        fixture.metadata = fixture
            .config
            .placement_group
            .iter()
            .map(|server| (metadata_url(server, OBJECT), image.clone()))
            .collect();
        Ok(fixture)
    }

    /// Metadata image listing every member's directory except those in `skip`
    pub fn metadata_image(&self, skip: &[usize]) -> Result<Bytes> {
        let mut image = Vec::new();
        for (index, (url, directory)) in self.directories.iter().enumerate() {
            if !skip.contains(&index) {
                image.extend(encode_local_record(url, directory)?);
            }
        }
        Ok(Bytes::from(image))
    }

    pub fn data_url(&self, server: usize) -> String {
        data_url(&self.config.placement_group[server], OBJECT)
    }

    pub fn metadata_url(&self, server: usize) -> String {
        metadata_url(&self.config.placement_group[server], OBJECT)
    }

    /// `k + p` in-memory servers holding `len` random bytes
    pub fn random(
        data_stripes: usize,
        parity_stripes: usize,
        block_size: u64,
        len: usize,
    ) -> Result<Self> {
        Self::new(
            memory_servers(data_stripes + parity_stripes),
            data_stripes,
            parity_stripes,
            block_size,
            random_data(len, len as u64 ^ 0x5eed),
        )
    }

    pub fn install(&self, transport: &MemoryTransport) {
        for (url, bytes) in self.containers.iter().chain(self.metadata.iter()) {
            transport.insert(url.clone(), bytes.clone());
        }
    }

    /// Write every container and metadata replica to the path its URL names.
    pub fn install_fs(&self) -> Result<()> {
        for (url, bytes) in self.containers.iter().chain(self.metadata.iter()) {
            let path = Path::new(url);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, bytes)?;
        }
        Ok(())
    }

    pub fn memory_transport(&self) -> MemoryTransport {
        let transport = MemoryTransport::new();
        self.install(&transport);
        transport
    }

    pub fn chunk(&self, block: u64, stripe: usize) -> &ChunkLocation {
        &self.chunks[&chunk_name(OBJECT, block, stripe)]
    }

    /// Flip one payload byte of a chunk in `transport`
    pub fn corrupt_chunk(&self, transport: &MemoryTransport, block: u64, stripe: usize) {
        let location = self.chunk(block, stripe);
        assert!(transport.corrupt(&location.url, location.payload_offset));
    }

    pub fn block_count(&self) -> u64 {
        (self.data.len() as u64).div_ceil(self.config.block_size)
    }
}
