//! Integration tests for the reader
//!
//! Objects are encoded by `test_helpers` into in-memory servers and read back
//! through the full open / fetch / verify / recover path.

mod test_helpers;

use ecstore::{
    CacheConfig, DirectorySource, MemoryTransport, ObjectConfig, Reader, ReaderError,
    StripeError,
};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;

async fn open_reader(fixture: &ObjectFixture, transport: &MemoryTransport) -> Reader {
    let reader = Reader::new(fixture.config.clone(), Arc::new(transport.clone())).unwrap();
    reader.open().await.unwrap();
    reader
}

/// 4+2, 1000-byte blocks of 250-byte stripes; the last block holds 400
/// bytes, so its stripe 1 is short and stripes 2 and 3 do not exist.
fn fixture() -> ObjectFixture {
    ObjectFixture::random(4, 2, 1000, 2400).unwrap()
}

#[tokio::test]
async fn test_reads_return_written_bytes() {
    let fixture = fixture();
    let transport = fixture.memory_transport();
    let reader = open_reader(&fixture, &transport).await;

    for _ in 0..2 {
        let mut buf = vec![0u8; fixture.data.len()];
        let copied = reader.read(0, &mut buf).await.unwrap();
        assert_eq!(copied, fixture.data.len());
        assert_eq!(buf, fixture.data);
    }

    // ranges crossing stripe and block boundaries
    for (offset, length) in [(0usize, 1usize), (249, 2), (990, 20), (1234, 777), (2399, 1)] {
        let mut buf = vec![0u8; length];
        let copied = reader.read(offset as u64, &mut buf).await.unwrap();
        assert_eq!(copied, length);
        assert_eq!(buf, fixture.data[offset..offset + length]);
    }
}

#[tokio::test]
async fn test_every_stripe_fetched_once() {
    let fixture = fixture();
    let transport = fixture.memory_transport();
    let reader = open_reader(&fixture, &transport).await;
    transport.clear_counters();

    let mut buf = vec![0u8; fixture.data.len()];
    reader.read(0, &mut buf).await.unwrap();
    reader.read(0, &mut buf).await.unwrap();

    for (name, location) in &fixture.chunks {
        let expected = if name.ends_with(".4") || name.ends_with(".5") { 0 } else { 1 };
        assert_eq!(
            transport.reads_overlapping(&location.url, location.payload_offset as u64, location.length),
            expected,
            "chunk {name}"
        );
    }
}

#[tokio::test]
async fn test_read_past_end_is_empty_and_leaves_buffer_untouched() {
    let fixture = fixture();
    let transport = fixture.memory_transport();
    let reader = open_reader(&fixture, &transport).await;

    let mut buf = vec![0xAAu8; 300];
    assert_eq!(reader.read(5000, &mut buf).await.unwrap(), 0);
    assert!(buf.iter().all(|&b| b == 0xAA));

    // inside the last block but past the object's extent
    assert_eq!(reader.read(2600, &mut buf).await.unwrap(), 0);
    assert!(buf.iter().all(|&b| b == 0xAA));

    // straddling the end
    let copied = reader.read(2300, &mut buf).await.unwrap();
    assert_eq!(copied, 100);
    assert_eq!(buf[..100], fixture.data[2300..2400]);
    assert!(buf[100..].iter().all(|&b| b == 0xAA));
}

#[tokio::test]
async fn test_concurrent_reads_share_one_fetch() {
    let fixture = fixture();
    let transport = fixture.memory_transport();
    let reader = Arc::new(open_reader(&fixture, &transport).await);
    transport.clear_counters();
    transport.set_read_delay(Duration::from_millis(50));

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let reader = Arc::clone(&reader);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 100];
                let copied = reader.read(1000 + i * 10, &mut buf).await.unwrap();
                (copied, buf)
            })
        })
        .collect();

    for (i, task) in tasks.into_iter().enumerate() {
        let (copied, buf) = task.await.unwrap();
        assert_eq!(copied, 100);
        let start = 1000 + i * 10;
        assert_eq!(buf, fixture.data[start..start + 100]);
    }

    let location = fixture.chunk(1, 0);
    assert_eq!(
        transport.reads_overlapping(&location.url, location.payload_offset as u64, location.length),
        1
    );
}

#[tokio::test]
async fn test_corrupted_stripe_is_reconstructed() {
    let fixture = fixture();
    let transport = fixture.memory_transport();
    fixture.corrupt_chunk(&transport, 1, 2);
    let reader = open_reader(&fixture, &transport).await;

    let mut buf = vec![0u8; 1000];
    assert_eq!(reader.read(1000, &mut buf).await.unwrap(), 1000);
    assert_eq!(buf, fixture.data[1000..2000]);

    // the rebuilt stripe is cached: no further remote reads of it
    transport.clear_counters();
    reader.read(1000, &mut buf).await.unwrap();
    assert!(transport.reads().is_empty());
}

#[tokio::test]
async fn test_short_last_stripe_is_reconstructed() {
    let fixture = fixture();
    let transport = fixture.memory_transport();
    fixture.corrupt_chunk(&transport, 2, 1);
    let reader = open_reader(&fixture, &transport).await;

    let mut buf = vec![0u8; 400];
    assert_eq!(reader.read(2000, &mut buf).await.unwrap(), 400);
    assert_eq!(buf, fixture.data[2000..2400]);
}

#[tokio::test]
async fn test_unreachable_server_is_recovered_around() {
    let fixture = fixture();
    let transport = fixture.memory_transport();
    transport.fail_reads(fixture.data_url(0));
    let reader = open_reader(&fixture, &transport).await;

    let mut buf = vec![0u8; fixture.data.len()];
    assert_eq!(reader.read(0, &mut buf).await.unwrap(), fixture.data.len());
    assert_eq!(buf, fixture.data);
}

#[tokio::test]
async fn test_failed_container_open_is_discovered_lazily() {
    let fixture = fixture();
    let transport = fixture.memory_transport();
    transport.fail_open(fixture.data_url(3));
    let reader = Reader::new(fixture.config.clone(), Arc::new(transport.clone())).unwrap();

    let summary = reader.open().await.unwrap();
    assert!(!summary.archives[3].reachable);
    assert_eq!(summary.archives[3].directory, DirectorySource::Metadata);

    let mut buf = vec![0u8; fixture.data.len()];
    assert_eq!(reader.read(0, &mut buf).await.unwrap(), fixture.data.len());
    assert_eq!(buf, fixture.data);
}

#[tokio::test]
async fn test_too_many_failures_is_unrecoverable() {
    let fixture = fixture();
    let transport = fixture.memory_transport();
    for stripe in 0..3 {
        fixture.corrupt_chunk(&transport, 0, stripe);
    }
    let reader = open_reader(&fixture, &transport).await;

    let mut buf = vec![0xAAu8; 250];
    let result = reader.read(0, &mut buf).await;
    assert!(matches!(
        result,
        Err(ReaderError::Stripe(StripeError::Unrecoverable { needed: 4, .. }))
    ));
    assert!(buf.iter().all(|&b| b == 0xAA));

    // healthy stripes of the same range are still filled in
    let mut buf = vec![0xAAu8; 1000];
    let result = reader.read(0, &mut buf).await;
    match result {
        Err(ReaderError::Stripe(StripeError::Unrecoverable { chunk, .. })) => {
            assert_eq!(chunk, "obj.0.0")
        }
        other => panic!("expected unrecoverable error, got {other:?}"),
    }
    assert!(buf[..750].iter().all(|&b| b == 0xAA));
    assert_eq!(buf[750..], fixture.data[750..1000]);

    // other blocks are unaffected
    let mut buf = vec![0u8; 1000];
    assert_eq!(reader.read(1000, &mut buf).await.unwrap(), 1000);
    assert_eq!(buf, fixture.data[1000..2000]);
}

#[tokio::test]
async fn test_open_summary_and_double_open() {
    let fixture = fixture();
    let transport = fixture.memory_transport();
    let reader = Reader::new(fixture.config.clone(), Arc::new(transport.clone())).unwrap();

    let summary = reader.open().await.unwrap();
    assert_eq!(summary.metadata_url, fixture.metadata_url(0));
    assert_eq!(summary.metadata_attempts, 1);
    assert_eq!(summary.chunks, fixture.chunks.len());
    assert_eq!(summary.archives.len(), 6);
    assert!(summary
        .archives
        .iter()
        .all(|a| a.reachable && a.directory == DirectorySource::Metadata));

    assert!(matches!(reader.open().await, Err(ReaderError::AlreadyOpened)));
}

#[tokio::test]
async fn test_trailing_directory_used_without_metadata_record() {
    // one spare member, so the image still has k + p records without it
    let fixture = ObjectFixture::new(
        memory_servers(7),
        4,
        2,
        1000,
        random_data(2400, 7),
    )
    .unwrap();
    let transport = fixture.memory_transport();
    let image = fixture.metadata_image(&[2]).unwrap();
    for server in 0..7 {
        transport.insert(fixture.metadata_url(server), image.clone());
    }

    let reader = Reader::new(fixture.config.clone(), Arc::new(transport.clone())).unwrap();
    let summary = reader.open().await.unwrap();
    assert_eq!(summary.archives[2].directory, DirectorySource::Trailer);
    assert_eq!(summary.chunks, fixture.chunks.len());

    let mut buf = vec![0u8; 2400];
    assert_eq!(reader.read(0, &mut buf).await.unwrap(), 2400);
    assert_eq!(buf, fixture.data);
}

#[tokio::test]
async fn test_spare_member_does_not_block_tail_recovery() {
    let fixture = fixture();
    let transport = fixture.memory_transport();
    fixture.corrupt_chunk(&transport, 2, 0);

    // a seventh member with no record in the image and no container
    let mut servers = fixture.config.placement_group.clone();
    servers.push("mem://node6/".to_string());
    let config = ObjectConfig::new(OBJECT, servers, 4, 2, 1000).unwrap();

    let reader = Reader::new(config, Arc::new(transport.clone())).unwrap();
    let summary = reader.open().await.unwrap();
    assert!(!summary.archives[6].reachable);
    assert_eq!(summary.archives[6].directory, DirectorySource::Unlisted);

    // stripes 2 and 3 of the tail block do not exist and count as zeros
    let mut buf = vec![0u8; 400];
    assert_eq!(reader.read(2000, &mut buf).await.unwrap(), 400);
    assert_eq!(buf, fixture.data[2000..2400]);
}

#[tokio::test]
async fn test_bounded_cache_evicts_idle_blocks() {
    let fixture = fixture();
    let transport = fixture.memory_transport();
    let reader = Reader::new(fixture.config.clone(), Arc::new(transport.clone()))
        .unwrap()
        .with_cache_config(CacheConfig {
            max_blocks: NonZeroUsize::new(2),
        });
    reader.open().await.unwrap();

    let mut buf = vec![0u8; 1000];
    for block in 0..3u64 {
        reader.read(block * 1000, &mut buf[..]).await.unwrap();
    }
    assert_eq!(reader.cached_blocks(), 2);

    // block 0 was evicted and is fetched again
    transport.clear_counters();
    reader.read(0, &mut buf).await.unwrap();
    assert_eq!(buf, fixture.data[..1000]);
    let location = fixture.chunk(0, 0);
    assert_eq!(
        transport.reads_overlapping(&location.url, location.payload_offset as u64, location.length),
        1
    );
}

#[tokio::test]
async fn test_close_keeps_cached_stripes() {
    let fixture = fixture();
    let transport = fixture.memory_transport();
    let reader = open_reader(&fixture, &transport).await;

    let mut buf = vec![0u8; 1000];
    reader.read(0, &mut buf).await.unwrap();
    reader.close().await.unwrap();

    assert_eq!(reader.read(0, &mut buf).await.unwrap(), 1000);
    assert_eq!(buf, fixture.data[..1000]);
    assert!(matches!(
        reader.read(1000, &mut buf).await,
        Err(ReaderError::Stripe(_))
    ));
}
