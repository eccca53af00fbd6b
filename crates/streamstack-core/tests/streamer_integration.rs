//! End-to-end tests of the streamer over in-memory and filesystem backends.

use std::sync::Arc;
use std::time::Duration;

use streamstack_core::statistics::find;
use streamstack_core::{
    compress, AliasResolver, ByteRange, CacheLayer, CacheLayerConfig, CompressedFileEntry,
    CompressionAlgorithm, FileSystemBackend, MemoryBackend, ReadBuffer, RequestOptions,
    RequestPriority, RequestStatus, SchedulerConfig, StackBuilder, Statistic, StreamError,
    Streamer, StreamerConfig,
};

const FILE: &str = "/mem/data/a.bin";

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn config() -> StreamerConfig {
    let mut config = StreamerConfig::default();
    config
        .aliases
        .insert("mem".to_string(), "/mem".to_string());
    config.default_alias = Some("mem".to_string());
    config
}

fn memory_backend() -> Arc<MemoryBackend> {
    let backend = Arc::new(MemoryBackend::new());
    backend.insert(FILE, pattern(8192));
    backend
}

fn counter(stats: &[Statistic], layer: &str, name: &str) -> f64 {
    find(stats, layer, name)
        .map(|s| s.value.as_f64())
        .unwrap_or_else(|| panic!("missing statistic {}/{}", layer, name))
}

#[tokio::test]
async fn test_read_through_cache_populates_buffer_and_cache() {
    let streamer = Streamer::from_config(&config(), memory_backend()).unwrap();

    let buffer = ReadBuffer::new();
    let completion = streamer
        .read("data/a.bin", ByteRange::new(0, 100), buffer.clone(), RequestOptions::default())
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(completion.status, RequestStatus::Completed);
    assert_eq!(completion.bytes_delivered, 100);
    assert_eq!(buffer.to_vec(), pattern(100));

    // Served from the cache the second time.
    let again = streamer
        .read_to_vec("@mem@/data/a.bin", ByteRange::new(0, 100))
        .await
        .unwrap();
    assert_eq!(again, pattern(100));

    let stats = streamer.collect_statistics().await.unwrap();
    assert_eq!(counter(&stats, "device", "reads_completed"), 1.0);
    assert_eq!(counter(&stats, "cache", "hits"), 1.0);
    assert_eq!(counter(&stats, "cache", "memory_bytes"), 100.0);
    streamer.shutdown().await;
}

#[tokio::test]
async fn test_empty_stack_fails_reads_immediately() {
    let streamer = Streamer::start(
        None,
        SchedulerConfig::default(),
        Arc::new(AliasResolver::new()),
    )
    .unwrap();

    let completion = streamer
        .read(FILE, ByteRange::new(0, 100), ReadBuffer::new(), RequestOptions::default())
        .unwrap()
        .completion()
        .await
        .unwrap();
    assert_eq!(completion.status, RequestStatus::Failed);
    assert!(matches!(
        completion.failure,
        Some(StreamError::ChainTermination { .. })
    ));

    // Management calls are no-ops that succeed.
    streamer.flush_entire_cache().unwrap().wait().await.unwrap();
    streamer
        .create_dedicated_cache(FILE, ByteRange::new(0, 10))
        .unwrap()
        .wait()
        .await
        .unwrap();
    streamer.shutdown().await;
}

#[tokio::test]
async fn test_deviceless_chain_fails_fast() {
    let head = StackBuilder::new()
        .push(Box::new(CacheLayer::new("cache", CacheLayerConfig::default())))
        .build()
        .unwrap();
    let streamer = Streamer::start(
        head,
        SchedulerConfig::default(),
        Arc::new(AliasResolver::new()),
    )
    .unwrap();

    let err = streamer
        .read(FILE, ByteRange::new(0, 100), ReadBuffer::new(), RequestOptions::default())
        .unwrap()
        .wait()
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::ChainTermination { .. }));

    streamer.flush_cache(FILE).unwrap().wait().await.unwrap();
    streamer
        .create_dedicated_cache(FILE, ByteRange::new(0, 1000))
        .unwrap()
        .wait()
        .await
        .unwrap();
    streamer
        .destroy_dedicated_cache(FILE, ByteRange::new(0, 1000))
        .unwrap()
        .wait()
        .await
        .unwrap();
    streamer.shutdown().await;
}

#[tokio::test]
async fn test_dedicated_region_survives_flush() {
    let streamer = Streamer::from_config(&config(), memory_backend()).unwrap();

    streamer
        .create_dedicated_cache("data/a.bin", ByteRange::new(0, 1000))
        .unwrap()
        .wait()
        .await
        .unwrap();
    streamer.flush_cache("data/a.bin").unwrap().wait().await.unwrap();
    streamer.flush_entire_cache().unwrap().wait().await.unwrap();

    let data = streamer
        .read_to_vec("data/a.bin", ByteRange::new(0, 100))
        .await
        .unwrap();
    assert_eq!(data, pattern(100));

    let stats = streamer.collect_statistics().await.unwrap();
    // Only the load of the dedicated region reached the device.
    assert_eq!(counter(&stats, "device", "reads_completed"), 1.0);
    assert_eq!(counter(&stats, "cache", "hits"), 1.0);
    assert_eq!(counter(&stats, "cache", "dedicated_bytes"), 1000.0);
    streamer.shutdown().await;
}

#[tokio::test]
async fn test_flush_forces_device_read() {
    let streamer = Streamer::from_config(&config(), memory_backend()).unwrap();

    streamer
        .read_to_vec("data/a.bin", ByteRange::new(0, 64))
        .await
        .unwrap();
    streamer.flush_cache("data/a.bin").unwrap().wait().await.unwrap();
    streamer
        .read_to_vec("data/a.bin", ByteRange::new(0, 64))
        .await
        .unwrap();

    let stats = streamer.collect_statistics().await.unwrap();
    assert_eq!(counter(&stats, "device", "reads_completed"), 2.0);
    streamer.shutdown().await;
}

#[tokio::test]
async fn test_many_concurrent_reads_complete() {
    let backend = Arc::new(MemoryBackend::new().with_latency(Duration::from_millis(2)));
    backend.insert(FILE, pattern(8192));
    let mut config = config();
    config.device.max_in_flight = 4;
    config.device.max_queued = 8;
    let streamer = Streamer::from_config(&config, backend).unwrap();

    let mut pending = Vec::new();
    for i in 0..100u64 {
        let offset = (i * 37) % 8000;
        let buffer = ReadBuffer::new();
        let priority = match i % 4 {
            0 => RequestPriority::Low,
            1 => RequestPriority::High,
            _ => RequestPriority::Normal,
        };
        let handle = streamer
            .read(
                "data/a.bin",
                ByteRange::new(offset, 64),
                buffer.clone(),
                RequestOptions::with_priority(priority),
            )
            .unwrap();
        pending.push((offset as usize, buffer, handle));
    }

    let expected = pattern(8192);
    for (offset, buffer, handle) in pending {
        let completion = handle.wait().await.unwrap();
        assert_eq!(completion.bytes_delivered, 64);
        assert_eq!(buffer.to_vec(), expected[offset..offset + 64].to_vec());
    }
    streamer.shutdown().await;
}

#[tokio::test]
async fn test_cancel_slow_read() {
    let backend = Arc::new(MemoryBackend::new().with_latency(Duration::from_secs(5)));
    backend.insert(FILE, pattern(1024));
    let streamer = Streamer::from_config(&config(), backend).unwrap();

    let handle = streamer
        .read(FILE, ByteRange::new(0, 100), ReadBuffer::new(), RequestOptions::default())
        .unwrap();
    let id = handle.id();
    tokio::time::sleep(Duration::from_millis(20)).await;
    streamer.cancel(id).unwrap().wait().await.unwrap();

    let completion = tokio::time::timeout(Duration::from_secs(2), handle.completion())
        .await
        .expect("canceled read should finish promptly")
        .unwrap();
    assert_eq!(completion.status, RequestStatus::Canceled);
    streamer.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_cancels_pending_reads() {
    let backend = Arc::new(MemoryBackend::new().with_latency(Duration::from_secs(5)));
    backend.insert(FILE, pattern(1024));
    let streamer = Streamer::from_config(&config(), backend).unwrap();

    let handle = streamer
        .read(FILE, ByteRange::new(0, 100), ReadBuffer::new(), RequestOptions::default())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    streamer.shutdown().await;

    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, StreamError::Canceled { .. }));
}

#[tokio::test]
async fn test_compressed_file_read_and_size() {
    let original = pattern(4000);
    let blob = compress(&original, CompressionAlgorithm::Lz4).unwrap();
    let mut packed = vec![0xAAu8; 16];
    packed.extend_from_slice(&blob);

    let backend = Arc::new(MemoryBackend::new());
    backend.insert("/mem/packed.bin", packed);

    let mut config = config();
    config.compressor.files.push(CompressedFileEntry {
        path: "@mem@/packed.bin".to_string(),
        algorithm: CompressionAlgorithm::Lz4,
        compressed_offset: 16,
        compressed_size: blob.len() as u64,
        uncompressed_size: original.len() as u64,
    });
    let streamer = Streamer::from_config(&config, backend).unwrap();

    let data = streamer
        .read_to_vec("packed.bin", ByteRange::new(1000, 500))
        .await
        .unwrap();
    assert_eq!(data, original[1000..1500].to_vec());

    let size = streamer
        .get_file_size("packed.bin")
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(size.file_size, Some(4000));

    let stats = streamer.collect_statistics().await.unwrap();
    assert_eq!(counter(&stats, "compressor", "reads_decompressed"), 1.0);
    streamer.shutdown().await;
}

#[tokio::test]
async fn test_filesystem_backend_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("asset.bin"), pattern(2048)).unwrap();

    let mut config = StreamerConfig::default();
    config.aliases.insert(
        "assets".to_string(),
        dir.path().to_string_lossy().into_owned(),
    );
    let streamer = Streamer::from_config(&config, Arc::new(FileSystemBackend::new())).unwrap();

    let data = streamer
        .read_to_vec("@assets@/asset.bin", ByteRange::new(100, 200))
        .await
        .unwrap();
    assert_eq!(data, pattern(2048)[100..300].to_vec());

    let whole = streamer
        .read_to_vec("@assets@/asset.bin", ByteRange::whole_file())
        .await
        .unwrap();
    assert_eq!(whole.len(), 2048);

    let err = streamer
        .read_to_vec("@assets@/missing.bin", ByteRange::new(0, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::NotFound { .. }));
    streamer.shutdown().await;
}

#[tokio::test]
async fn test_empty_read_of_missing_file_fails() {
    let streamer = Streamer::from_config(&config(), Arc::new(MemoryBackend::new())).unwrap();

    let err = streamer
        .read_to_vec("nope.bin", ByteRange::new(0, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::NotFound { .. }));

    let err = streamer
        .read_to_vec("nope.bin", ByteRange::new(0, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::NotFound { .. }));
    streamer.shutdown().await;
}

#[tokio::test]
async fn test_slow_size_query_does_not_block_reads() {
    let backend = Arc::new(MemoryBackend::new().with_latency(Duration::from_millis(200)));
    backend.insert(FILE, pattern(8192));
    let streamer = Streamer::from_config(&config(), backend).unwrap();

    let size = streamer.get_file_size("data/a.bin").unwrap();
    let started = std::time::Instant::now();
    let data = streamer
        .read_to_vec("data/a.bin", ByteRange::new(0, 10))
        .await
        .unwrap();
    assert_eq!(data, pattern(10));
    // Both jobs sleep concurrently on their own I/O tasks.
    assert!(started.elapsed() < Duration::from_millis(350));

    let completion = size.wait().await.unwrap();
    assert_eq!(completion.file_size, Some(8192));

    let stats = streamer.collect_statistics().await.unwrap();
    assert_eq!(counter(&stats, "device", "size_queries"), 1.0);
    streamer.shutdown().await;
}

#[tokio::test]
async fn test_filesystem_size_query() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("asset.bin"), pattern(777)).unwrap();

    let mut config = StreamerConfig::default();
    config.aliases.insert(
        "assets".to_string(),
        dir.path().to_string_lossy().into_owned(),
    );
    let streamer = Streamer::from_config(&config, Arc::new(FileSystemBackend::new())).unwrap();

    let size = streamer
        .get_file_size("@assets@/asset.bin")
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(size.file_size, Some(777));

    let err = streamer
        .get_file_size("@assets@/missing.bin")
        .unwrap()
        .wait()
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::NotFound { .. }));
    streamer.shutdown().await;
}

#[tokio::test]
async fn test_estimate_cleared_after_completion() {
    let streamer = Streamer::from_config(&config(), memory_backend()).unwrap();
    let handle = streamer
        .read("data/a.bin", ByteRange::new(0, 10), ReadBuffer::new(), RequestOptions::default())
        .unwrap();
    let id = handle.id();
    handle.wait().await.unwrap();
    assert_eq!(streamer.estimated_completion(id).await.unwrap(), None);
    streamer.shutdown().await;
}
