//! I/O backends used by the device layer.
//!
//! [`IoBackend`] is the seam between the terminal device layer and the
//! platform. Backends are shared with the spawned I/O tasks, so they are
//! `Send + Sync + 'static` and expose async reads and size queries.

use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use crate::error::{StreamError, StreamResult};
use crate::path::RequestPath;
use crate::request::ByteRange;

/// I/O statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IoStats {
    /// Total read operations completed
    pub reads_completed: u64,
    /// Total bytes read
    pub bytes_read: u64,
    /// Total errors encountered
    pub errors: u64,
}

#[derive(Debug, Default)]
struct AtomicIoStats {
    reads_completed: AtomicU64,
    bytes_read: AtomicU64,
    errors: AtomicU64,
}

impl AtomicIoStats {
    fn record<T: AsRef<[u8]>>(&self, result: &StreamResult<T>) {
        match result {
            Ok(data) => {
                self.reads_completed.fetch_add(1, Ordering::Relaxed);
                self.bytes_read
                    .fetch_add(data.as_ref().len() as u64, Ordering::Relaxed);
            }
            Err(_) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> IoStats {
        IoStats {
            reads_completed: self.reads_completed.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Platform I/O abstraction.
/// Implementations can be a real filesystem or in-memory for testing.
pub trait IoBackend: Send + Sync + 'static {
    /// Reads `range` of `path`. The range is validated against the file size.
    fn read_range(
        &self,
        path: &RequestPath,
        range: ByteRange,
    ) -> impl std::future::Future<Output = StreamResult<Bytes>> + Send;

    /// Returns the size of `path` without reading it.
    fn file_size(
        &self,
        path: &RequestPath,
    ) -> impl std::future::Future<Output = StreamResult<u64>> + Send;

    /// Get current I/O statistics.
    fn stats(&self) -> IoStats;
}

/// In-memory backend for tests and benchmarks.
///
/// Supports an artificial per-read latency and injected failures.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    files: RwLock<HashMap<String, Bytes>>,
    failing: RwLock<HashSet<String>>,
    latency: Option<Duration>,
    stats: AtomicIoStats,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every read and size query by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Adds or replaces a file.
    pub fn insert(&self, path: &str, data: impl Into<Bytes>) {
        self.files.write().insert(path.to_string(), data.into());
    }

    /// Removes a file.
    pub fn remove(&self, path: &str) {
        self.files.write().remove(path);
    }

    /// Makes every read of `path` fail with a device error.
    pub fn fail_reads(&self, path: &str) {
        self.failing.write().insert(path.to_string());
    }

    fn lookup(&self, path: &RequestPath) -> StreamResult<Bytes> {
        self.files
            .read()
            .get(path.absolute_path())
            .cloned()
            .ok_or_else(|| StreamError::NotFound {
                path: path.absolute_path().to_string(),
            })
    }
}

impl IoBackend for MemoryBackend {
    async fn read_range(&self, path: &RequestPath, range: ByteRange) -> StreamResult<Bytes> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let result = if self.failing.read().contains(path.absolute_path()) {
            Err(StreamError::DeviceIo {
                device: "memory".to_string(),
                reason: format!("injected read failure for {}", path),
            })
        } else {
            self.lookup(path).and_then(|data| {
                let (offset, length) = range.resolve(data.len() as u64)?;
                Ok(data.slice(offset as usize..(offset + length) as usize))
            })
        };

        debug!(path = %path, range = %range, ok = result.is_ok(), "memory read");
        self.stats.record(&result);
        result
    }

    async fn file_size(&self, path: &RequestPath) -> StreamResult<u64> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.lookup(path).map(|data| data.len() as u64)
    }

    fn stats(&self) -> IoStats {
        self.stats.snapshot()
    }
}

/// Backend reading regular files through `tokio::fs`.
#[derive(Debug, Default)]
pub struct FileSystemBackend {
    stats: AtomicIoStats,
}

impl FileSystemBackend {
    /// Creates a filesystem backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn map_io_error(path: &RequestPath, err: std::io::Error) -> StreamError {
        if err.kind() == std::io::ErrorKind::NotFound {
            StreamError::NotFound {
                path: path.absolute_path().to_string(),
            }
        } else {
            StreamError::from(err)
        }
    }

    async fn read_file_range(path: &RequestPath, range: ByteRange) -> StreamResult<Bytes> {
        let mut file = tokio::fs::File::open(path.absolute_path())
            .await
            .map_err(|e| Self::map_io_error(path, e))?;
        let size = file.metadata().await?.len();
        let (offset, length) = range.resolve(size)?;

        file.seek(SeekFrom::Start(offset)).await?;
        let mut data = vec![0u8; length as usize];
        file.read_exact(&mut data).await?;
        Ok(Bytes::from(data))
    }
}

impl IoBackend for FileSystemBackend {
    async fn read_range(&self, path: &RequestPath, range: ByteRange) -> StreamResult<Bytes> {
        let result = Self::read_file_range(path, range).await;
        debug!(path = %path, range = %range, ok = result.is_ok(), "file read");
        self.stats.record(&result);
        result
    }

    async fn file_size(&self, path: &RequestPath) -> StreamResult<u64> {
        let result = tokio::fs::metadata(path.absolute_path())
            .await
            .map(|m| m.len())
            .map_err(|e| Self::map_io_error(path, e));
        debug!(path = %path, ok = result.is_ok(), "file size");
        result
    }

    fn stats(&self) -> IoStats {
        self.stats.snapshot()
    }
}
