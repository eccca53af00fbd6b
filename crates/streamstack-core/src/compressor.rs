//! Decompression layer.
//!
//! Files registered with the layer are stored compressed on the device. A
//! read of such a file becomes a child request for the raw compressed blob.
//! When the child finishes, the blob is decompressed on the blocking pool and
//! the requested slice of the uncompressed bytes is copied into the caller's
//! buffer. The fetched child stays parked until its decode reports back, so
//! the parent cannot complete early.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::context::StreamerContext;
use crate::error::{StreamError, StreamResult};
use crate::layer::{LayerLink, StreamStackEntry};
use crate::path::{PathResolver, RequestPath};
use crate::request::{ByteRange, ReadBuffer, RequestCommand, RequestId, RequestStatus};
use crate::statistics::{Statistic, ThroughputEstimator};

/// Compression algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CompressionAlgorithm {
    /// No compression (passthrough)
    None,
    /// LZ4 block format with the uncompressed size prepended
    #[default]
    Lz4,
    /// Zstandard
    Zstd {
        /// Compression level (1=fastest, 19=best ratio, 3=balanced default)
        level: i32,
    },
}

/// Compress data with the given algorithm. Returns compressed bytes.
pub fn compress(data: &[u8], algo: CompressionAlgorithm) -> StreamResult<Vec<u8>> {
    match algo {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionAlgorithm::Zstd { level } => zstd::encode_all(data, level).map_err(StreamError::from),
    }
}

/// Decompress data using the algorithm that was used for compression.
pub fn decompress(data: &[u8], algo: CompressionAlgorithm) -> StreamResult<Vec<u8>> {
    match algo {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| StreamError::Decompression(e.to_string())),
        CompressionAlgorithm::Zstd { .. } => {
            zstd::decode_all(data).map_err(|e| StreamError::Decompression(e.to_string()))
        }
    }
}

/// Where a compressed file's blob lives and how big it is once expanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedFileInfo {
    /// Algorithm used for the blob.
    pub algorithm: CompressionAlgorithm,
    /// Offset of the blob within the stored file.
    pub compressed_offset: u64,
    /// Size of the blob.
    pub compressed_size: u64,
    /// Size after decompression.
    pub uncompressed_size: u64,
}

/// A compressed file declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedFileEntry {
    /// Absolute or `@alias@` path.
    pub path: String,
    /// Algorithm used for the blob.
    #[serde(default)]
    pub algorithm: CompressionAlgorithm,
    /// Offset of the blob within the stored file.
    #[serde(default)]
    pub compressed_offset: u64,
    /// Size of the blob.
    pub compressed_size: u64,
    /// Size after decompression.
    pub uncompressed_size: u64,
}

impl CompressedFileEntry {
    /// Registry form of the entry.
    pub fn info(&self) -> CompressedFileInfo {
        CompressedFileInfo {
            algorithm: self.algorithm,
            compressed_offset: self.compressed_offset,
            compressed_size: self.compressed_size,
            uncompressed_size: self.uncompressed_size,
        }
    }
}

/// Configuration for the compressor layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressorLayerConfig {
    /// Whether the layer is part of the stack (default true).
    pub enabled: bool,
    /// Decompressions the layer will hold at once (default 8).
    pub max_concurrent_jobs: usize,
    /// Decompression throughput assumed before any sample, in bytes per second.
    pub default_throughput_bytes_per_sec: f64,
    /// Compressed files known at startup.
    pub files: Vec<CompressedFileEntry>,
}

impl Default for CompressorLayerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent_jobs: 8,
            default_throughput_bytes_per_sec: 500.0 * 1024.0 * 1024.0,
            files: Vec::new(),
        }
    }
}

/// Compressor layer counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompressorStats {
    /// Reads served by decompression.
    pub reads_decompressed: u64,
    /// Uncompressed bytes produced.
    pub bytes_decompressed: u64,
    /// Compressed bytes consumed.
    pub bytes_compressed: u64,
    /// Blobs that failed to decompress.
    pub decompression_failures: u64,
    /// Decodes dropped because their read was canceled.
    pub decodes_canceled: u64,
}

enum JobState {
    /// Waiting for the compressed blob.
    Fetching,
    /// Blob handed to a blocking decode task.
    Decoding { abort: AbortHandle, started: Instant },
}

struct DecompressJob {
    parent: RequestId,
    path: RequestPath,
    info: CompressedFileInfo,
    offset: u64,
    length: u64,
    buffer: ReadBuffer,
    buffer_offset: usize,
    raw: ReadBuffer,
    state: JobState,
    output: Option<StreamResult<Vec<u8>>>,
}

struct Decoded {
    id: RequestId,
    compressed: u64,
    elapsed: Duration,
    result: StreamResult<Vec<u8>>,
}

fn to_usize(value: u64, what: &str) -> StreamResult<usize> {
    usize::try_from(value)
        .map_err(|_| StreamError::Decompression(format!("{} of {} bytes is not addressable", what, value)))
}

/// Decompresses `raw` and returns `length` bytes starting at `offset`.
fn expand(
    raw: &[u8],
    algorithm: CompressionAlgorithm,
    uncompressed_size: u64,
    offset: u64,
    length: u64,
) -> StreamResult<Vec<u8>> {
    let data = decompress(raw, algorithm)?;
    if data.len() as u64 != uncompressed_size {
        return Err(StreamError::Decompression(format!(
            "expected {} bytes, got {}",
            uncompressed_size,
            data.len()
        )));
    }
    let start = to_usize(offset, "slice offset")?;
    let end = to_usize(offset + length, "slice end")?;
    Ok(data[start..end].to_vec())
}

/// Layer that decompresses registered files on the way up.
///
/// Decoding runs on the blocking pool; finished decodes are picked up by
/// `execute_requests` the way the device picks up finished reads.
pub struct CompressorLayer {
    link: LayerLink,
    config: CompressorLayerConfig,
    runtime: Handle,
    registry: HashMap<RequestPath, CompressedFileInfo>,
    jobs: HashMap<RequestId, DecompressJob>,
    done_tx: mpsc::UnboundedSender<Decoded>,
    done_rx: mpsc::UnboundedReceiver<Decoded>,
    throughput: ThroughputEstimator,
    stats: CompressorStats,
}

impl CompressorLayer {
    /// Creates a compressor layer with an empty registry, decoding on `runtime`.
    pub fn new(name: &str, config: CompressorLayerConfig, runtime: Handle) -> Self {
        debug!(name, max_concurrent_jobs = config.max_concurrent_jobs, "created compressor layer");
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            link: LayerLink::new(name),
            throughput: ThroughputEstimator::new(config.default_throughput_bytes_per_sec),
            config,
            runtime,
            registry: HashMap::new(),
            jobs: HashMap::new(),
            done_tx,
            done_rx,
            stats: CompressorStats::default(),
        }
    }

    /// Creates a compressor layer and registers the configured files.
    pub fn from_config(
        name: &str,
        config: CompressorLayerConfig,
        resolver: &dyn PathResolver,
        runtime: Handle,
    ) -> StreamResult<Self> {
        let entries = config.files.clone();
        let mut layer = Self::new(name, config, runtime);
        for entry in &entries {
            let path = RequestPath::parse(&entry.path, resolver)?;
            layer.register(path, entry.info());
        }
        Ok(layer)
    }

    /// Declares `path` as compressed.
    pub fn register(&mut self, path: RequestPath, info: CompressedFileInfo) {
        debug!(path = %path, algorithm = ?info.algorithm, "registered compressed file");
        self.registry.insert(path, info);
    }

    /// Forgets a compressed file. Returns its info if it was registered.
    pub fn unregister(&mut self, path: &RequestPath) -> Option<CompressedFileInfo> {
        self.registry.remove(path)
    }

    /// Registry entry for `path`.
    pub fn info(&self, path: &RequestPath) -> Option<&CompressedFileInfo> {
        self.registry.get(path)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> &CompressorStats {
        &self.stats
    }

    /// Decodes currently running on the blocking pool.
    pub fn active_decodes(&self) -> usize {
        self.jobs
            .values()
            .filter(|job| matches!(job.state, JobState::Decoding { .. }))
            .count()
    }

    #[allow(clippy::too_many_arguments)]
    fn prepare_read(
        &mut self,
        ctx: &mut StreamerContext,
        id: RequestId,
        path: RequestPath,
        info: CompressedFileInfo,
        range: ByteRange,
        buffer: ReadBuffer,
        buffer_offset: usize,
    ) {
        let resolved = range
            .resolve(info.uncompressed_size)
            .and_then(|bounds| Ok((bounds, to_usize(info.compressed_size, "compressed blob")?)));
        let ((offset, length), compressed_len) = match resolved {
            Ok(resolved) => resolved,
            Err(err) => {
                ctx.fail(id, err);
                return;
            }
        };

        let raw = ReadBuffer::with_len(compressed_len);
        let owner = self.link.name().to_string();
        let child = ctx.create_child(
            id,
            RequestCommand::Read {
                path: path.clone(),
                range: ByteRange::new(info.compressed_offset, info.compressed_size),
                buffer: raw.clone(),
                buffer_offset: 0,
            },
            Some(&owner),
        );
        debug!(request = %id, child = %child, path = %path, "reading compressed blob");
        self.jobs.insert(
            child,
            DecompressJob {
                parent: id,
                path,
                info,
                offset,
                length,
                buffer,
                buffer_offset,
                raw,
                state: JobState::Fetching,
                output: None,
            },
        );
        self.link.prepare_request(ctx, child);
    }

    /// Starts decoding for fetched blobs; failed fetches are retired at once.
    fn complete_fetches(&mut self, ctx: &mut StreamerContext) -> bool {
        let finished = ctx.take_layer_completions(self.link.name());
        let progressed = !finished.is_empty();
        for id in finished {
            let fetched = ctx
                .request(id)
                .is_some_and(|r| r.status() == RequestStatus::Completed);
            if fetched && self.start_decode(ctx, id) {
                continue;
            }
            self.finalize_request(ctx, id);
            ctx.retire(id);
        }
        progressed
    }

    /// Hands the blob of job `id` to the blocking pool. Returns false if the
    /// job finished without decoding.
    fn start_decode(&mut self, ctx: &StreamerContext, id: RequestId) -> bool {
        let Some(job) = self.jobs.get_mut(&id) else {
            return false;
        };
        let raw = to_usize(job.info.compressed_size, "compressed blob").and_then(|len| {
            job.raw
                .read_at(0, len)
                .ok_or_else(|| StreamError::Decompression("compressed blob truncated".to_string()))
        });
        let raw = match raw {
            Ok(raw) => raw,
            Err(err) => {
                job.output = Some(Err(err));
                return false;
            }
        };

        let done_tx = self.done_tx.clone();
        let waker = ctx.waker();
        let (algorithm, uncompressed_size) = (job.info.algorithm, job.info.uncompressed_size);
        let (offset, length) = (job.offset, job.length);
        let handle = self.runtime.spawn_blocking(move || {
            let started = Instant::now();
            let result = expand(&raw, algorithm, uncompressed_size, offset, length);
            // The layer may already be gone.
            let _ = done_tx.send(Decoded {
                id,
                compressed: raw.len() as u64,
                elapsed: started.elapsed(),
                result,
            });
            waker.notify_one();
        });
        debug!(request = %job.parent, path = %job.path, "decode started");
        job.state = JobState::Decoding {
            abort: handle.abort_handle(),
            started: Instant::now(),
        };
        true
    }

    fn drain_decoded(&mut self, ctx: &mut StreamerContext) -> bool {
        let mut progressed = false;
        while let Ok(done) = self.done_rx.try_recv() {
            let Some(job) = self.jobs.get_mut(&done.id) else {
                // Canceled while decoding.
                continue;
            };
            if done.result.is_ok() {
                self.throughput.record(job.info.uncompressed_size, done.elapsed);
                self.stats.bytes_compressed += done.compressed;
                self.stats.bytes_decompressed += job.info.uncompressed_size;
            }
            job.output = Some(done.result);
            self.finalize_request(ctx, done.id);
            ctx.retire(done.id);
            progressed = true;
        }
        progressed
    }
}

impl StreamStackEntry for CompressorLayer {
    fn link(&self) -> &LayerLink {
        &self.link
    }

    fn link_mut(&mut self) -> &mut LayerLink {
        &mut self.link
    }

    fn prepare_request(&mut self, ctx: &mut StreamerContext, id: RequestId) {
        let command = match ctx.request(id) {
            Some(request) => request.command().clone(),
            None => return,
        };
        let registered = command
            .path()
            .and_then(|path| self.registry.get(path).copied());

        match (command, registered) {
            (
                RequestCommand::Read {
                    path,
                    range,
                    buffer,
                    buffer_offset,
                },
                Some(info),
            ) => self.prepare_read(ctx, id, path, info, range, buffer, buffer_offset),
            (RequestCommand::GetFileSize { .. }, Some(info)) => {
                ctx.set_file_size(id, info.uncompressed_size);
                ctx.mark_request_as_completed(id, RequestStatus::Completed);
            }
            _ => self.link.prepare_request(ctx, id),
        }
    }

    fn execute_requests(&mut self, ctx: &mut StreamerContext) -> bool {
        let decoded = self.drain_decoded(ctx);
        let before = self.complete_fetches(ctx);
        let forwarded = self.link.execute_requests(ctx);
        let after = self.complete_fetches(ctx);
        decoded || before || forwarded || after
    }

    fn available_request_slots(&self) -> usize {
        let own = self
            .config
            .max_concurrent_jobs
            .saturating_sub(self.jobs.len());
        own.min(self.link.available_request_slots())
    }

    fn update_completion_estimates(
        &mut self,
        ctx: &mut StreamerContext,
        now: Instant,
        internal_pending: &mut Vec<RequestId>,
        external_pending: &[RequestId],
    ) {
        self.link
            .update_completion_estimates(ctx, now, internal_pending, external_pending);

        for (child, job) in &self.jobs {
            let decode = self.throughput.estimate(Some(job.info.uncompressed_size));
            let expected = match &job.state {
                JobState::Fetching => {
                    let fetched = ctx
                        .request(*child)
                        .and_then(|r| r.estimated_completion())
                        .unwrap_or(now);
                    fetched + decode
                }
                JobState::Decoding { started, .. } => (*started + decode).max(now),
            };
            ctx.set_estimated_completion(job.parent, expected);
        }
    }

    fn finalize_request(&mut self, ctx: &mut StreamerContext, id: RequestId) {
        let Some(job) = self.jobs.remove(&id) else {
            return;
        };
        // No output: the fetch failed and the child carries the error.
        let Some(output) = job.output else {
            return;
        };

        let delivered = output.and_then(|data| {
            job.buffer.write_at(job.buffer_offset, &data)?;
            Ok(data.len() as u64)
        });
        match delivered {
            Ok(bytes) => {
                // The parent aggregates the child's count: report uncompressed bytes.
                if let Some(child) = ctx.request_mut(id) {
                    child.bytes_delivered = bytes;
                }
                self.stats.reads_decompressed += 1;
                debug!(request = %job.parent, path = %job.path, bytes, "decompressed");
            }
            Err(err) => {
                self.stats.decompression_failures += 1;
                warn!(request = %job.parent, path = %job.path, error = %err, "decompression failed");
                ctx.fail(job.parent, err);
            }
        }
    }

    fn get_file_size(&self, path: &RequestPath) -> StreamResult<u64> {
        match self.registry.get(path) {
            Some(info) => Ok(info.uncompressed_size),
            None => self.link.get_file_size(path),
        }
    }

    fn collect_statistics(&self, out: &mut Vec<Statistic>) {
        let name = self.link.name();
        out.push(Statistic::counter(
            name,
            "reads_decompressed",
            self.stats.reads_decompressed,
        ));
        out.push(Statistic::counter(
            name,
            "bytes_decompressed",
            self.stats.bytes_decompressed,
        ));
        out.push(Statistic::counter(name, "bytes_compressed", self.stats.bytes_compressed));
        out.push(Statistic::counter(
            name,
            "decompression_failures",
            self.stats.decompression_failures,
        ));
        out.push(Statistic::counter(name, "decodes_canceled", self.stats.decodes_canceled));
        out.push(Statistic::gauge(name, "registered_files", self.registry.len() as f64));
        out.push(Statistic::gauge(name, "active_jobs", self.jobs.len() as f64));
        out.push(Statistic::gauge(name, "active_decodes", self.active_decodes() as f64));
        out.push(Statistic::gauge(
            name,
            "throughput_bytes_per_sec",
            self.throughput.bytes_per_second(),
        ));
        self.link.collect_statistics(out);
    }

    fn cancel_request(&mut self, ctx: &mut StreamerContext, id: RequestId) -> bool {
        let decoding = self
            .jobs
            .iter()
            .find(|(_, job)| job.parent == id && matches!(job.state, JobState::Decoding { .. }))
            .map(|(child, _)| *child);
        let Some(child) = decoding else {
            return self.link.cancel_request(ctx, id);
        };
        if let Some(DecompressJob {
            state: JobState::Decoding { abort, .. },
            ..
        }) = self.jobs.remove(&child)
        {
            abort.abort();
        }
        self.stats.decodes_canceled += 1;
        debug!(request = %id, "decode canceled");
        ctx.mark_request_as_completed(id, RequestStatus::Canceled);
        ctx.retire(child);
        true
    }
}

impl Drop for CompressorLayer {
    fn drop(&mut self) {
        for job in self.jobs.values() {
            if let JobState::Decoding { abort, .. } = &job.state {
                abort.abort();
            }
        }
    }
}
