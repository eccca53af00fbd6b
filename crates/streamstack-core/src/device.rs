//! Terminal device layer.
//!
//! The device queues reads and size queries in `prepare_request`, starts
//! them on the tokio runtime from `execute_requests`, and completes them when
//! their I/O task reports back over a channel. Nothing in the layer itself
//! blocks: every backend call runs in a spawned task that wakes the
//! scheduler when done.
//!
//! Sizes reported by finished jobs are remembered per path, so the
//! synchronous [`get_file_size`](StreamStackEntry::get_file_size) query can be
//! answered without touching the backend.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::context::StreamerContext;
use crate::error::{StreamError, StreamResult};
use crate::io_backend::IoBackend;
use crate::layer::{LayerLink, StreamStackEntry};
use crate::path::RequestPath;
use crate::request::{ByteRange, RequestCommand, RequestId, RequestStatus};
use crate::statistics::{Statistic, ThroughputEstimator};

/// Learned sizes kept before the table is reset.
const MAX_KNOWN_SIZES: usize = 4096;

/// Configuration for the device layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Maximum requests held by the device, queued plus in flight (default 256).
    pub max_queued: usize,
    /// Maximum concurrent backend operations (default 32).
    pub max_in_flight: usize,
    /// Throughput assumed before any read has completed, in bytes per second.
    pub default_throughput_bytes_per_sec: f64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            max_queued: 256,
            max_in_flight: 32,
            default_throughput_bytes_per_sec: 100.0 * 1024.0 * 1024.0, // 100MB/s
        }
    }
}

/// Device layer counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceStats {
    /// Reads handed to the backend.
    pub reads_started: u64,
    /// Reads completed successfully.
    pub reads_completed: u64,
    /// Reads that failed.
    pub reads_failed: u64,
    /// Size queries answered by the backend.
    pub size_queries: u64,
    /// Size queries that failed.
    pub size_queries_failed: u64,
    /// Jobs canceled before completing.
    pub jobs_canceled: u64,
    /// Cancellations that arrived after the job had finished.
    pub cancel_races_lost: u64,
    /// Bytes delivered into request buffers.
    pub bytes_read: u64,
}

/// Backend work derived from a queued request.
#[derive(Debug, Clone)]
enum IoJob {
    Read { path: RequestPath, range: ByteRange },
    Size { path: RequestPath },
}

impl IoJob {
    fn from_command(command: &RequestCommand) -> Option<Self> {
        match command {
            RequestCommand::Read { path, range, .. } => Some(IoJob::Read {
                path: path.clone(),
                range: *range,
            }),
            RequestCommand::GetFileSize { path } => Some(IoJob::Size { path: path.clone() }),
            _ => None,
        }
    }

    fn path(&self) -> &RequestPath {
        match self {
            IoJob::Read { path, .. } | IoJob::Size { path } => path,
        }
    }

    /// Bytes the job moves, for estimates. Size queries move none.
    fn length(&self) -> Option<u64> {
        match self {
            IoJob::Read { range, .. } => range.length,
            IoJob::Size { .. } => Some(0),
        }
    }
}

enum IoOutcome {
    /// Bytes read, plus the file size when the read ran to the end of the file.
    Data { data: Bytes, file_size: Option<u64> },
    Size(u64),
}

struct InFlightJob {
    abort: AbortHandle,
    started: Instant,
    length: Option<u64>,
}

struct IoDone {
    id: RequestId,
    path: RequestPath,
    started: Instant,
    result: StreamResult<IoOutcome>,
}

/// Terminal layer performing reads and size queries through an [`IoBackend`].
pub struct DeviceLayer<B: IoBackend> {
    link: LayerLink,
    backend: Arc<B>,
    runtime: Handle,
    config: DeviceConfig,
    queued: VecDeque<RequestId>,
    in_flight: HashMap<RequestId, InFlightJob>,
    done_tx: mpsc::UnboundedSender<IoDone>,
    done_rx: mpsc::UnboundedReceiver<IoDone>,
    known_sizes: HashMap<RequestPath, u64>,
    throughput: ThroughputEstimator,
    stats: DeviceStats,
}

impl<B: IoBackend> DeviceLayer<B> {
    /// Creates a device layer spawning its I/O tasks on `runtime`.
    pub fn new(name: &str, backend: Arc<B>, runtime: Handle, config: DeviceConfig) -> Self {
        debug!(
            name,
            max_queued = config.max_queued,
            max_in_flight = config.max_in_flight,
            "created device layer"
        );
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            link: LayerLink::new(name),
            backend,
            runtime,
            throughput: ThroughputEstimator::new(config.default_throughput_bytes_per_sec),
            config,
            queued: VecDeque::new(),
            in_flight: HashMap::new(),
            done_tx,
            done_rx,
            known_sizes: HashMap::new(),
            stats: DeviceStats::default(),
        }
    }

    /// The backend.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Counter snapshot.
    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    /// Requests waiting for an I/O slot.
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// Jobs currently running on the backend.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    fn learn_size(&mut self, path: RequestPath, size: u64) {
        if self.known_sizes.len() >= MAX_KNOWN_SIZES && !self.known_sizes.contains_key(&path) {
            self.known_sizes.clear();
        }
        self.known_sizes.insert(path, size);
    }

    fn drain_completions(&mut self, ctx: &mut StreamerContext) -> bool {
        let mut progressed = false;
        while let Ok(done) = self.done_rx.try_recv() {
            if self.in_flight.remove(&done.id).is_none() {
                // Canceled while the result was in the channel.
                continue;
            }
            progressed = true;
            self.finish_job(ctx, done);
        }
        progressed
    }

    fn finish_job(&mut self, ctx: &mut StreamerContext, done: IoDone) {
        let id = done.id;
        match done.result {
            Ok(IoOutcome::Data { data, file_size }) => {
                if let Some(size) = file_size {
                    self.learn_size(done.path, size);
                }
                if !ctx.is_live(id) {
                    return;
                }
                let written = match ctx.request(id).map(|r| r.command()) {
                    Some(RequestCommand::Read {
                        buffer,
                        buffer_offset,
                        ..
                    }) => buffer.write_at(*buffer_offset, &data),
                    _ => Ok(()),
                };
                if let Err(err) = written {
                    self.stats.reads_failed += 1;
                    warn!(request = %id, error = %err, "device read not delivered");
                    ctx.fail(id, err);
                    return;
                }
                let bytes = data.len() as u64;
                self.throughput.record(bytes, done.started.elapsed());
                self.stats.reads_completed += 1;
                self.stats.bytes_read += bytes;
                ctx.add_bytes_delivered(id, bytes);
                debug!(request = %id, bytes, "device read completed");
                ctx.mark_request_as_completed(id, RequestStatus::Completed);
            }
            Ok(IoOutcome::Size(size)) => {
                self.learn_size(done.path, size);
                if !ctx.is_live(id) {
                    return;
                }
                self.stats.size_queries += 1;
                debug!(request = %id, size, "device size query completed");
                ctx.set_file_size(id, size);
                ctx.mark_request_as_completed(id, RequestStatus::Completed);
            }
            Err(err) => {
                if !ctx.is_live(id) {
                    return;
                }
                let is_read = ctx.request(id).is_some_and(|r| r.command().is_read());
                if is_read {
                    self.stats.reads_failed += 1;
                } else {
                    self.stats.size_queries_failed += 1;
                }
                warn!(request = %id, error = %err, "device job failed");
                ctx.fail(id, err);
            }
        }
    }

    fn start_queued(&mut self, ctx: &mut StreamerContext) -> bool {
        let mut started = false;
        while self.in_flight.len() < self.config.max_in_flight {
            let Some(id) = self.queued.pop_front() else {
                break;
            };
            let Some(job) = ctx.request(id).and_then(|r| IoJob::from_command(r.command())) else {
                continue;
            };
            self.spawn_job(ctx, id, job);
            started = true;
        }
        started
    }

    fn spawn_job(&mut self, ctx: &StreamerContext, id: RequestId, job: IoJob) {
        let backend = Arc::clone(&self.backend);
        let done_tx = self.done_tx.clone();
        let waker = ctx.waker();
        let started = Instant::now();
        let length = job.length();
        let path = job.path().clone();
        let is_read = matches!(job, IoJob::Read { .. });

        let handle = self.runtime.spawn(async move {
            let result = match &job {
                IoJob::Read { path, range } => {
                    backend.read_range(path, *range).await.map(|data| {
                        let file_size = range
                            .length
                            .is_none()
                            .then(|| range.offset + data.len() as u64);
                        IoOutcome::Data { data, file_size }
                    })
                }
                IoJob::Size { path } => backend.file_size(path).await.map(IoOutcome::Size),
            };
            // The layer may already be gone.
            let _ = done_tx.send(IoDone {
                id,
                path,
                started,
                result,
            });
            waker.notify_one();
        });

        if is_read {
            debug!(request = %id, "device read started");
            self.stats.reads_started += 1;
        } else {
            debug!(request = %id, "device size query started");
        }
        self.in_flight.insert(
            id,
            InFlightJob {
                abort: handle.abort_handle(),
                started,
                length,
            },
        );
    }

    fn estimate(&self, length: Option<u64>) -> Duration {
        self.throughput.estimate(length)
    }
}

impl<B: IoBackend> StreamStackEntry for DeviceLayer<B> {
    fn link(&self) -> &LayerLink {
        &self.link
    }

    fn link_mut(&mut self) -> &mut LayerLink {
        &mut self.link
    }

    fn is_terminal(&self) -> bool {
        true
    }

    fn prepare_request(&mut self, ctx: &mut StreamerContext, id: RequestId) {
        let queue = match ctx.request(id) {
            Some(request) => IoJob::from_command(request.command()).is_some(),
            None => return,
        };
        if queue {
            debug!(request = %id, queued = self.queued.len(), "device queued job");
            self.queued.push_back(id);
        } else {
            ctx.mark_request_as_completed(id, RequestStatus::Completed);
        }
    }

    fn execute_requests(&mut self, ctx: &mut StreamerContext) -> bool {
        let drained = self.drain_completions(ctx);
        let started = self.start_queued(ctx);
        drained || started
    }

    fn available_request_slots(&self) -> usize {
        self.config
            .max_queued
            .saturating_sub(self.queued.len() + self.in_flight.len())
    }

    fn update_completion_estimates(
        &mut self,
        ctx: &mut StreamerContext,
        now: Instant,
        internal_pending: &mut Vec<RequestId>,
        external_pending: &[RequestId],
    ) {
        let parallelism = self.config.max_in_flight.max(1) as u32;

        let mut backlog = Duration::ZERO;
        for (id, job) in &self.in_flight {
            let expected = job.started + self.estimate(job.length);
            ctx.set_estimated_completion(*id, expected.max(now));
            backlog = backlog.max(expected.saturating_duration_since(now));
        }
        internal_pending.retain(|id| !self.in_flight.contains_key(id));

        let mut cursor = backlog;
        let mut assign = |ctx: &mut StreamerContext, id: RequestId| {
            let length = ctx.request(id).and_then(|r| r.read_length());
            cursor += self.estimate(length) / parallelism;
            ctx.set_estimated_completion(id, now + cursor);
        };

        for id in self.queued.iter().copied() {
            assign(ctx, id);
        }
        internal_pending.retain(|id| !self.queued.contains(id));

        // Work held upstream lands behind everything already here.
        for id in internal_pending.drain(..) {
            assign(ctx, id);
        }
        for id in external_pending {
            assign(ctx, *id);
        }
    }

    /// Answers from sizes learned by earlier jobs; never calls the backend.
    fn get_file_size(&self, path: &RequestPath) -> StreamResult<u64> {
        self.known_sizes
            .get(path)
            .copied()
            .ok_or_else(|| StreamError::SizeUnknown {
                path: path.absolute_path().to_string(),
            })
    }

    fn flush_cache(&mut self, path: &RequestPath) {
        self.known_sizes.remove(path);
    }

    fn flush_entire_cache(&mut self) {
        self.known_sizes.clear();
    }

    fn create_dedicated_cache(
        &mut self,
        _ctx: &mut StreamerContext,
        _id: RequestId,
        _path: &RequestPath,
        _range: ByteRange,
    ) -> StreamResult<()> {
        Ok(())
    }

    fn destroy_dedicated_cache(&mut self, _path: &RequestPath, _range: ByteRange) {}

    fn collect_statistics(&self, out: &mut Vec<Statistic>) {
        let name = self.link.name();
        let io = self.backend.stats();
        out.push(Statistic::counter(name, "reads_started", self.stats.reads_started));
        out.push(Statistic::counter(name, "reads_completed", self.stats.reads_completed));
        out.push(Statistic::counter(name, "reads_failed", self.stats.reads_failed));
        out.push(Statistic::counter(name, "size_queries", self.stats.size_queries));
        out.push(Statistic::counter(
            name,
            "size_queries_failed",
            self.stats.size_queries_failed,
        ));
        out.push(Statistic::counter(name, "jobs_canceled", self.stats.jobs_canceled));
        out.push(Statistic::counter(
            name,
            "cancel_races_lost",
            self.stats.cancel_races_lost,
        ));
        out.push(Statistic::counter(name, "bytes_read", self.stats.bytes_read));
        out.push(Statistic::counter(name, "backend_errors", io.errors));
        out.push(Statistic::gauge(name, "queued", self.queued.len() as f64));
        out.push(Statistic::gauge(name, "in_flight", self.in_flight.len() as f64));
        out.push(Statistic::gauge(name, "known_sizes", self.known_sizes.len() as f64));
        out.push(Statistic::gauge(
            name,
            "throughput_bytes_per_sec",
            self.throughput.bytes_per_second(),
        ));
    }

    fn cancel_request(&mut self, ctx: &mut StreamerContext, id: RequestId) -> bool {
        if let Some(pos) = self.queued.iter().position(|q| *q == id) {
            self.queued.remove(pos);
            self.stats.jobs_canceled += 1;
            ctx.mark_request_as_completed(id, RequestStatus::Canceled);
            return true;
        }

        let finished = match self.in_flight.get(&id) {
            Some(job) => job.abort.is_finished(),
            None => return false,
        };
        if finished {
            // The result is already on its way; let it complete normally.
            self.stats.cancel_races_lost += 1;
            debug!(request = %id, "cancel lost race with device completion");
            return false;
        }

        if let Some(job) = self.in_flight.remove(&id) {
            job.abort.abort();
        }
        self.stats.jobs_canceled += 1;
        debug!(request = %id, "device job canceled");
        ctx.mark_request_as_completed(id, RequestStatus::Canceled);
        true
    }
}

impl<B: IoBackend> Drop for DeviceLayer<B> {
    fn drop(&mut self) {
        for job in self.in_flight.values() {
            job.abort.abort();
        }
    }
}
