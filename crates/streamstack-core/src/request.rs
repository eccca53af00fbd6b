//! File requests: the unit of work flowing through the layer chain.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::{StreamError, StreamResult};
use crate::path::RequestPath;

/// Identifier of a request within one streamer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// Atomic counter for generating unique request IDs.
#[derive(Debug)]
pub struct RequestIdGen {
    next: AtomicU64,
}

impl RequestIdGen {
    /// Create a new ID generator starting from 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Generate the next unique request ID.
    pub fn next_id(&self) -> RequestId {
        RequestId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RequestIdGen {
    fn default() -> Self {
        Self::new()
    }
}

/// Priority levels for requests. Higher priority requests are dispatched first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum RequestPriority {
    /// Highest priority - data needed to render the current frame
    Critical = 0,
    /// High priority - foreground streaming
    High = 1,
    /// Normal priority - regular loads
    #[default]
    Normal = 2,
    /// Lowest priority - prefetch and speculative loads
    Low = 3,
}

impl fmt::Display for RequestPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestPriority::Critical => write!(f, "Critical"),
            RequestPriority::High => write!(f, "High"),
            RequestPriority::Normal => write!(f, "Normal"),
            RequestPriority::Low => write!(f, "Low"),
        }
    }
}

impl RequestPriority {
    /// Returns the index for array access (0-3).
    #[inline]
    pub fn as_index(&self) -> usize {
        *self as usize
    }

    /// Returns the next higher priority, saturating at `Critical`.
    pub fn promoted(&self) -> RequestPriority {
        match self {
            RequestPriority::Critical | RequestPriority::High => RequestPriority::Critical,
            RequestPriority::Normal => RequestPriority::High,
            RequestPriority::Low => RequestPriority::Normal,
        }
    }
}

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    /// Created, not yet submitted
    Pending,
    /// Waiting in the external queue
    Queued,
    /// Accepted by the layer chain
    InProgress,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Canceled before completion
    Canceled,
}

impl RequestStatus {
    /// Returns true for `Completed`, `Failed` and `Canceled`.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Canceled
        )
    }

    fn rank(&self) -> u8 {
        match self {
            RequestStatus::Pending => 0,
            RequestStatus::Queued => 1,
            RequestStatus::InProgress => 2,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Canceled => 3,
        }
    }

    /// Returns true if moving from `self` to `next` keeps the lifecycle monotonic.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    /// Combines two child outcomes: a failure dominates a cancellation, which
    /// dominates success.
    pub(crate) fn worst(self, other: RequestStatus) -> RequestStatus {
        match (self, other) {
            (RequestStatus::Failed, _) | (_, RequestStatus::Failed) => RequestStatus::Failed,
            (RequestStatus::Canceled, _) | (_, RequestStatus::Canceled) => RequestStatus::Canceled,
            _ => RequestStatus::Completed,
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A byte range within a file. A `None` length means "to the end of the file".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    /// Start of the range.
    pub offset: u64,
    /// Length of the range, or `None` for the rest of the file.
    pub length: Option<u64>,
}

impl ByteRange {
    /// A bounded range of `length` bytes starting at `offset`.
    pub fn new(offset: u64, length: u64) -> Self {
        Self {
            offset,
            length: Some(length),
        }
    }

    /// The whole file.
    pub fn whole_file() -> Self {
        Self {
            offset: 0,
            length: None,
        }
    }

    /// Everything from `offset` to the end of the file.
    pub fn from_offset(offset: u64) -> Self {
        Self {
            offset,
            length: None,
        }
    }

    /// Exclusive end of the range, if bounded.
    pub fn end(&self) -> Option<u64> {
        self.length.map(|len| self.offset.saturating_add(len))
    }

    /// Resolves the sentinel against a known file size and validates the range.
    pub fn resolve(&self, file_size: u64) -> StreamResult<(u64, u64)> {
        let length = self
            .length
            .unwrap_or_else(|| file_size.saturating_sub(self.offset));
        match self.offset.checked_add(length) {
            Some(end) if end <= file_size => Ok((self.offset, length)),
            _ => Err(StreamError::InvalidRange {
                offset: self.offset,
                length,
                file_size,
            }),
        }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end() {
            Some(end) => write!(f, "[{}, {})", self.offset, end),
            None => write!(f, "[{}, EOF)", self.offset),
        }
    }
}

/// Caller-owned destination buffer.
///
/// The pipeline only writes into the buffer; it never frees or replaces it.
/// Clones share the same storage, which lets split sub-requests write their
/// portion of the parent's destination.
#[derive(Clone, Default)]
pub struct ReadBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl ReadBuffer {
    /// Creates an empty buffer that grows as data is written.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a zero-filled buffer of `len` bytes.
    pub fn with_len(len: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(vec![0; len])),
        }
    }

    /// Writes `data` at `offset`, growing the buffer if needed.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> StreamResult<()> {
        let end = offset
            .checked_add(data.len())
            .ok_or(StreamError::BufferOverflow {
                offset,
                length: data.len(),
            })?;
        let mut buf = self.inner.lock();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Copies `len` bytes starting at `offset`, or `None` if the buffer is shorter.
    pub fn read_at(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let buf = self.inner.lock();
        buf.get(offset..offset.checked_add(len)?).map(<[u8]>::to_vec)
    }

    /// Current length in bytes.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the full contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.lock().clone()
    }

    /// Returns true if both handles refer to the same storage.
    pub fn same_storage(&self, other: &ReadBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ReadBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadBuffer").field("len", &self.len()).finish()
    }
}

/// Operation carried by a request.
#[derive(Debug, Clone)]
pub enum RequestCommand {
    /// Read `range` of `path` into `buffer` starting at `buffer_offset`.
    Read {
        /// File to read.
        path: RequestPath,
        /// Byte range within the file.
        range: ByteRange,
        /// Destination buffer.
        buffer: ReadBuffer,
        /// Where in `buffer` the first byte of `range` goes.
        buffer_offset: usize,
    },
    /// Query the authoritative file size.
    GetFileSize {
        /// File to query.
        path: RequestPath,
    },
    /// Evict shared cache entries for one file.
    FlushCache {
        /// File to flush.
        path: RequestPath,
    },
    /// Evict every shared cache entry.
    FlushEntireCache,
    /// Pin a region of a file in cache.
    CreateDedicatedCache {
        /// File to pin.
        path: RequestPath,
        /// Region to pin.
        range: ByteRange,
    },
    /// Release a region pinned by `CreateDedicatedCache`.
    DestroyDedicatedCache {
        /// File to release.
        path: RequestPath,
        /// Region to release; must match the pinned range.
        range: ByteRange,
    },
    /// Cancel another request.
    Cancel {
        /// Request to cancel.
        target: RequestId,
    },
}

impl RequestCommand {
    /// Short name of the operation, used in logs and statistics.
    pub fn kind(&self) -> &'static str {
        match self {
            RequestCommand::Read { .. } => "read",
            RequestCommand::GetFileSize { .. } => "get_file_size",
            RequestCommand::FlushCache { .. } => "flush_cache",
            RequestCommand::FlushEntireCache => "flush_entire_cache",
            RequestCommand::CreateDedicatedCache { .. } => "create_dedicated_cache",
            RequestCommand::DestroyDedicatedCache { .. } => "destroy_dedicated_cache",
            RequestCommand::Cancel { .. } => "cancel",
        }
    }

    /// The target file, for commands that have one.
    pub fn path(&self) -> Option<&RequestPath> {
        match self {
            RequestCommand::Read { path, .. }
            | RequestCommand::GetFileSize { path }
            | RequestCommand::FlushCache { path }
            | RequestCommand::CreateDedicatedCache { path, .. }
            | RequestCommand::DestroyDedicatedCache { path, .. } => Some(path),
            RequestCommand::FlushEntireCache | RequestCommand::Cancel { .. } => None,
        }
    }

    /// Returns true for reads, the only commands subject to admission control.
    pub fn is_read(&self) -> bool {
        matches!(self, RequestCommand::Read { .. })
    }
}

/// Final report delivered to the caller when a request finishes.
#[derive(Debug, Clone)]
pub struct RequestCompletion {
    /// The finished request.
    pub id: RequestId,
    /// Terminal status.
    pub status: RequestStatus,
    /// Bytes written into the destination buffer.
    pub bytes_delivered: u64,
    /// File size, for size queries.
    pub file_size: Option<u64>,
    /// Failure detail when `status` is `Failed`.
    pub failure: Option<StreamError>,
    /// Time from submission to completion.
    pub latency: Duration,
}

impl RequestCompletion {
    /// Returns true if the request completed successfully.
    pub fn is_success(&self) -> bool {
        self.status == RequestStatus::Completed
    }

    /// Converts a non-successful completion into its error.
    pub fn into_result(self) -> StreamResult<RequestCompletion> {
        match self.status {
            RequestStatus::Completed => Ok(self),
            RequestStatus::Canceled => Err(StreamError::Canceled { request: self.id }),
            _ => Err(self.failure.unwrap_or_else(|| StreamError::DeviceIo {
                device: "unknown".to_string(),
                reason: format!("request {} failed without detail", self.id),
            })),
        }
    }
}

/// One unit of work in the pipeline.
///
/// Requests live in the [`StreamerContext`](crate::context::StreamerContext)
/// arena from submission until completion; layers refer to them by id.
#[derive(Debug)]
pub struct FileRequest {
    pub(crate) id: RequestId,
    pub(crate) command: RequestCommand,
    pub(crate) status: RequestStatus,
    pub(crate) priority: RequestPriority,
    pub(crate) deadline: Option<Instant>,
    pub(crate) submitted_at: Instant,
    pub(crate) estimated_completion: Option<Instant>,
    pub(crate) parent: Option<RequestId>,
    pub(crate) pending_children: usize,
    pub(crate) child_outcome: RequestStatus,
    pub(crate) owner: Option<String>,
    pub(crate) bytes_delivered: u64,
    pub(crate) file_size: Option<u64>,
    pub(crate) failure: Option<StreamError>,
    pub(crate) completion: Option<oneshot::Sender<RequestCompletion>>,
}

impl FileRequest {
    /// Creates a pending request with normal priority and no deadline.
    pub fn new(id: RequestId, command: RequestCommand) -> Self {
        Self {
            id,
            command,
            status: RequestStatus::Pending,
            priority: RequestPriority::Normal,
            deadline: None,
            submitted_at: Instant::now(),
            estimated_completion: None,
            parent: None,
            pending_children: 0,
            child_outcome: RequestStatus::Completed,
            owner: None,
            bytes_delivered: 0,
            file_size: None,
            failure: None,
            completion: None,
        }
    }

    /// Convenience constructor for a read request.
    pub fn read(id: RequestId, path: RequestPath, range: ByteRange, buffer: ReadBuffer) -> Self {
        Self::new(
            id,
            RequestCommand::Read {
                path,
                range,
                buffer,
                buffer_offset: 0,
            },
        )
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets an advisory deadline.
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Registers a completion channel; the receiver resolves exactly once.
    pub fn subscribe(&mut self) -> oneshot::Receiver<RequestCompletion> {
        let (tx, rx) = oneshot::channel();
        self.completion = Some(tx);
        rx
    }

    /// Moves the status forward. Returns false if the transition would go
    /// backwards or leave a terminal state.
    pub fn set_status(&mut self, next: RequestStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// Request identifier.
    #[inline]
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// The operation.
    #[inline]
    pub fn command(&self) -> &RequestCommand {
        &self.command
    }

    /// Current status.
    #[inline]
    pub fn status(&self) -> RequestStatus {
        self.status
    }

    /// Priority.
    #[inline]
    pub fn priority(&self) -> RequestPriority {
        self.priority
    }

    /// Advisory deadline.
    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Submission time.
    #[inline]
    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    /// Latest predicted completion time.
    #[inline]
    pub fn estimated_completion(&self) -> Option<Instant> {
        self.estimated_completion
    }

    /// Parent request, for sub-requests created by a layer.
    #[inline]
    pub fn parent(&self) -> Option<RequestId> {
        self.parent
    }

    /// Number of sub-requests still outstanding.
    #[inline]
    pub fn pending_children(&self) -> usize {
        self.pending_children
    }

    /// Bytes written into the destination so far.
    #[inline]
    pub fn bytes_delivered(&self) -> u64 {
        self.bytes_delivered
    }

    /// Size answered for a size query.
    #[inline]
    pub fn file_size(&self) -> Option<u64> {
        self.file_size
    }

    /// Failure detail, once failed.
    #[inline]
    pub fn failure(&self) -> Option<&StreamError> {
        self.failure.as_ref()
    }

    /// Byte length of a read, if bounded.
    pub fn read_length(&self) -> Option<u64> {
        match &self.command {
            RequestCommand::Read { range, .. } => range.length,
            _ => None,
        }
    }

    pub(crate) fn completion_record(&self) -> RequestCompletion {
        RequestCompletion {
            id: self.id,
            status: self.status,
            bytes_delivered: self.bytes_delivered,
            file_size: self.file_size,
            failure: self.failure.clone(),
            latency: self.submitted_at.elapsed(),
        }
    }
}
