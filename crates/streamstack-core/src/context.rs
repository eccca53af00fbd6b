//! Shared scheduling and completion hub.
//!
//! The [`StreamerContext`] owns every live [`FileRequest`] in an arena keyed
//! by [`RequestId`], the external queue of submitted requests, the internal
//! queue of requests accepted by the layer chain, and the completion
//! notification path. It is passed explicitly to every layer call.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::error::StreamError;
use crate::request::{FileRequest, RequestCommand, RequestId, RequestIdGen, RequestStatus};
use crate::scheduler::RequestOrdering;
use crate::statistics::Statistic;

/// Counters maintained by the context.
#[derive(Debug, Clone, Default)]
pub struct ContextStats {
    /// Requests submitted by callers.
    pub submitted: u64,
    /// Sub-requests created by layers.
    pub children_created: u64,
    /// Requests finished with `Completed`.
    pub completed: u64,
    /// Requests finished with `Failed`.
    pub failed: u64,
    /// Requests finished with `Canceled`.
    pub canceled: u64,
    /// Completions reported for requests that were already finished.
    pub double_completions: u64,
    /// Sum of caller-visible latencies, for the average.
    pub total_latency: Duration,
}

/// Scheduling/completion hub threaded through every layer.
pub struct StreamerContext {
    requests: HashMap<RequestId, FileRequest>,
    external: VecDeque<RequestId>,
    internal: VecDeque<RequestId>,
    layer_completions: Vec<RequestId>,
    ids: Arc<RequestIdGen>,
    waker: Arc<Notify>,
    stats: ContextStats,
}

impl StreamerContext {
    /// Creates a context with its own id generator and waker.
    pub fn new() -> Self {
        Self::with_shared(Arc::new(RequestIdGen::new()), Arc::new(Notify::new()))
    }

    /// Creates a context sharing the caller's id generator and waker.
    pub fn with_shared(ids: Arc<RequestIdGen>, waker: Arc<Notify>) -> Self {
        Self {
            requests: HashMap::new(),
            external: VecDeque::new(),
            internal: VecDeque::new(),
            layer_completions: Vec::new(),
            ids,
            waker,
            stats: ContextStats::default(),
        }
    }

    /// Handle used by asynchronous workers to wake the scheduler loop.
    pub fn waker(&self) -> Arc<Notify> {
        Arc::clone(&self.waker)
    }

    /// Allocates a fresh request id.
    pub fn next_request_id(&self) -> RequestId {
        self.ids.next_id()
    }

    /// Accepts a caller request into the external queue.
    pub fn submit(&mut self, mut request: FileRequest) -> RequestId {
        let id = request.id;
        request.status = RequestStatus::Queued;
        debug!(request = %id, kind = request.command.kind(), priority = %request.priority, "request submitted");
        self.requests.insert(id, request);
        self.external.push_back(id);
        self.stats.submitted += 1;
        id
    }

    /// Creates a sub-request of `parent` and places it in the internal queue.
    ///
    /// A layer that splits a request must create all of its children before
    /// forwarding any of them, so the parent cannot complete early. When
    /// `owner` is set, the child's completion is held for that layer's
    /// second pass (see [`take_layer_completions`](Self::take_layer_completions))
    /// instead of being retired immediately.
    pub fn create_child(
        &mut self,
        parent: RequestId,
        command: RequestCommand,
        owner: Option<&str>,
    ) -> RequestId {
        let id = self.ids.next_id();
        let mut child = FileRequest::new(id, command);
        child.status = RequestStatus::InProgress;
        child.parent = Some(parent);
        child.owner = owner.map(str::to_string);
        if let Some(p) = self.requests.get_mut(&parent) {
            child.priority = p.priority;
            child.deadline = p.deadline;
            p.pending_children += 1;
        }
        debug!(request = %id, parent = %parent, kind = child.command.kind(), "child request created");
        self.requests.insert(id, child);
        self.internal.push_back(id);
        self.stats.children_created += 1;
        id
    }

    /// Looks up a live request.
    pub fn request(&self, id: RequestId) -> Option<&FileRequest> {
        self.requests.get(&id)
    }

    /// Looks up a live request for modification.
    pub fn request_mut(&mut self, id: RequestId) -> Option<&mut FileRequest> {
        self.requests.get_mut(&id)
    }

    /// Returns true if the request exists and has not reached a terminal status.
    pub fn is_live(&self, id: RequestId) -> bool {
        self.requests
            .get(&id)
            .is_some_and(|r| !r.status.is_terminal())
    }

    /// Number of requests in the arena, including finished ones awaiting a layer's second pass.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Returns true if no requests are tracked.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Snapshot of the external queue in dispatch order.
    pub fn external_pending(&self) -> Vec<RequestId> {
        self.external.iter().copied().collect()
    }

    /// Snapshot of the internal (dispatched) queue.
    pub fn internal_pending(&self) -> Vec<RequestId> {
        self.internal.iter().copied().collect()
    }

    /// Reorders the external queue with `ordering`.
    pub fn sort_external(&mut self, ordering: &dyn RequestOrdering, now: Instant) {
        let requests = &self.requests;
        self.external
            .make_contiguous()
            .sort_by(|a, b| match (requests.get(a), requests.get(b)) {
                (Some(a), Some(b)) => ordering.compare(a, b, now),
                _ => a.cmp(b),
            });
    }

    /// Next request to dispatch, without removing it.
    pub fn peek_external(&self) -> Option<RequestId> {
        self.external.front().copied()
    }

    /// Removes every external request matching `predicate`, preserving order.
    pub fn take_external_where<F>(&mut self, mut predicate: F) -> Vec<RequestId>
    where
        F: FnMut(&FileRequest) -> bool,
    {
        let requests = &self.requests;
        let mut taken = Vec::new();
        self.external.retain(|id| match requests.get(id) {
            Some(r) if predicate(r) => {
                taken.push(*id);
                false
            }
            _ => true,
        });
        taken
    }

    /// Moves a request from the external to the internal queue as `InProgress`.
    pub fn mark_dispatched(&mut self, id: RequestId) {
        self.external.retain(|r| *r != id);
        if let Some(request) = self.requests.get_mut(&id) {
            if request.set_status(RequestStatus::InProgress) {
                self.internal.push_back(id);
            }
        }
    }

    /// Adds to the number of bytes a request has delivered into its buffer.
    pub fn add_bytes_delivered(&mut self, id: RequestId, bytes: u64) {
        if let Some(request) = self.requests.get_mut(&id) {
            request.bytes_delivered += bytes;
        }
    }

    /// Records the file size answered for a size query.
    pub fn set_file_size(&mut self, id: RequestId, size: u64) {
        if let Some(request) = self.requests.get_mut(&id) {
            request.file_size = Some(size);
        }
    }

    /// Records a predicted completion time.
    pub fn set_estimated_completion(&mut self, id: RequestId, at: Instant) {
        if let Some(request) = self.requests.get_mut(&id) {
            request.estimated_completion = Some(at);
        }
    }

    /// Records `error` and completes the request as `Failed`.
    pub fn fail(&mut self, id: RequestId, error: StreamError) {
        if let Some(request) = self.requests.get_mut(&id) {
            if !request.status.is_terminal() {
                debug!(request = %id, error = %error, "request failed");
                request.failure = Some(error);
            }
        }
        self.mark_request_as_completed(id, RequestStatus::Failed);
    }

    /// Sets the terminal status of a request and removes it from both queues.
    ///
    /// Requests owned by a layer are parked until that layer collects them
    /// with [`take_layer_completions`](Self::take_layer_completions); all
    /// others are retired immediately, notifying the caller and the parent.
    ///
    /// Completing a request twice is a programming error: it asserts in
    /// debug builds and is logged and ignored in release builds.
    pub fn mark_request_as_completed(&mut self, id: RequestId, status: RequestStatus) {
        debug_assert!(status.is_terminal(), "completion status must be terminal");
        let owned = match self.requests.get_mut(&id) {
            Some(request) if !request.status.is_terminal() => {
                request.status = status;
                request.owner.is_some()
            }
            _ => {
                self.report_double_completion(id);
                return;
            }
        };

        self.external.retain(|r| *r != id);
        self.internal.retain(|r| *r != id);

        if owned {
            self.layer_completions.push(id);
        } else {
            self.retire(id);
        }
    }

    fn report_double_completion(&mut self, id: RequestId) {
        self.stats.double_completions += 1;
        let err = StreamError::DoubleCompletion { request: id };
        error!(request = %id, "{}", err);
        debug_assert!(false, "{}", err);
    }

    /// Removes and returns the finished requests owned by `owner`.
    ///
    /// The requests stay in the arena (terminal) so the layer can inspect
    /// them; the layer must [`retire`](Self::retire) each one afterwards.
    pub fn take_layer_completions(&mut self, owner: &str) -> Vec<RequestId> {
        let requests = &self.requests;
        let mut taken = Vec::new();
        self.layer_completions.retain(|id| {
            let mine = requests
                .get(id)
                .is_some_and(|r| r.owner.as_deref() == Some(owner));
            if mine {
                taken.push(*id);
            }
            !mine
        });
        taken
    }

    /// Removes a finished request, delivers its completion and updates its parent.
    pub fn retire(&mut self, id: RequestId) {
        let Some(mut request) = self.requests.remove(&id) else {
            return;
        };
        if !request.status.is_terminal() {
            warn!(request = %id, status = %request.status, "retiring a request that never finished");
            request.status = RequestStatus::Canceled;
        }
        self.layer_completions.retain(|r| *r != id);
        self.external.retain(|r| *r != id);
        self.internal.retain(|r| *r != id);

        if request.parent.is_none() {
            self.record_outcome(&request);
        }

        let completion = request.completion_record();
        debug!(
            request = %id,
            status = %completion.status,
            bytes = completion.bytes_delivered,
            "request retired"
        );
        if let Some(sender) = request.completion.take() {
            // The caller may have dropped its handle.
            let _ = sender.send(completion);
        }

        if let Some(parent) = request.parent {
            self.child_finished(parent, &request);
        }
    }

    fn record_outcome(&mut self, request: &FileRequest) {
        match request.status {
            RequestStatus::Completed => self.stats.completed += 1,
            RequestStatus::Failed => self.stats.failed += 1,
            _ => self.stats.canceled += 1,
        }
        self.stats.total_latency += request.submitted_at.elapsed();
    }

    fn child_finished(&mut self, parent_id: RequestId, child: &FileRequest) {
        let Some(parent) = self.requests.get_mut(&parent_id) else {
            return;
        };
        if parent.status.is_terminal() {
            return;
        }
        parent.pending_children = parent.pending_children.saturating_sub(1);
        parent.bytes_delivered += child.bytes_delivered;
        parent.child_outcome = parent.child_outcome.worst(child.status);
        if parent.failure.is_none() {
            parent.failure = child.failure.clone();
        }
        if parent.pending_children == 0 {
            let status = parent.child_outcome;
            self.mark_request_as_completed(parent_id, status);
        }
    }

    /// Direct children of a request.
    pub fn children_of(&self, id: RequestId) -> Vec<RequestId> {
        let mut children: Vec<RequestId> = self
            .requests
            .values()
            .filter(|r| r.parent == Some(id))
            .map(|r| r.id)
            .collect();
        children.sort();
        children
    }

    /// All descendants of a request, deepest first.
    pub fn descendants_of(&self, id: RequestId) -> Vec<RequestId> {
        let mut out = Vec::new();
        for child in self.children_of(id) {
            out.extend(self.descendants_of(child));
            out.push(child);
        }
        out
    }

    /// Cancels every live request and retires everything, e.g. on shutdown.
    pub fn cancel_all(&mut self) {
        let mut ids: Vec<RequestId> = self.requests.keys().copied().collect();
        // Children first so parents are retired with their own status.
        ids.sort_by(|a, b| b.cmp(a));
        for id in &ids {
            if let Some(request) = self.requests.get_mut(id) {
                if !request.status.is_terminal() {
                    request.status = RequestStatus::Canceled;
                }
            }
        }
        for id in ids {
            self.retire(id);
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> &ContextStats {
        &self.stats
    }

    /// Appends the context's statistics under the `scheduler` layer name.
    pub fn collect_statistics(&self, out: &mut Vec<Statistic>) {
        const LAYER: &str = "scheduler";
        let finished = self.stats.completed + self.stats.failed + self.stats.canceled;
        let avg_latency_ms = if finished == 0 {
            0.0
        } else {
            self.stats.total_latency.as_secs_f64() * 1000.0 / finished as f64
        };
        out.push(Statistic::counter(LAYER, "submitted", self.stats.submitted));
        out.push(Statistic::counter(LAYER, "completed", self.stats.completed));
        out.push(Statistic::counter(LAYER, "failed", self.stats.failed));
        out.push(Statistic::counter(LAYER, "canceled", self.stats.canceled));
        out.push(Statistic::counter(
            LAYER,
            "children_created",
            self.stats.children_created,
        ));
        out.push(Statistic::counter(
            LAYER,
            "double_completions",
            self.stats.double_completions,
        ));
        out.push(Statistic::gauge(
            LAYER,
            "external_pending",
            self.external.len() as f64,
        ));
        out.push(Statistic::gauge(
            LAYER,
            "internal_pending",
            self.internal.len() as f64,
        ));
        out.push(Statistic::gauge(LAYER, "average_latency_ms", avg_latency_ms));
    }
}

impl Default for StreamerContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::RequestPath;
    use crate::request::{ByteRange, ReadBuffer};

    fn read_command(offset: u64, len: u64) -> RequestCommand {
        RequestCommand::Read {
            path: RequestPath::from_absolute("/data/a.bin"),
            range: ByteRange::new(offset, len),
            buffer: ReadBuffer::new(),
            buffer_offset: 0,
        }
    }

    #[test]
    fn test_submit_places_request_in_external_queue() {
        let mut ctx = StreamerContext::new();
        let id = ctx.next_request_id();
        ctx.submit(FileRequest::new(id, read_command(0, 10)));

        assert_eq!(ctx.external_pending(), vec![id]);
        assert!(ctx.internal_pending().is_empty());
        assert_eq!(ctx.request(id).unwrap().status(), RequestStatus::Queued);
    }

    #[test]
    fn test_dispatch_moves_between_queues() {
        let mut ctx = StreamerContext::new();
        let id = ctx.next_request_id();
        ctx.submit(FileRequest::new(id, read_command(0, 10)));
        ctx.mark_dispatched(id);

        assert!(ctx.external_pending().is_empty());
        assert_eq!(ctx.internal_pending(), vec![id]);
        assert_eq!(ctx.request(id).unwrap().status(), RequestStatus::InProgress);
    }

    #[test]
    fn test_completion_notifies_once_and_removes() {
        let mut ctx = StreamerContext::new();
        let id = ctx.next_request_id();
        let mut request = FileRequest::new(id, read_command(0, 10));
        let mut rx = request.subscribe();
        ctx.submit(request);
        ctx.mark_dispatched(id);
        ctx.add_bytes_delivered(id, 10);
        ctx.mark_request_as_completed(id, RequestStatus::Completed);

        let completion = rx.try_recv().unwrap();
        assert_eq!(completion.status, RequestStatus::Completed);
        assert_eq!(completion.bytes_delivered, 10);
        assert!(ctx.request(id).is_none());
        assert!(ctx.internal_pending().is_empty());
        assert_eq!(ctx.stats().completed, 1);
    }

    #[test]
    fn test_fail_records_error() {
        let mut ctx = StreamerContext::new();
        let id = ctx.next_request_id();
        let mut request = FileRequest::new(id, read_command(0, 10));
        let mut rx = request.subscribe();
        ctx.submit(request);
        ctx.fail(
            id,
            StreamError::NotFound {
                path: "/data/a.bin".to_string(),
            },
        );

        let completion = rx.try_recv().unwrap();
        assert_eq!(completion.status, RequestStatus::Failed);
        assert!(matches!(completion.failure, Some(StreamError::NotFound { .. })));
    }

    #[test]
    fn test_children_aggregate_into_parent() {
        let mut ctx = StreamerContext::new();
        let parent = ctx.next_request_id();
        let mut request = FileRequest::new(parent, read_command(0, 20));
        let mut rx = request.subscribe();
        ctx.submit(request);
        ctx.mark_dispatched(parent);

        let a = ctx.create_child(parent, read_command(0, 10), None);
        let b = ctx.create_child(parent, read_command(10, 10), None);
        assert_eq!(ctx.request(parent).unwrap().pending_children(), 2);
        assert_eq!(ctx.children_of(parent), vec![a, b]);

        ctx.add_bytes_delivered(a, 10);
        ctx.mark_request_as_completed(a, RequestStatus::Completed);
        assert!(rx.try_recv().is_err());

        ctx.add_bytes_delivered(b, 10);
        ctx.mark_request_as_completed(b, RequestStatus::Completed);
        let completion = rx.try_recv().unwrap();
        assert_eq!(completion.status, RequestStatus::Completed);
        assert_eq!(completion.bytes_delivered, 20);
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_failed_child_fails_parent() {
        let mut ctx = StreamerContext::new();
        let parent = ctx.next_request_id();
        let mut request = FileRequest::new(parent, read_command(0, 20));
        let mut rx = request.subscribe();
        ctx.submit(request);
        ctx.mark_dispatched(parent);

        let a = ctx.create_child(parent, read_command(0, 10), None);
        let b = ctx.create_child(parent, read_command(10, 10), None);
        ctx.mark_request_as_completed(a, RequestStatus::Canceled);
        ctx.fail(
            b,
            StreamError::DeviceIo {
                device: "device".to_string(),
                reason: "bad sector".to_string(),
            },
        );

        let completion = rx.try_recv().unwrap();
        assert_eq!(completion.status, RequestStatus::Failed);
        assert!(matches!(completion.failure, Some(StreamError::DeviceIo { .. })));
    }

    #[test]
    fn test_owned_child_waits_for_layer() {
        let mut ctx = StreamerContext::new();
        let parent = ctx.next_request_id();
        let mut request = FileRequest::new(parent, read_command(0, 10));
        let mut rx = request.subscribe();
        ctx.submit(request);
        ctx.mark_dispatched(parent);

        let child = ctx.create_child(parent, read_command(0, 10), Some("cache"));
        ctx.mark_request_as_completed(child, RequestStatus::Completed);
        assert!(rx.try_recv().is_err());
        assert!(ctx.take_layer_completions("device").is_empty());

        let finished = ctx.take_layer_completions("cache");
        assert_eq!(finished, vec![child]);
        assert_eq!(
            ctx.request(child).unwrap().status(),
            RequestStatus::Completed
        );

        ctx.retire(child);
        assert_eq!(rx.try_recv().unwrap().status, RequestStatus::Completed);
    }

    #[test]
    fn test_descendants_deepest_first() {
        let mut ctx = StreamerContext::new();
        let root = ctx.next_request_id();
        ctx.submit(FileRequest::new(root, read_command(0, 10)));
        let child = ctx.create_child(root, read_command(0, 10), None);
        let grandchild = ctx.create_child(child, read_command(0, 10), None);
        assert_eq!(ctx.descendants_of(root), vec![grandchild, child]);
    }

    #[test]
    fn test_cancel_all_notifies_everyone() {
        let mut ctx = StreamerContext::new();
        let a = ctx.next_request_id();
        let mut request = FileRequest::new(a, read_command(0, 10));
        let mut rx = request.subscribe();
        ctx.submit(request);
        ctx.create_child(a, read_command(0, 10), Some("cache"));

        ctx.cancel_all();
        assert!(ctx.is_empty());
        assert_eq!(rx.try_recv().unwrap().status, RequestStatus::Canceled);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "completed more than once")]
    fn test_double_completion_asserts_in_debug() {
        let mut ctx = StreamerContext::new();
        let id = ctx.next_request_id();
        ctx.submit(FileRequest::new(id, read_command(0, 10)));
        ctx.mark_request_as_completed(id, RequestStatus::Completed);
        ctx.mark_request_as_completed(id, RequestStatus::Completed);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_double_completion_ignored_in_release() {
        let mut ctx = StreamerContext::new();
        let id = ctx.next_request_id();
        ctx.submit(FileRequest::new(id, read_command(0, 10)));
        ctx.mark_request_as_completed(id, RequestStatus::Completed);
        ctx.mark_request_as_completed(id, RequestStatus::Failed);
        assert_eq!(ctx.stats().double_completions, 1);
        assert_eq!(ctx.stats().completed, 1);
    }
}
