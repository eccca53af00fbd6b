//! Request ordering and the scheduler loop driving the layer chain.
//!
//! The [`Scheduler`] owns the [`StreamerContext`] and the head of the stack.
//! Each [`tick`](Scheduler::tick) processes cancellations, reorders the
//! external queue, dispatches requests while the chain reports free slots,
//! lets every layer make progress, and periodically refreshes completion
//! estimates. [`Scheduler::run`] wraps ticks in an async loop that sleeps on
//! new messages, I/O wake-ups, or the idle timeout.

use std::cmp::Ordering;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::context::StreamerContext;
use crate::error::StreamError;
use crate::layer::{layer_names, StreamStackEntry};
use crate::request::{FileRequest, RequestCommand, RequestId, RequestPriority, RequestStatus};
use crate::statistics::Statistic;

/// Comparator deciding dispatch order of the external queue.
pub trait RequestOrdering: Send {
    /// Orders `a` before `b` when it returns `Ordering::Less`.
    fn compare(&self, a: &FileRequest, b: &FileRequest, now: Instant) -> Ordering;
}

/// Dispatches in submission order.
#[derive(Debug, Clone, Copy, Default)]
pub struct FifoOrdering;

impl RequestOrdering for FifoOrdering {
    fn compare(&self, a: &FileRequest, b: &FileRequest, _now: Instant) -> Ordering {
        a.id().cmp(&b.id())
    }
}

/// Priority ordering with deadline urgency and starvation promotion.
///
/// Requests whose deadline falls within the urgency window, or whose
/// estimated completion already overshoots their deadline, go first. The
/// rest are ordered by priority, promoted one level once they have waited
/// past the starvation threshold, then by earliest deadline, then FIFO.
#[derive(Debug, Clone, Copy)]
pub struct DeadlineAwareOrdering {
    /// How close a deadline must be to count as urgent.
    pub urgency_window: Duration,
    /// Waiting time after which a request is promoted one priority level.
    pub starvation_threshold: Duration,
}

impl Default for DeadlineAwareOrdering {
    fn default() -> Self {
        Self {
            urgency_window: Duration::from_millis(50),
            starvation_threshold: Duration::from_millis(100),
        }
    }
}

impl DeadlineAwareOrdering {
    /// Returns true if `request` should jump ahead of non-urgent work.
    pub fn is_urgent(&self, request: &FileRequest, now: Instant) -> bool {
        request.deadline().is_some_and(|deadline| {
            deadline <= now + self.urgency_window
                || request
                    .estimated_completion()
                    .is_some_and(|estimate| estimate > deadline)
        })
    }

    /// Priority after starvation promotion.
    pub fn effective_priority(&self, request: &FileRequest, now: Instant) -> RequestPriority {
        if now.saturating_duration_since(request.submitted_at()) >= self.starvation_threshold {
            request.priority().promoted()
        } else {
            request.priority()
        }
    }
}

impl RequestOrdering for DeadlineAwareOrdering {
    fn compare(&self, a: &FileRequest, b: &FileRequest, now: Instant) -> Ordering {
        self.is_urgent(b, now)
            .cmp(&self.is_urgent(a, now))
            .then_with(|| {
                self.effective_priority(a, now)
                    .cmp(&self.effective_priority(b, now))
            })
            .then_with(|| match (a.deadline(), b.deadline()) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .then_with(|| a.id().cmp(&b.id()))
    }
}

/// Configuration for the scheduler loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Longest sleep between ticks when nothing wakes the loop (default 50ms).
    pub idle_wait_ms: u64,
    /// Interval between completion estimate refreshes (default 100ms).
    pub estimate_interval_ms: u64,
    /// Deadline proximity that makes a request urgent (default 50ms).
    pub urgency_window_ms: u64,
    /// Waiting time before a request is promoted (default 100ms).
    pub starvation_threshold_ms: u64,
    /// Upper bound on dispatches per tick (default 64).
    pub max_dispatch_per_tick: usize,
    /// Use plain submission order instead of deadline-aware ordering.
    pub fifo: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_wait_ms: 50,
            estimate_interval_ms: 100,
            urgency_window_ms: 50,
            starvation_threshold_ms: 100,
            max_dispatch_per_tick: 64,
            fifo: false,
        }
    }
}

impl SchedulerConfig {
    /// Idle sleep as a duration.
    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    /// Estimate refresh interval as a duration.
    pub fn estimate_interval(&self) -> Duration {
        Duration::from_millis(self.estimate_interval_ms)
    }

    /// The ordering this configuration selects.
    pub fn ordering(&self) -> Box<dyn RequestOrdering> {
        if self.fifo {
            Box::new(FifoOrdering)
        } else {
            Box::new(DeadlineAwareOrdering {
                urgency_window: Duration::from_millis(self.urgency_window_ms),
                starvation_threshold: Duration::from_millis(self.starvation_threshold_ms),
            })
        }
    }
}

/// Scheduler counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Ticks executed.
    pub ticks: u64,
    /// Requests handed to the chain.
    pub dispatched: u64,
    /// Ticks that stopped dispatching because the chain was full.
    pub backpressure_stalls: u64,
    /// Cancellation requests processed.
    pub cancels_requested: u64,
    /// Cancellations that took effect.
    pub cancels_applied: u64,
    /// Completion estimate refreshes.
    pub estimate_refreshes: u64,
}

/// Messages from the public API to the scheduler task.
pub enum SchedulerMessage {
    /// A new request.
    Submit(Box<FileRequest>),
    /// Point-in-time statistics snapshot.
    Statistics(oneshot::Sender<Vec<Statistic>>),
    /// Current completion estimate of a request.
    Estimate(RequestId, oneshot::Sender<Option<Instant>>),
    /// Cancel everything and stop.
    Shutdown,
}

/// Drives the layer chain.
pub struct Scheduler {
    ctx: StreamerContext,
    stack: Option<Box<dyn StreamStackEntry>>,
    ordering: Box<dyn RequestOrdering>,
    config: SchedulerConfig,
    last_estimate: Option<Instant>,
    stats: SchedulerStats,
}

impl Scheduler {
    /// Creates a scheduler over `stack`, which may be empty.
    pub fn new(
        ctx: StreamerContext,
        stack: Option<Box<dyn StreamStackEntry>>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            ctx,
            stack,
            ordering: config.ordering(),
            config,
            last_estimate: None,
            stats: SchedulerStats::default(),
        }
    }

    /// Replaces the dispatch ordering.
    pub fn with_ordering(mut self, ordering: Box<dyn RequestOrdering>) -> Self {
        self.ordering = ordering;
        self
    }

    /// The context.
    pub fn context(&self) -> &StreamerContext {
        &self.ctx
    }

    /// Counter snapshot.
    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// Accepts a request into the external queue.
    pub fn submit(&mut self, request: FileRequest) -> RequestId {
        self.ctx.submit(request)
    }

    /// Returns true while any request is tracked.
    pub fn has_work(&self) -> bool {
        !self.ctx.is_empty()
    }

    /// Runs one scheduling pass. Returns true if anything happened.
    pub fn tick(&mut self) -> bool {
        let now = Instant::now();
        self.stats.ticks += 1;

        let mut progressed = self.process_cancellations();
        self.ctx.sort_external(self.ordering.as_ref(), now);
        progressed |= self.dispatch_ready();

        if let Some(head) = self.stack.as_deref_mut() {
            progressed |= head.execute_requests(&mut self.ctx);
        }

        let due = self
            .last_estimate
            .map_or(true, |last| now.saturating_duration_since(last) >= self.config.estimate_interval());
        if due {
            self.refresh_estimates(now);
        }
        progressed
    }

    fn available_slots(&self) -> usize {
        self.stack
            .as_deref()
            .map_or(usize::MAX, |head| head.available_request_slots())
    }

    fn dispatch_ready(&mut self) -> bool {
        let mut dispatched = 0;
        while dispatched < self.config.max_dispatch_per_tick {
            let Some(id) = self.ctx.peek_external() else {
                break;
            };
            let needs_slot = self.ctx.request(id).is_some_and(|r| {
                matches!(
                    r.command(),
                    RequestCommand::Read { .. } | RequestCommand::GetFileSize { .. }
                )
            });
            if needs_slot && self.available_slots() == 0 {
                self.stats.backpressure_stalls += 1;
                break;
            }
            self.ctx.mark_dispatched(id);
            self.dispatch(id);
            dispatched += 1;
        }
        self.stats.dispatched += dispatched as u64;
        dispatched > 0
    }

    fn dispatch(&mut self, id: RequestId) {
        let Some(command) = self.ctx.request(id).map(|r| r.command().clone()) else {
            return;
        };
        debug!(request = %id, kind = command.kind(), "dispatching");

        let ctx = &mut self.ctx;
        let Some(head) = self.stack.as_deref_mut() else {
            match command {
                RequestCommand::Read { .. } | RequestCommand::GetFileSize { .. } => ctx.fail(
                    id,
                    StreamError::ChainTermination {
                        layer: "scheduler".to_string(),
                    },
                ),
                _ => ctx.mark_request_as_completed(id, RequestStatus::Completed),
            }
            return;
        };

        match command {
            RequestCommand::Read { .. } | RequestCommand::GetFileSize { .. } => {
                head.prepare_request(ctx, id)
            }
            RequestCommand::FlushCache { path } => {
                head.flush_cache(&path);
                ctx.mark_request_as_completed(id, RequestStatus::Completed);
            }
            RequestCommand::FlushEntireCache => {
                head.flush_entire_cache();
                ctx.mark_request_as_completed(id, RequestStatus::Completed);
            }
            RequestCommand::CreateDedicatedCache { path, range } => {
                match head.create_dedicated_cache(ctx, id, &path, range) {
                    Ok(()) => {
                        // Completes with its load when the region has to be read first.
                        let idle = ctx
                            .request(id)
                            .is_some_and(|r| !r.status().is_terminal() && r.pending_children() == 0);
                        if idle {
                            ctx.mark_request_as_completed(id, RequestStatus::Completed);
                        }
                    }
                    Err(err) => ctx.fail(id, err),
                }
            }
            RequestCommand::DestroyDedicatedCache { path, range } => {
                head.destroy_dedicated_cache(&path, range);
                ctx.mark_request_as_completed(id, RequestStatus::Completed);
            }
            RequestCommand::Cancel { target } => {
                self.cancel(target);
                self.ctx
                    .mark_request_as_completed(id, RequestStatus::Completed);
            }
        }
    }

    fn process_cancellations(&mut self) -> bool {
        let cancels = self
            .ctx
            .take_external_where(|r| matches!(r.command(), RequestCommand::Cancel { .. }));
        let progressed = !cancels.is_empty();
        for id in cancels {
            if let Some(RequestCommand::Cancel { target }) =
                self.ctx.request(id).map(|r| r.command().clone())
            {
                self.cancel(target);
            }
            self.ctx.mark_request_as_completed(id, RequestStatus::Completed);
        }
        progressed
    }

    /// Cancels `target`. Queued requests are dropped without involving the
    /// chain; dispatched ones are canceled cooperatively, descendants first.
    /// Returns true if anything was canceled.
    pub fn cancel(&mut self, target: RequestId) -> bool {
        self.stats.cancels_requested += 1;
        let status = match self.ctx.request(target) {
            Some(request) if !request.status().is_terminal() => request.status(),
            _ => {
                debug!(request = %target, "cancel of finished request ignored");
                return false;
            }
        };

        if status != RequestStatus::InProgress {
            self.ctx
                .mark_request_as_completed(target, RequestStatus::Canceled);
            self.stats.cancels_applied += 1;
            debug!(request = %target, "canceled queued request");
            return true;
        }

        let Some(head) = self.stack.as_deref_mut() else {
            return false;
        };
        let mut canceled = false;
        for id in self.ctx.descendants_of(target) {
            if self.ctx.is_live(id) {
                canceled |= head.cancel_request(&mut self.ctx, id);
            }
        }
        if self.ctx.is_live(target) {
            canceled |= head.cancel_request(&mut self.ctx, target);
        }
        if canceled {
            self.stats.cancels_applied += 1;
        }
        debug!(request = %target, canceled, "cooperative cancel");
        canceled
    }

    fn refresh_estimates(&mut self, now: Instant) {
        self.last_estimate = Some(now);
        let Some(head) = self.stack.as_deref_mut() else {
            return;
        };
        let external = self.ctx.external_pending();
        let mut internal = self.ctx.internal_pending();
        head.update_completion_estimates(&mut self.ctx, now, &mut internal, &external);
        self.stats.estimate_refreshes += 1;
    }

    /// Latest completion estimate of a live request.
    pub fn estimated_completion(&self, id: RequestId) -> Option<Instant> {
        self.ctx.request(id).and_then(|r| r.estimated_completion())
    }

    /// Statistics of the scheduler, the context and every layer, in chain order.
    pub fn collect_statistics(&self) -> Vec<Statistic> {
        let mut out = Vec::new();
        self.ctx.collect_statistics(&mut out);
        out.push(Statistic::counter("scheduler", "ticks", self.stats.ticks));
        out.push(Statistic::counter("scheduler", "dispatched", self.stats.dispatched));
        out.push(Statistic::counter(
            "scheduler",
            "backpressure_stalls",
            self.stats.backpressure_stalls,
        ));
        out.push(Statistic::counter(
            "scheduler",
            "cancels_applied",
            self.stats.cancels_applied,
        ));
        if let Some(head) = self.stack.as_deref() {
            head.collect_statistics(&mut out);
        }
        out
    }

    /// Cancels every outstanding request and drops the chain.
    pub fn shutdown(&mut self) {
        let outstanding = self.ctx.len();
        self.ctx.cancel_all();
        self.stack = None;
        info!(outstanding, "scheduler shut down");
    }

    fn handle_message(&mut self, message: SchedulerMessage) -> bool {
        match message {
            SchedulerMessage::Submit(request) => {
                self.ctx.submit(*request);
            }
            SchedulerMessage::Statistics(reply) => {
                // The caller may have given up waiting.
                let _ = reply.send(self.collect_statistics());
            }
            SchedulerMessage::Estimate(id, reply) => {
                let _ = reply.send(self.estimated_completion(id));
            }
            SchedulerMessage::Shutdown => return false,
        }
        true
    }

    /// Runs until a shutdown message arrives or every sender is dropped.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SchedulerMessage>) {
        let waker = self.ctx.waker();
        info!(layers = ?layer_names(self.stack.as_deref()), "scheduler started");

        loop {
            loop {
                match rx.try_recv() {
                    Ok(message) => {
                        if !self.handle_message(message) {
                            self.shutdown();
                            return;
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        warn!("all streamer handles dropped");
                        self.shutdown();
                        return;
                    }
                }
            }

            if self.tick() {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                message = rx.recv() => match message {
                    Some(message) => {
                        if !self.handle_message(message) {
                            self.shutdown();
                            return;
                        }
                    }
                    None => {
                        warn!("all streamer handles dropped");
                        self.shutdown();
                        return;
                    }
                },
                _ = waker.notified() => {}
                _ = tokio::time::sleep(self.config.idle_wait()) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheLayer, CacheLayerConfig};
    use crate::path::RequestPath;
    use crate::request::{ByteRange, ReadBuffer, RequestCompletion};
    use crate::test_support::{StubCounters, StubDevice};

    const PATH: &str = "/data/a.bin";

    fn read_request(
        ctx_ids: &StreamerContext,
        range: ByteRange,
    ) -> (FileRequest, oneshot::Receiver<RequestCompletion>) {
        let id = ctx_ids.next_request_id();
        let mut request = FileRequest::read(
            id,
            RequestPath::from_absolute(PATH),
            range,
            ReadBuffer::new(),
        );
        let rx = request.subscribe();
        (request, rx)
    }

    fn command(
        scheduler: &mut Scheduler,
        command: RequestCommand,
    ) -> (RequestId, oneshot::Receiver<RequestCompletion>) {
        let mut request = FileRequest::new(scheduler.context().next_request_id(), command);
        let rx = request.subscribe();
        (scheduler.submit(request), rx)
    }

    fn read(
        scheduler: &mut Scheduler,
        range: ByteRange,
    ) -> (RequestId, oneshot::Receiver<RequestCompletion>) {
        let (request, rx) = read_request(scheduler.context(), range);
        (scheduler.submit(request), rx)
    }

    fn with_device() -> (Scheduler, StubCounters) {
        let device = StubDevice::new().with_file(PATH, vec![3u8; 1024]);
        let counters = device.counters();
        let scheduler = Scheduler::new(
            StreamerContext::new(),
            Some(Box::new(device)),
            SchedulerConfig::default(),
        );
        (scheduler, counters)
    }

    fn with_cache() -> (Scheduler, StubCounters) {
        let device = StubDevice::new().with_file(PATH, vec![3u8; 1024]);
        let counters = device.counters();
        let mut cache = CacheLayer::new("cache", CacheLayerConfig::default());
        cache.link_mut().set_next(Some(Box::new(device)));
        let scheduler = Scheduler::new(
            StreamerContext::new(),
            Some(Box::new(cache)),
            SchedulerConfig::default(),
        );
        (scheduler, counters)
    }

    fn run_ticks(scheduler: &mut Scheduler) {
        for _ in 0..16 {
            if !scheduler.tick() {
                break;
            }
        }
    }

    #[test]
    fn test_deadline_ordering_priority_then_fifo() {
        let ctx = StreamerContext::new();
        let ordering = DeadlineAwareOrdering::default();
        let now = Instant::now();
        let (low, _) = read_request(&ctx, ByteRange::new(0, 1));
        let low = low.with_priority(RequestPriority::Low);
        let (critical, _) = read_request(&ctx, ByteRange::new(0, 1));
        let critical = critical.with_priority(RequestPriority::Critical);
        let (normal_a, _) = read_request(&ctx, ByteRange::new(0, 1));
        let (normal_b, _) = read_request(&ctx, ByteRange::new(0, 1));

        assert_eq!(ordering.compare(&critical, &low, now), Ordering::Less);
        assert_eq!(ordering.compare(&normal_a, &normal_b, now), Ordering::Less);
        assert_eq!(ordering.compare(&low, &normal_a, now), Ordering::Greater);
    }

    #[test]
    fn test_urgent_deadline_jumps_priority() {
        let ctx = StreamerContext::new();
        let ordering = DeadlineAwareOrdering::default();
        let now = Instant::now();
        let (urgent, _) = read_request(&ctx, ByteRange::new(0, 1));
        let urgent = urgent
            .with_priority(RequestPriority::Low)
            .with_deadline(Some(now + Duration::from_millis(10)));
        let (high, _) = read_request(&ctx, ByteRange::new(0, 1));
        let high = high
            .with_priority(RequestPriority::High)
            .with_deadline(Some(now + Duration::from_secs(10)));

        assert!(ordering.is_urgent(&urgent, now));
        assert!(!ordering.is_urgent(&high, now));
        assert_eq!(ordering.compare(&urgent, &high, now), Ordering::Less);
    }

    #[test]
    fn test_overshooting_estimate_is_urgent() {
        let ctx = StreamerContext::new();
        let ordering = DeadlineAwareOrdering::default();
        let now = Instant::now();
        let (mut request, _) = read_request(&ctx, ByteRange::new(0, 1));
        request = request.with_deadline(Some(now + Duration::from_secs(1)));
        assert!(!ordering.is_urgent(&request, now));
        request.estimated_completion = Some(now + Duration::from_secs(2));
        assert!(ordering.is_urgent(&request, now));
    }

    #[test]
    fn test_starved_request_promoted() {
        let ctx = StreamerContext::new();
        let ordering = DeadlineAwareOrdering::default();
        let (low, _) = read_request(&ctx, ByteRange::new(0, 1));
        let low = low.with_priority(RequestPriority::Low);
        let later = low.submitted_at() + Duration::from_millis(150);
        assert_eq!(ordering.effective_priority(&low, later), RequestPriority::Normal);
        assert_eq!(
            ordering.effective_priority(&low, low.submitted_at()),
            RequestPriority::Low
        );
    }

    #[test]
    fn test_fifo_ordering() {
        let ctx = StreamerContext::new();
        let (a, _) = read_request(&ctx, ByteRange::new(0, 1));
        let (b, _) = read_request(&ctx, ByteRange::new(0, 1));
        let b = b.with_priority(RequestPriority::Critical);
        assert_eq!(FifoOrdering.compare(&a, &b, Instant::now()), Ordering::Less);
    }

    #[test]
    fn test_empty_chain_fails_reads_in_one_tick() {
        let mut scheduler =
            Scheduler::new(StreamerContext::new(), None, SchedulerConfig::default());
        let (_, mut read_rx) = read(&mut scheduler, ByteRange::new(0, 100));
        let (_, mut size_rx) = command(
            &mut scheduler,
            RequestCommand::GetFileSize {
                path: RequestPath::from_absolute(PATH),
            },
        );
        let path = RequestPath::from_absolute(PATH);
        let management = [
            RequestCommand::FlushCache { path: path.clone() },
            RequestCommand::FlushEntireCache,
            RequestCommand::CreateDedicatedCache {
                path: path.clone(),
                range: ByteRange::new(0, 10),
            },
            RequestCommand::DestroyDedicatedCache {
                path,
                range: ByteRange::new(0, 10),
            },
        ];
        let mut management_rx: Vec<_> = management
            .into_iter()
            .map(|c| command(&mut scheduler, c).1)
            .collect();

        scheduler.tick();

        let read = read_rx.try_recv().unwrap();
        assert_eq!(read.status, RequestStatus::Failed);
        assert!(matches!(read.failure, Some(StreamError::ChainTermination { .. })));
        assert_eq!(size_rx.try_recv().unwrap().status, RequestStatus::Failed);
        for rx in &mut management_rx {
            assert_eq!(rx.try_recv().unwrap().status, RequestStatus::Completed);
        }
        assert!(!scheduler.has_work());
    }

    #[test]
    fn test_reads_complete_through_device() {
        let (mut scheduler, counters) = with_device();
        let receivers: Vec<_> = (0..5)
            .map(|i| read(&mut scheduler, ByteRange::new(i * 100, 100)).1)
            .collect();
        run_ticks(&mut scheduler);

        for mut rx in receivers {
            let completion = rx.try_recv().unwrap();
            assert_eq!(completion.status, RequestStatus::Completed);
            assert_eq!(completion.bytes_delivered, 100);
        }
        assert_eq!(counters.reads(), 5);
        assert!(!scheduler.has_work());
    }

    #[test]
    fn test_dispatch_stops_when_slots_run_out() {
        let (mut scheduler, counters) = with_device();
        counters.set_paused(true);
        for _ in 0..StubDevice::SLOTS + 2 {
            read(&mut scheduler, ByteRange::new(0, 1));
        }
        scheduler.tick();

        assert_eq!(counters.prepared(), StubDevice::SLOTS);
        assert_eq!(scheduler.context().external_pending().len(), 2);
        assert_eq!(scheduler.stats().backpressure_stalls, 1);

        counters.set_paused(false);
        run_ticks(&mut scheduler);
        assert_eq!(counters.prepared(), StubDevice::SLOTS + 2);
        assert!(!scheduler.has_work());
    }

    #[test]
    fn test_cancel_queued_skips_layers() {
        let (mut scheduler, counters) = with_device();
        let (target, mut rx) = read(&mut scheduler, ByteRange::new(0, 10));
        let (_, mut cancel_rx) = command(&mut scheduler, RequestCommand::Cancel { target });
        scheduler.tick();

        assert_eq!(rx.try_recv().unwrap().status, RequestStatus::Canceled);
        assert_eq!(cancel_rx.try_recv().unwrap().status, RequestStatus::Completed);
        assert_eq!(counters.prepared(), 0);
    }

    #[test]
    fn test_cancel_dispatched_is_cooperative() {
        let (mut scheduler, counters) = with_device();
        counters.set_paused(true);
        let (target, mut rx) = read(&mut scheduler, ByteRange::new(0, 10));
        scheduler.tick();
        assert!(scheduler.cancel(target));
        assert_eq!(rx.try_recv().unwrap().status, RequestStatus::Canceled);
        assert_eq!(counters.canceled(), 1);
        assert!(!scheduler.cancel(target));
    }

    #[test]
    fn test_cancel_split_read_cancels_children() {
        let (mut scheduler, counters) = with_cache();
        counters.set_paused(true);
        let (target, mut rx) = read(&mut scheduler, ByteRange::new(0, 10));
        scheduler.tick();
        assert_eq!(counters.prepared(), 1);

        assert!(scheduler.cancel(target));
        run_ticks(&mut scheduler);
        assert_eq!(rx.try_recv().unwrap().status, RequestStatus::Canceled);
        assert!(!scheduler.has_work());
    }

    #[test]
    fn test_cache_round_trip_through_scheduler() {
        let (mut scheduler, counters) = with_cache();
        let (_, mut first) = read(&mut scheduler, ByteRange::new(0, 100));
        run_ticks(&mut scheduler);
        assert_eq!(first.try_recv().unwrap().status, RequestStatus::Completed);

        let (_, mut second) = read(&mut scheduler, ByteRange::new(0, 100));
        run_ticks(&mut scheduler);
        assert_eq!(second.try_recv().unwrap().status, RequestStatus::Completed);
        assert_eq!(counters.reads(), 1);

        let stats = scheduler.collect_statistics();
        let hits = crate::statistics::find(&stats, "cache", "hits").unwrap();
        assert_eq!(hits.value.as_f64(), 1.0);
    }

    #[test]
    fn test_dedicated_reservation_error_reaches_caller() {
        let device = StubDevice::new().with_file(PATH, vec![0u8; 4096]);
        let mut cache = CacheLayer::new(
            "cache",
            CacheLayerConfig {
                dedicated_budget_bytes: 100,
                ..CacheLayerConfig::default()
            },
        );
        cache.link_mut().set_next(Some(Box::new(device)));
        let mut scheduler = Scheduler::new(
            StreamerContext::new(),
            Some(Box::new(cache)),
            SchedulerConfig::default(),
        );

        let (_, mut rx) = command(
            &mut scheduler,
            RequestCommand::CreateDedicatedCache {
                path: RequestPath::from_absolute(PATH),
                range: ByteRange::new(0, 1000),
            },
        );
        scheduler.tick();
        let err = rx.try_recv().unwrap().into_result().unwrap_err();
        assert!(matches!(err, StreamError::CacheReservation { .. }));
    }

    #[test]
    fn test_get_file_size_through_chain() {
        let (mut scheduler, _) = with_cache();
        let (_, mut rx) = command(
            &mut scheduler,
            RequestCommand::GetFileSize {
                path: RequestPath::from_absolute(PATH),
            },
        );
        scheduler.tick();
        assert_eq!(rx.try_recv().unwrap().file_size, Some(1024));
    }

    #[test]
    fn test_shutdown_cancels_outstanding() {
        let (mut scheduler, counters) = with_device();
        counters.set_paused(true);
        let (_, mut dispatched) = read(&mut scheduler, ByteRange::new(0, 10));
        scheduler.tick();
        let (_, mut queued) = read(&mut scheduler, ByteRange::new(0, 10));

        scheduler.shutdown();
        assert_eq!(dispatched.try_recv().unwrap().status, RequestStatus::Canceled);
        assert_eq!(queued.try_recv().unwrap().status, RequestStatus::Canceled);
        assert!(!scheduler.has_work());
    }
}
