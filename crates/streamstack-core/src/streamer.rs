//! Public handle to a running stream stack.
//!
//! A [`Streamer`] owns the sending side of the scheduler's message channel.
//! Every operation builds a request on the caller's side, resolving its path
//! first, and returns a [`RequestHandle`] immediately; the handle's
//! [`wait`](RequestHandle::wait) future resolves when the pipeline completes
//! the request.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::StreamerConfig;
use crate::context::StreamerContext;
use crate::error::{StreamError, StreamResult};
use crate::io_backend::IoBackend;
use crate::layer::StreamStackEntry;
use crate::path::{PathResolver, RequestPath};
use crate::request::{
    ByteRange, FileRequest, ReadBuffer, RequestCommand, RequestCompletion, RequestId,
    RequestIdGen, RequestPriority,
};
use crate::scheduler::{Scheduler, SchedulerConfig, SchedulerMessage};
use crate::stack::build_stack;
use crate::statistics::Statistic;

/// Per-request scheduling hints.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    /// Dispatch priority.
    pub priority: RequestPriority,
    /// Advisory deadline used for urgency boosting.
    pub deadline: Option<Instant>,
}

impl RequestOptions {
    /// Options with the given priority and no deadline.
    pub fn with_priority(priority: RequestPriority) -> Self {
        Self {
            priority,
            deadline: None,
        }
    }
}

/// Awaitable completion of a submitted request.
#[derive(Debug)]
pub struct RequestHandle {
    id: RequestId,
    receiver: oneshot::Receiver<RequestCompletion>,
}

impl RequestHandle {
    /// The id of the request, usable with [`Streamer::cancel`].
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Waits for the completion record, whatever its status.
    pub async fn completion(self) -> StreamResult<RequestCompletion> {
        self.receiver.await.map_err(|_| StreamError::ShutDown)
    }

    /// Waits for completion; failures and cancellations become errors.
    pub async fn wait(self) -> StreamResult<RequestCompletion> {
        self.completion().await?.into_result()
    }
}

/// Client handle to the scheduler task.
pub struct Streamer {
    tx: mpsc::UnboundedSender<SchedulerMessage>,
    ids: Arc<RequestIdGen>,
    resolver: Arc<dyn PathResolver>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Streamer {
    /// Spawns the scheduler task over `stack` on the current runtime.
    pub fn start(
        stack: Option<Box<dyn StreamStackEntry>>,
        config: SchedulerConfig,
        resolver: Arc<dyn PathResolver>,
    ) -> StreamResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| StreamError::Config(format!("no tokio runtime: {}", e)))?;
        let ids = Arc::new(RequestIdGen::new());
        let ctx = StreamerContext::with_shared(ids.clone(), Arc::new(Notify::new()));
        let scheduler = Scheduler::new(ctx, stack, config);

        let (tx, rx) = mpsc::unbounded_channel();
        let task = runtime.spawn(scheduler.run(rx));
        Ok(Self {
            tx,
            ids,
            resolver,
            task: Mutex::new(Some(task)),
        })
    }

    /// Validates `config`, builds the configured chain over `backend`, and starts it.
    pub fn from_config<B: IoBackend>(config: &StreamerConfig, backend: Arc<B>) -> StreamResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| StreamError::Config(format!("no tokio runtime: {}", e)))?;
        let resolver = Arc::new(config.resolver());
        let stack = build_stack(config, backend, runtime, resolver.as_ref())?;
        info!(aliases = config.aliases.len(), "starting streamer");
        Self::start(stack, config.scheduler.clone(), resolver)
    }

    /// Resolves `path` into its canonical form.
    pub fn resolve(&self, path: &str) -> StreamResult<RequestPath> {
        RequestPath::parse(path, self.resolver.as_ref())
    }

    fn send(&self, message: SchedulerMessage) -> StreamResult<()> {
        self.tx.send(message).map_err(|_| StreamError::ShutDown)
    }

    fn submit(&self, mut request: FileRequest) -> StreamResult<RequestHandle> {
        let id = request.id();
        let receiver = request.subscribe();
        debug!(request = %id, kind = request.command().kind(), "submitting");
        self.send(SchedulerMessage::Submit(Box::new(request)))?;
        Ok(RequestHandle { id, receiver })
    }

    fn submit_command(
        &self,
        command: RequestCommand,
        options: RequestOptions,
    ) -> StreamResult<RequestHandle> {
        let request = FileRequest::new(self.ids.next_id(), command)
            .with_priority(options.priority)
            .with_deadline(options.deadline);
        self.submit(request)
    }

    /// Reads `range` of `path` into `buffer`.
    pub fn read(
        &self,
        path: &str,
        range: ByteRange,
        buffer: ReadBuffer,
        options: RequestOptions,
    ) -> StreamResult<RequestHandle> {
        let path = self.resolve(path)?;
        let request = FileRequest::read(self.ids.next_id(), path, range, buffer)
            .with_priority(options.priority)
            .with_deadline(options.deadline);
        self.submit(request)
    }

    /// Reads `range` of `path` and returns the bytes.
    pub async fn read_to_vec(&self, path: &str, range: ByteRange) -> StreamResult<Vec<u8>> {
        let buffer = ReadBuffer::new();
        self.read(path, range, buffer.clone(), RequestOptions::default())?
            .wait()
            .await?;
        Ok(buffer.to_vec())
    }

    /// Queries the size of `path`; the completion carries it in `file_size`.
    pub fn get_file_size(&self, path: &str) -> StreamResult<RequestHandle> {
        let path = self.resolve(path)?;
        self.submit_command(RequestCommand::GetFileSize { path }, RequestOptions::default())
    }

    /// Drops cached data for `path`.
    pub fn flush_cache(&self, path: &str) -> StreamResult<RequestHandle> {
        let path = self.resolve(path)?;
        self.submit_command(RequestCommand::FlushCache { path }, RequestOptions::default())
    }

    /// Drops all shared cached data.
    pub fn flush_entire_cache(&self) -> StreamResult<RequestHandle> {
        self.submit_command(RequestCommand::FlushEntireCache, RequestOptions::default())
    }

    /// Pins `range` of `path` in a dedicated region that survives flushes.
    pub fn create_dedicated_cache(&self, path: &str, range: ByteRange) -> StreamResult<RequestHandle> {
        let path = self.resolve(path)?;
        self.submit_command(
            RequestCommand::CreateDedicatedCache { path, range },
            RequestOptions::default(),
        )
    }

    /// Releases one reference to a dedicated region.
    pub fn destroy_dedicated_cache(&self, path: &str, range: ByteRange) -> StreamResult<RequestHandle> {
        let path = self.resolve(path)?;
        self.submit_command(
            RequestCommand::DestroyDedicatedCache { path, range },
            RequestOptions::default(),
        )
    }

    /// Asks the scheduler to cancel `target`.
    pub fn cancel(&self, target: RequestId) -> StreamResult<RequestHandle> {
        self.submit_command(
            RequestCommand::Cancel { target },
            RequestOptions::with_priority(RequestPriority::Critical),
        )
    }

    /// Snapshot of scheduler and layer statistics.
    pub async fn collect_statistics(&self) -> StreamResult<Vec<Statistic>> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerMessage::Statistics(reply))?;
        rx.await.map_err(|_| StreamError::ShutDown)
    }

    /// Current completion estimate of a pending request.
    pub async fn estimated_completion(&self, id: RequestId) -> StreamResult<Option<Instant>> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerMessage::Estimate(id, reply))?;
        rx.await.map_err(|_| StreamError::ShutDown)
    }

    /// Cancels outstanding work and waits for the scheduler task to exit.
    pub async fn shutdown(&self) {
        // Already stopped if the channel is closed.
        let _ = self.tx.send(SchedulerMessage::Shutdown);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "scheduler task ended abnormally");
            }
        }
    }
}
