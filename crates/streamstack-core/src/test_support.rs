//! Synchronous stand-in layers for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::context::StreamerContext;
use crate::error::{StreamError, StreamResult};
use crate::layer::{LayerLink, StreamStackEntry};
use crate::path::RequestPath;
use crate::request::{RequestCommand, RequestId, RequestStatus};

/// Layer that overrides nothing.
pub struct PassThrough {
    link: LayerLink,
}

impl PassThrough {
    pub fn new(name: &str) -> Self {
        Self {
            link: LayerLink::new(name),
        }
    }
}

impl StreamStackEntry for PassThrough {
    fn link(&self) -> &LayerLink {
        &self.link
    }

    fn link_mut(&mut self) -> &mut LayerLink {
        &mut self.link
    }
}

/// Shared view of a [`StubDevice`]'s activity.
#[derive(Clone, Default)]
pub struct StubCounters {
    prepared: Arc<AtomicUsize>,
    reads: Arc<AtomicUsize>,
    canceled: Arc<AtomicUsize>,
    paused: Arc<AtomicBool>,
}

impl StubCounters {
    pub fn prepared(&self) -> usize {
        self.prepared.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn canceled(&self) -> usize {
        self.canceled.load(Ordering::SeqCst)
    }

    /// While paused the device accepts requests but completes none.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }
}

/// Terminal layer serving in-memory files and sizes synchronously from `execute_requests`.
pub struct StubDevice {
    link: LayerLink,
    files: HashMap<String, Vec<u8>>,
    queued: VecDeque<RequestId>,
    counters: StubCounters,
    size_hints: bool,
}

impl StubDevice {
    pub const SLOTS: usize = 8;

    pub fn new() -> Self {
        Self {
            link: LayerLink::new("stub-device"),
            files: HashMap::new(),
            queued: VecDeque::new(),
            counters: StubCounters::default(),
            size_hints: true,
        }
    }

    /// Makes `get_file_size` report unknown sizes, like a device that has
    /// not answered a size query yet.
    pub fn without_size_hints(mut self) -> Self {
        self.size_hints = false;
        self
    }

    pub fn with_file(mut self, path: &str, data: Vec<u8>) -> Self {
        self.files.insert(path.to_string(), data);
        self
    }

    pub fn counters(&self) -> StubCounters {
        self.counters.clone()
    }

    fn file(&self, path: &RequestPath) -> StreamResult<&Vec<u8>> {
        self.files
            .get(path.absolute_path())
            .ok_or_else(|| StreamError::NotFound {
                path: path.absolute_path().to_string(),
            })
    }

    fn serve(&self, ctx: &mut StreamerContext, id: RequestId) -> StreamResult<u64> {
        let Some(request) = ctx.request(id) else {
            return Ok(0);
        };
        match request.command() {
            RequestCommand::Read {
                path,
                range,
                buffer,
                buffer_offset,
            } => {
                let data = self.file(path)?;
                let (offset, length) = range.resolve(data.len() as u64)?;
                let start = offset as usize;
                buffer.write_at(*buffer_offset, &data[start..start + length as usize])?;
                Ok(length)
            }
            _ => Ok(0),
        }
    }
}

impl StreamStackEntry for StubDevice {
    fn link(&self) -> &LayerLink {
        &self.link
    }

    fn link_mut(&mut self) -> &mut LayerLink {
        &mut self.link
    }

    fn is_terminal(&self) -> bool {
        true
    }

    fn prepare_request(&mut self, _ctx: &mut StreamerContext, id: RequestId) {
        self.counters.prepared.fetch_add(1, Ordering::SeqCst);
        self.queued.push_back(id);
    }

    fn execute_requests(&mut self, ctx: &mut StreamerContext) -> bool {
        if self.counters.paused.load(Ordering::SeqCst) || self.queued.is_empty() {
            return false;
        }
        while let Some(id) = self.queued.pop_front() {
            if let Some(RequestCommand::GetFileSize { path }) = ctx.request(id).map(|r| r.command()) {
                match self.file(path).map(|data| data.len() as u64) {
                    Ok(size) => {
                        ctx.set_file_size(id, size);
                        ctx.mark_request_as_completed(id, RequestStatus::Completed);
                    }
                    Err(err) => ctx.fail(id, err),
                }
                continue;
            }
            self.counters.reads.fetch_add(1, Ordering::SeqCst);
            match self.serve(ctx, id) {
                Ok(bytes) => {
                    ctx.add_bytes_delivered(id, bytes);
                    ctx.mark_request_as_completed(id, RequestStatus::Completed);
                }
                Err(err) => ctx.fail(id, err),
            }
        }
        true
    }

    fn available_request_slots(&self) -> usize {
        Self::SLOTS.saturating_sub(self.queued.len())
    }

    fn get_file_size(&self, path: &RequestPath) -> StreamResult<u64> {
        if !self.size_hints {
            return Err(StreamError::SizeUnknown {
                path: path.absolute_path().to_string(),
            });
        }
        self.file(path).map(|data| data.len() as u64)
    }

    fn flush_cache(&mut self, _path: &RequestPath) {}

    fn flush_entire_cache(&mut self) {}

    fn create_dedicated_cache(
        &mut self,
        _ctx: &mut StreamerContext,
        _id: RequestId,
        _path: &RequestPath,
        _range: crate::request::ByteRange,
    ) -> StreamResult<()> {
        Ok(())
    }

    fn destroy_dedicated_cache(&mut self, _path: &RequestPath, _range: crate::request::ByteRange) {}

    fn collect_statistics(&self, _out: &mut Vec<crate::statistics::Statistic>) {}

    fn cancel_request(&mut self, ctx: &mut StreamerContext, id: RequestId) -> bool {
        match self.queued.iter().position(|q| *q == id) {
            Some(pos) => {
                self.queued.remove(pos);
                self.counters.canceled.fetch_add(1, Ordering::SeqCst);
                ctx.mark_request_as_completed(id, RequestStatus::Canceled);
                true
            }
            None => false,
        }
    }
}

/// Runs `execute_requests` until the stack reports no more progress.
pub fn drive(stack: &mut dyn StreamStackEntry, ctx: &mut StreamerContext) {
    for _ in 0..64 {
        if !stack.execute_requests(ctx) {
            break;
        }
    }
}

/// Like [`drive`], but also waits on the context's waker for background
/// work until the context is empty.
pub async fn drive_until_idle(stack: &mut dyn StreamStackEntry, ctx: &mut StreamerContext) {
    let waker = ctx.waker();
    for _ in 0..200 {
        drive(stack, ctx);
        if ctx.is_empty() {
            return;
        }
        let _ = tokio::time::timeout(Duration::from_millis(20), waker.notified()).await;
    }
}
