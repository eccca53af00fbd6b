//! The layer protocol shared by every node of the stream stack.
//!
//! A stack is a singly linked chain of [`StreamStackEntry`] values. Each
//! layer embeds a [`LayerLink`] that owns its successor; the trait's default
//! methods forward through that link, so a concrete layer only overrides the
//! calls it cares about. When there is no successor the link applies the
//! terminal defaults: work (`prepare_request`, `get_file_size`) fails with
//! [`StreamError::ChainTermination`], management calls succeed as no-ops.

use std::time::Instant;

use crate::context::StreamerContext;
use crate::error::{StreamError, StreamResult};
use crate::path::RequestPath;
use crate::request::{ByteRange, RequestId};
use crate::statistics::Statistic;

/// Name and successor of a layer, with the forwarding behaviour of the protocol.
pub struct LayerLink {
    name: String,
    next: Option<Box<dyn StreamStackEntry>>,
}

impl LayerLink {
    /// Creates a link with no successor.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            next: None,
        }
    }

    /// Layer name used in logs, errors and statistics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The successor, if any.
    pub fn next(&self) -> Option<&dyn StreamStackEntry> {
        self.next.as_deref()
    }

    /// The successor, mutably.
    pub fn next_mut(&mut self) -> Option<&mut (dyn StreamStackEntry + 'static)> {
        self.next.as_deref_mut()
    }

    /// Installs the successor, returning the previous one.
    pub fn set_next(
        &mut self,
        next: Option<Box<dyn StreamStackEntry>>,
    ) -> Option<Box<dyn StreamStackEntry>> {
        std::mem::replace(&mut self.next, next)
    }

    /// Returns true if a successor is attached.
    pub fn has_next(&self) -> bool {
        self.next.is_some()
    }

    /// Forwards `prepare_request`, failing the request at the end of the chain.
    pub fn prepare_request(&mut self, ctx: &mut StreamerContext, id: RequestId) {
        match self.next.as_deref_mut() {
            Some(next) => next.prepare_request(ctx, id),
            None => ctx.fail(
                id,
                StreamError::ChainTermination {
                    layer: self.name.clone(),
                },
            ),
        }
    }

    /// Forwards `execute_requests`.
    pub fn execute_requests(&mut self, ctx: &mut StreamerContext) -> bool {
        self.next
            .as_deref_mut()
            .is_some_and(|next| next.execute_requests(ctx))
    }

    /// Forwards `available_request_slots`; unlimited at the end of the chain.
    pub fn available_request_slots(&self) -> usize {
        self.next
            .as_deref()
            .map_or(usize::MAX, |next| next.available_request_slots())
    }

    /// Forwards `update_completion_estimates`.
    pub fn update_completion_estimates(
        &mut self,
        ctx: &mut StreamerContext,
        now: Instant,
        internal_pending: &mut Vec<RequestId>,
        external_pending: &[RequestId],
    ) {
        if let Some(next) = self.next.as_deref_mut() {
            next.update_completion_estimates(ctx, now, internal_pending, external_pending);
        }
    }

    /// Forwards `get_file_size`, failing at the end of the chain.
    pub fn get_file_size(&self, path: &RequestPath) -> StreamResult<u64> {
        match self.next.as_deref() {
            Some(next) => next.get_file_size(path),
            None => Err(StreamError::ChainTermination {
                layer: self.name.clone(),
            }),
        }
    }

    /// Forwards `flush_cache`.
    pub fn flush_cache(&mut self, path: &RequestPath) {
        if let Some(next) = self.next.as_deref_mut() {
            next.flush_cache(path);
        }
    }

    /// Forwards `flush_entire_cache`.
    pub fn flush_entire_cache(&mut self) {
        if let Some(next) = self.next.as_deref_mut() {
            next.flush_entire_cache();
        }
    }

    /// Forwards `create_dedicated_cache`; succeeds at the end of the chain.
    pub fn create_dedicated_cache(
        &mut self,
        ctx: &mut StreamerContext,
        id: RequestId,
        path: &RequestPath,
        range: ByteRange,
    ) -> StreamResult<()> {
        match self.next.as_deref_mut() {
            Some(next) => next.create_dedicated_cache(ctx, id, path, range),
            None => Ok(()),
        }
    }

    /// Forwards `destroy_dedicated_cache`.
    pub fn destroy_dedicated_cache(&mut self, path: &RequestPath, range: ByteRange) {
        if let Some(next) = self.next.as_deref_mut() {
            next.destroy_dedicated_cache(path, range);
        }
    }

    /// Forwards `collect_statistics`.
    pub fn collect_statistics(&self, out: &mut Vec<Statistic>) {
        if let Some(next) = self.next.as_deref() {
            next.collect_statistics(out);
        }
    }

    /// Forwards `cancel_request`; nothing to cancel at the end of the chain.
    pub fn cancel_request(&mut self, ctx: &mut StreamerContext, id: RequestId) -> bool {
        self.next
            .as_deref_mut()
            .is_some_and(|next| next.cancel_request(ctx, id))
    }
}

impl std::fmt::Debug for LayerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerLink")
            .field("name", &self.name)
            .field("next", &self.next.as_deref().map(|n| n.name().to_string()))
            .finish()
    }
}

/// One node of the stream stack.
///
/// All methods are synchronous and must return promptly; only a terminal
/// layer may hand work to background tasks. Default implementations forward
/// to the next layer through [`link`](Self::link).
pub trait StreamStackEntry: Send {
    /// The embedded link to the successor.
    fn link(&self) -> &LayerLink;

    /// The embedded link to the successor, mutably.
    fn link_mut(&mut self) -> &mut LayerLink;

    /// Layer name.
    fn name(&self) -> &str {
        self.link().name()
    }

    /// Returns true for a layer that performs I/O and never forwards.
    fn is_terminal(&self) -> bool {
        false
    }

    /// Accepts a dispatched request. The request must eventually be completed,
    /// either by this layer or by one further down.
    fn prepare_request(&mut self, ctx: &mut StreamerContext, id: RequestId) {
        self.link_mut().prepare_request(ctx, id)
    }

    /// Lets the layer make progress. Returns true if any work was done.
    fn execute_requests(&mut self, ctx: &mut StreamerContext) -> bool {
        self.link_mut().execute_requests(ctx)
    }

    /// How many more reads this layer (and everything below it) can accept.
    fn available_request_slots(&self) -> usize {
        self.link().available_request_slots()
    }

    /// Refreshes predicted completion times.
    ///
    /// `internal_pending` holds dispatched requests not yet given an estimate;
    /// a layer removes the ones it accounts for. `external_pending` holds
    /// requests still waiting for dispatch, in dispatch order.
    fn update_completion_estimates(
        &mut self,
        ctx: &mut StreamerContext,
        now: Instant,
        internal_pending: &mut Vec<RequestId>,
        external_pending: &[RequestId],
    ) {
        self.link_mut()
            .update_completion_estimates(ctx, now, internal_pending, external_pending)
    }

    /// Second-pass hook for a request this layer created. Called by the
    /// layer itself and never forwarded.
    fn finalize_request(&mut self, _ctx: &mut StreamerContext, _id: RequestId) {}

    /// Authoritative size of the file as seen from this layer.
    fn get_file_size(&self, path: &RequestPath) -> StreamResult<u64> {
        self.link().get_file_size(path)
    }

    /// Drops cached data for one file.
    fn flush_cache(&mut self, path: &RequestPath) {
        self.link_mut().flush_cache(path)
    }

    /// Drops all cached data.
    fn flush_entire_cache(&mut self) {
        self.link_mut().flush_entire_cache()
    }

    /// Pins a region of a file. Request `id` tracks any I/O needed to load it.
    fn create_dedicated_cache(
        &mut self,
        ctx: &mut StreamerContext,
        id: RequestId,
        path: &RequestPath,
        range: ByteRange,
    ) -> StreamResult<()> {
        self.link_mut().create_dedicated_cache(ctx, id, path, range)
    }

    /// Releases a region pinned by [`create_dedicated_cache`](Self::create_dedicated_cache).
    fn destroy_dedicated_cache(&mut self, path: &RequestPath, range: ByteRange) {
        self.link_mut().destroy_dedicated_cache(path, range)
    }

    /// Appends this layer's statistics, then those of the layers below.
    fn collect_statistics(&self, out: &mut Vec<Statistic>) {
        self.link().collect_statistics(out)
    }

    /// Cancels a dispatched request. Returns false if the work already finished
    /// or is not held by this part of the chain.
    fn cancel_request(&mut self, ctx: &mut StreamerContext, id: RequestId) -> bool {
        self.link_mut().cancel_request(ctx, id)
    }
}

/// Names of the layers from `head` to the tail.
pub fn layer_names(head: Option<&dyn StreamStackEntry>) -> Vec<String> {
    let mut names = Vec::new();
    let mut current = head;
    while let Some(layer) = current {
        names.push(layer.name().to_string());
        current = layer.link().next();
    }
    names
}

/// Returns true if a terminal layer is reachable from `head`.
pub fn reaches_terminal(head: Option<&dyn StreamStackEntry>) -> bool {
    let mut current = head;
    while let Some(layer) = current {
        if layer.is_terminal() {
            return true;
        }
        current = layer.link().next();
    }
    false
}
