//! Read cache layer.
//!
//! Two stores sit behind this layer:
//!
//! - a shared LRU range cache, holding non-overlapping byte ranges per file
//!   and bounded by memory and entry count;
//! - dedicated regions pinned with `create_dedicated_cache`, which are never
//!   evicted, are reference counted, and have their own byte budget.
//!
//! A read is planned against both stores. Fully resident reads complete
//! immediately; otherwise resident bytes are copied into the destination and
//! every missing gap is forwarded as a child request owned by this layer.
//! When a child finishes, [`finalize_request`](StreamStackEntry::finalize_request)
//! populates the shared cache from the destination buffer before the child
//! is retired and the parent can complete.
//!
//! Flushes bump a per-path or global generation counter. A fill started
//! before a flush of its path is discarded, so stale data is never cached.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::StreamerContext;
use crate::error::{StreamError, StreamResult};
use crate::layer::{reaches_terminal, LayerLink, StreamStackEntry};
use crate::path::RequestPath;
use crate::request::{ByteRange, ReadBuffer, RequestCommand, RequestId, RequestStatus};
use crate::statistics::Statistic;

/// Configuration for the cache layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheLayerConfig {
    /// Maximum memory for shared entries in bytes (default 64MB).
    pub max_memory_bytes: u64,
    /// Maximum number of shared entries (default 4096).
    pub max_entries: usize,
    /// Reads longer than this bypass the cache (default 4MB).
    pub max_cacheable_read: u64,
    /// Byte budget for dedicated regions (default 32MB).
    pub dedicated_budget_bytes: u64,
}

impl Default for CacheLayerConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 64 * 1024 * 1024,
            max_entries: 4096,
            max_cacheable_read: 4 * 1024 * 1024,
            dedicated_budget_bytes: 32 * 1024 * 1024,
        }
    }
}

/// Statistics tracking for the cache layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Reads served entirely from cache.
    pub hits: u64,
    /// Reads served partly from cache.
    pub partial_hits: u64,
    /// Reads with nothing resident.
    pub misses: u64,
    /// Reads that bypassed the cache.
    pub bypassed: u64,
    /// Shared entries inserted.
    pub insertions: u64,
    /// Shared entries evicted, by pressure or flush.
    pub evictions: u64,
    /// Fills dropped because their path was flushed while they were in flight.
    pub stale_fills_discarded: u64,
    /// Bytes served from dedicated regions.
    pub dedicated_bytes_served: u64,
}

impl CacheStats {
    /// Fraction of planned reads served entirely from cache.
    ///
    /// Returns 0.0 if no read has been planned.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.partial_hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Resident bytes for part of a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// File offset of the first byte.
    pub offset: u64,
    /// The bytes.
    pub data: Bytes,
}

impl Segment {
    fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// How a read will be served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadPlan {
    /// Every byte is resident.
    Satisfied(Vec<Segment>),
    /// Not cacheable: pass the request down unchanged.
    Forward,
    /// Copy `hits` now and fetch each `(offset, length)` gap downstream.
    Split {
        /// Resident parts.
        hits: Vec<Segment>,
        /// Missing parts as `(offset, length)`.
        misses: Vec<(u64, u64)>,
    },
}

/// Returns the parts of `[offset, end)` not covered by `segments` (sorted by offset).
fn gaps(segments: &[Segment], offset: u64, end: u64) -> Vec<(u64, u64)> {
    let mut out = Vec::new();
    let mut cursor = offset;
    for segment in segments {
        if segment.offset > cursor {
            out.push((cursor, segment.offset - cursor));
        }
        cursor = cursor.max(segment.end());
    }
    if cursor < end {
        out.push((cursor, end - cursor));
    }
    out
}

/// Slices of `map` entries overlapping `[offset, end)`, with their keys.
fn overlapping(map: &BTreeMap<u64, Bytes>, offset: u64, end: u64) -> Vec<(u64, Segment)> {
    let before = map
        .range(..offset)
        .next_back()
        .filter(|(start, data)| **start + data.len() as u64 > offset);
    before
        .into_iter()
        .chain(map.range(offset..end))
        .filter_map(|(start, data)| {
            let s = (*start).max(offset);
            let e = (*start + data.len() as u64).min(end);
            (s < e).then(|| {
                (
                    *start,
                    Segment {
                        offset: s,
                        data: data.slice((s - start) as usize..(e - start) as usize),
                    },
                )
            })
        })
        .collect()
}

type EntryKey = (RequestPath, u64);

/// LRU cache of non-overlapping byte ranges per file.
///
/// Recency is tracked with stamps: a touch pushes a fresh `(key, stamp)` to
/// the front of `lru_order` and records the stamp in `stamps`. Queue entries
/// whose stamp is no longer current are skipped on eviction and dropped when
/// the queue is compacted.
struct RangeCache {
    files: HashMap<RequestPath, BTreeMap<u64, Bytes>>,
    stamps: HashMap<EntryKey, u64>,
    lru_order: VecDeque<(EntryKey, u64)>,
    next_stamp: u64,
    current_memory_bytes: u64,
    entry_count: usize,
    max_memory_bytes: u64,
    max_entries: usize,
}

impl RangeCache {
    fn new(max_memory_bytes: u64, max_entries: usize) -> Self {
        Self {
            files: HashMap::new(),
            stamps: HashMap::new(),
            lru_order: VecDeque::new(),
            next_stamp: 0,
            current_memory_bytes: 0,
            entry_count: 0,
            max_memory_bytes,
            max_entries,
        }
    }

    fn touch(&mut self, key: EntryKey) {
        self.next_stamp += 1;
        let stamp = self.next_stamp;
        self.stamps.insert(key.clone(), stamp);
        self.lru_order.push_front((key, stamp));
        if self.lru_order.len() > 2 * self.entry_count + 64 {
            self.compact();
        }
    }

    fn compact(&mut self) {
        let stamps = &self.stamps;
        self.lru_order
            .retain(|(key, stamp)| stamps.get(key) == Some(stamp));
    }

    /// Resident segments within `[offset, end)`, marking them recently used.
    fn lookup(&mut self, path: &RequestPath, offset: u64, end: u64) -> Vec<Segment> {
        let found = match self.files.get(path) {
            Some(map) => overlapping(map, offset, end),
            None => return Vec::new(),
        };
        found
            .into_iter()
            .map(|(start, segment)| {
                self.touch((path.clone(), start));
                segment
            })
            .collect()
    }

    fn remove_entry(&mut self, key: &EntryKey) -> bool {
        let Some(map) = self.files.get_mut(&key.0) else {
            return false;
        };
        let Some(data) = map.remove(&key.1) else {
            return false;
        };
        if map.is_empty() {
            self.files.remove(&key.0);
        }
        self.stamps.remove(key);
        self.current_memory_bytes -= data.len() as u64;
        self.entry_count -= 1;
        true
    }

    fn evict_lru(&mut self) -> bool {
        while let Some((key, stamp)) = self.lru_order.pop_back() {
            if self.stamps.get(&key) != Some(&stamp) {
                continue;
            }
            debug!(path = %key.0, offset = key.1, "evicted cache entry");
            return self.remove_entry(&key);
        }
        false
    }

    /// Evicts until `required_bytes` and one more entry fit. Returns evictions.
    fn evict_until_space(&mut self, required_bytes: u64) -> u64 {
        let mut evicted = 0;
        while self.current_memory_bytes + required_bytes > self.max_memory_bytes
            || self.entry_count >= self.max_entries
        {
            if !self.evict_lru() {
                break;
            }
            evicted += 1;
        }
        evicted
    }

    /// Caches the parts of `data` (starting at `offset`) not already resident.
    /// Returns `(inserted, evicted)`.
    fn insert(&mut self, path: &RequestPath, offset: u64, data: Bytes) -> (u64, u64) {
        let end = offset + data.len() as u64;
        let resident: Vec<Segment> = self
            .files
            .get(path)
            .map(|map| overlapping(map, offset, end).into_iter().map(|(_, s)| s).collect())
            .unwrap_or_default();

        let mut inserted = 0;
        let mut evicted = 0;
        for (gap_offset, gap_len) in gaps(&resident, offset, end) {
            if gap_len > self.max_memory_bytes || self.max_entries == 0 {
                continue;
            }
            evicted += self.evict_until_space(gap_len);
            let start = (gap_offset - offset) as usize;
            let piece = data.slice(start..start + gap_len as usize);
            self.files
                .entry(path.clone())
                .or_default()
                .insert(gap_offset, piece);
            self.current_memory_bytes += gap_len;
            self.entry_count += 1;
            self.touch((path.clone(), gap_offset));
            inserted += 1;
        }
        (inserted, evicted)
    }

    /// Drops every entry for `path`. Returns the number removed.
    fn evict_path(&mut self, path: &RequestPath) -> u64 {
        let Some(map) = self.files.remove(path) else {
            return 0;
        };
        for start in map.keys() {
            self.stamps.remove(&(path.clone(), *start));
        }
        let removed = map.len();
        self.current_memory_bytes -= map.values().map(|d| d.len() as u64).sum::<u64>();
        self.entry_count -= removed;
        removed as u64
    }

    /// Drops everything. Returns the number removed.
    fn clear(&mut self) -> u64 {
        let removed = self.entry_count as u64;
        self.files.clear();
        self.stamps.clear();
        self.lru_order.clear();
        self.current_memory_bytes = 0;
        self.entry_count = 0;
        removed
    }
}

#[derive(Debug, Clone)]
enum RegionState {
    Loading(RequestId),
    Ready(Bytes),
}

#[derive(Debug, Clone)]
struct DedicatedRegion {
    offset: u64,
    length: u64,
    refcount: u32,
    state: RegionState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FillTarget {
    Shared { path_generation: u64, global_generation: u64 },
    Dedicated { offset: u64, length: u64 },
}

#[derive(Debug, Clone)]
struct PendingFill {
    path: RequestPath,
    offset: u64,
    length: u64,
    buffer: ReadBuffer,
    buffer_offset: usize,
    target: FillTarget,
}

/// Caching layer with a shared LRU range cache and pinned dedicated regions.
pub struct CacheLayer {
    link: LayerLink,
    config: CacheLayerConfig,
    shared: RangeCache,
    dedicated: HashMap<RequestPath, Vec<DedicatedRegion>>,
    dedicated_bytes: u64,
    pending_fills: HashMap<RequestId, PendingFill>,
    pending_sizes: HashMap<RequestId, (RequestPath, u64)>,
    path_generations: HashMap<RequestPath, u64>,
    global_generation: u64,
    stats: CacheStats,
}

impl CacheLayer {
    /// Creates a cache layer.
    pub fn new(name: &str, config: CacheLayerConfig) -> Self {
        debug!(
            name,
            max_memory_bytes = config.max_memory_bytes,
            max_entries = config.max_entries,
            dedicated_budget_bytes = config.dedicated_budget_bytes,
            "created cache layer"
        );
        Self {
            link: LayerLink::new(name),
            shared: RangeCache::new(config.max_memory_bytes, config.max_entries),
            config,
            dedicated: HashMap::new(),
            dedicated_bytes: 0,
            pending_fills: HashMap::new(),
            pending_sizes: HashMap::new(),
            path_generations: HashMap::new(),
            global_generation: 0,
            stats: CacheStats::default(),
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Bytes held by shared entries.
    pub fn memory_bytes(&self) -> u64 {
        self.shared.current_memory_bytes
    }

    /// Number of shared entries.
    pub fn entry_count(&self) -> usize {
        self.shared.entry_count
    }

    /// Bytes reserved by dedicated regions.
    pub fn dedicated_bytes(&self) -> u64 {
        self.dedicated_bytes
    }

    /// Returns true if a loaded dedicated region covers `[offset, offset + length)` of `path`.
    pub fn has_dedicated(&self, path: &RequestPath, offset: u64, length: u64) -> bool {
        self.dedicated.get(path).is_some_and(|regions| {
            regions.iter().any(|r| {
                matches!(r.state, RegionState::Ready(_))
                    && r.offset <= offset
                    && offset + length <= r.offset + r.length
            })
        })
    }

    fn path_generation(&self, path: &RequestPath) -> u64 {
        self.path_generations.get(path).copied().unwrap_or(0)
    }

    fn dedicated_segments(&self, path: &RequestPath, offset: u64, end: u64) -> Vec<Segment> {
        let Some(regions) = self.dedicated.get(path) else {
            return Vec::new();
        };
        let mut segments: Vec<Segment> = regions
            .iter()
            .filter_map(|region| match &region.state {
                RegionState::Ready(data) => {
                    let s = region.offset.max(offset);
                    let e = (region.offset + data.len() as u64).min(end);
                    (s < e).then(|| Segment {
                        offset: s,
                        data: data.slice((s - region.offset) as usize..(e - region.offset) as usize),
                    })
                }
                RegionState::Loading(_) => None,
            })
            .collect();
        segments.sort_by_key(|s| s.offset);
        // Overlapping regions: keep only the uncovered tail of later segments.
        let mut merged: Vec<Segment> = Vec::with_capacity(segments.len());
        for segment in segments {
            let covered_to = merged.last().map_or(0, Segment::end);
            if segment.end() <= covered_to {
                continue;
            }
            if segment.offset < covered_to {
                let skip = (covered_to - segment.offset) as usize;
                merged.push(Segment {
                    offset: covered_to,
                    data: segment.data.slice(skip..),
                });
            } else {
                merged.push(segment);
            }
        }
        merged
    }

    /// Plans a read of `range` of `path` against the dedicated and shared stores.
    pub fn plan_read(&mut self, path: &RequestPath, range: ByteRange) -> ReadPlan {
        // Empty reads go down so the device still checks the file exists.
        let length = match range.length {
            Some(length) if length > 0 && length <= self.config.max_cacheable_read => length,
            _ => return ReadPlan::Forward,
        };
        let offset = range.offset;
        let end = offset.saturating_add(length);

        let mut hits = self.dedicated_segments(path, offset, end);
        let dedicated_served: u64 = hits.iter().map(|s| s.data.len() as u64).sum();
        self.stats.dedicated_bytes_served += dedicated_served;

        for (gap_offset, gap_len) in gaps(&hits, offset, end) {
            let found = self.shared.lookup(path, gap_offset, gap_offset + gap_len);
            hits.extend(found);
        }
        hits.sort_by_key(|s| s.offset);

        let misses = gaps(&hits, offset, end);
        if misses.is_empty() {
            ReadPlan::Satisfied(hits)
        } else {
            ReadPlan::Split { hits, misses }
        }
    }

    fn copy_hits(
        ctx: &mut StreamerContext,
        id: RequestId,
        hits: &[Segment],
        range_offset: u64,
        buffer: &ReadBuffer,
        buffer_offset: usize,
    ) -> StreamResult<()> {
        let mut copied = 0;
        for hit in hits {
            buffer.write_at(buffer_offset + (hit.offset - range_offset) as usize, &hit.data)?;
            copied += hit.data.len() as u64;
        }
        ctx.add_bytes_delivered(id, copied);
        Ok(())
    }

    fn prepare_read(
        &mut self,
        ctx: &mut StreamerContext,
        id: RequestId,
        path: RequestPath,
        range: ByteRange,
        buffer: ReadBuffer,
        buffer_offset: usize,
    ) {
        match self.plan_read(&path, range) {
            ReadPlan::Forward => {
                self.stats.bypassed += 1;
                debug!(request = %id, path = %path, range = %range, "cache bypass");
                self.link.prepare_request(ctx, id);
            }
            ReadPlan::Satisfied(hits) => {
                self.stats.hits += 1;
                debug!(request = %id, path = %path, range = %range, "cache hit");
                match Self::copy_hits(ctx, id, &hits, range.offset, &buffer, buffer_offset) {
                    Ok(()) => ctx.mark_request_as_completed(id, RequestStatus::Completed),
                    Err(err) => ctx.fail(id, err),
                }
            }
            ReadPlan::Split { hits, misses } => {
                if hits.is_empty() {
                    self.stats.misses += 1;
                } else {
                    self.stats.partial_hits += 1;
                }
                debug!(
                    request = %id,
                    path = %path,
                    range = %range,
                    resident = hits.len(),
                    missing = misses.len(),
                    "cache miss"
                );
                if let Err(err) =
                    Self::copy_hits(ctx, id, &hits, range.offset, &buffer, buffer_offset)
                {
                    ctx.fail(id, err);
                    return;
                }

                let target = FillTarget::Shared {
                    path_generation: self.path_generation(&path),
                    global_generation: self.global_generation,
                };
                let owner = self.link.name().to_string();
                let mut children = Vec::with_capacity(misses.len());
                for (offset, length) in misses {
                    let child_offset = buffer_offset + (offset - range.offset) as usize;
                    let child = ctx.create_child(
                        id,
                        RequestCommand::Read {
                            path: path.clone(),
                            range: ByteRange::new(offset, length),
                            buffer: buffer.clone(),
                            buffer_offset: child_offset,
                        },
                        Some(&owner),
                    );
                    self.pending_fills.insert(
                        child,
                        PendingFill {
                            path: path.clone(),
                            offset,
                            length,
                            buffer: buffer.clone(),
                            buffer_offset: child_offset,
                            target,
                        },
                    );
                    children.push(child);
                }
                for child in children {
                    self.link.prepare_request(ctx, child);
                }
            }
        }
    }

    /// Finalizes and retires this layer's finished children.
    fn complete_fills(&mut self, ctx: &mut StreamerContext) -> bool {
        let finished = ctx.take_layer_completions(self.link.name());
        let progressed = !finished.is_empty();
        for id in finished {
            self.finalize_request(ctx, id);
            ctx.retire(id);
        }
        progressed
    }

    /// Bounds of a dedicated region, or `None` when the file size has to be
    /// queried first.
    fn resolve_region(
        &self,
        path: &RequestPath,
        range: ByteRange,
    ) -> StreamResult<Option<(u64, u64)>> {
        match range.length {
            Some(length) => Ok(Some((range.offset, length))),
            None => match self.link.get_file_size(path) {
                Ok(size) => range.resolve(size).map(Some),
                Err(StreamError::SizeUnknown { .. }) => Ok(None),
                Err(err) => Err(err),
            },
        }
    }

    /// Sends a size query for `path` on behalf of request `id`; the region
    /// starting at `offset` is reserved once the size is known.
    fn query_region_size(
        &mut self,
        ctx: &mut StreamerContext,
        id: RequestId,
        path: &RequestPath,
        offset: u64,
    ) {
        let owner = self.link.name().to_string();
        let child = ctx.create_child(
            id,
            RequestCommand::GetFileSize { path: path.clone() },
            Some(&owner),
        );
        self.pending_sizes.insert(child, (path.clone(), offset));
        debug!(path = %path, offset, request = %child, "querying size for dedicated region");
        self.link.prepare_request(ctx, child);
    }

    fn finish_size_query(
        &mut self,
        ctx: &mut StreamerContext,
        id: RequestId,
        path: RequestPath,
        offset: u64,
    ) {
        let Some(request) = ctx.request(id) else {
            return;
        };
        // A failed query fails the parent when it is retired.
        let (Some(parent), Some(size)) = (request.parent(), request.file_size()) else {
            return;
        };
        if request.status() != RequestStatus::Completed || !ctx.is_live(parent) {
            return;
        }
        let reserved = ByteRange::from_offset(offset)
            .resolve(size)
            .and_then(|(offset, length)| self.reserve_region(ctx, parent, &path, offset, length));
        if let Err(err) = reserved {
            warn!(path = %path, error = %err, "dedicated region not reserved");
            ctx.fail(parent, err);
        }
    }

    /// Shares an existing region or reserves budget and starts loading a new one.
    fn reserve_region(
        &mut self,
        ctx: &mut StreamerContext,
        id: RequestId,
        path: &RequestPath,
        offset: u64,
        length: u64,
    ) -> StreamResult<()> {
        if let Some(region) = self
            .dedicated
            .get_mut(path)
            .and_then(|regions| regions.iter_mut().find(|r| r.offset == offset && r.length == length))
        {
            region.refcount += 1;
            debug!(path = %path, offset, length, refcount = region.refcount, "dedicated region shared");
            return Ok(());
        }

        let available = self
            .config
            .dedicated_budget_bytes
            .saturating_sub(self.dedicated_bytes);
        if length > available {
            warn!(path = %path, requested = length, available, "dedicated cache budget exceeded");
            return Err(StreamError::CacheReservation {
                requested: length,
                available,
            });
        }

        let buffer = ReadBuffer::with_len(length as usize);
        let owner = self.link.name().to_string();
        let child = ctx.create_child(
            id,
            RequestCommand::Read {
                path: path.clone(),
                range: ByteRange::new(offset, length),
                buffer: buffer.clone(),
                buffer_offset: 0,
            },
            Some(&owner),
        );
        self.dedicated_bytes += length;
        self.dedicated
            .entry(path.clone())
            .or_default()
            .push(DedicatedRegion {
                offset,
                length,
                refcount: 1,
                state: RegionState::Loading(child),
            });
        self.pending_fills.insert(
            child,
            PendingFill {
                path: path.clone(),
                offset,
                length,
                buffer,
                buffer_offset: 0,
                target: FillTarget::Dedicated { offset, length },
            },
        );
        debug!(path = %path, offset, length, request = %child, "loading dedicated region");
        self.link.prepare_request(ctx, child);
        Ok(())
    }

    fn release_region(&mut self, path: &RequestPath, offset: u64, length: u64, force: bool) {
        let Some(regions) = self.dedicated.get_mut(path) else {
            return;
        };
        let Some(pos) = regions
            .iter()
            .position(|r| r.offset == offset && r.length == length)
        else {
            return;
        };
        regions[pos].refcount = regions[pos].refcount.saturating_sub(1);
        if force || regions[pos].refcount == 0 {
            regions.remove(pos);
            self.dedicated_bytes -= length;
            if regions.is_empty() {
                self.dedicated.remove(path);
            }
        }
    }
}

impl StreamStackEntry for CacheLayer {
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
        match command {
            RequestCommand::Read {
                path,
                range,
                buffer,
                buffer_offset,
            } => self.prepare_read(ctx, id, path, range, buffer, buffer_offset),
            _ => self.link.prepare_request(ctx, id),
        }
    }

    fn execute_requests(&mut self, ctx: &mut StreamerContext) -> bool {
        let before = self.complete_fills(ctx);
        let forwarded = self.link.execute_requests(ctx);
        let after = self.complete_fills(ctx);
        before || forwarded || after
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

        // A split read finishes with its slowest gap.
        let mut latest: HashMap<RequestId, Instant> = HashMap::new();
        for child in self.pending_fills.keys() {
            let Some(request) = ctx.request(*child) else {
                continue;
            };
            if let (Some(parent), Some(estimate)) =
                (request.parent(), request.estimated_completion())
            {
                let slot = latest.entry(parent).or_insert(estimate);
                *slot = (*slot).max(estimate);
            }
        }
        for (parent, estimate) in latest {
            ctx.set_estimated_completion(parent, estimate);
        }
    }

    fn finalize_request(&mut self, ctx: &mut StreamerContext, id: RequestId) {
        if let Some((path, offset)) = self.pending_sizes.remove(&id) {
            self.finish_size_query(ctx, id, path, offset);
            return;
        }
        let Some(fill) = self.pending_fills.remove(&id) else {
            return;
        };
        let succeeded = ctx
            .request(id)
            .is_some_and(|r| r.status() == RequestStatus::Completed);

        match fill.target {
            FillTarget::Shared {
                path_generation,
                global_generation,
            } => {
                if !succeeded {
                    return;
                }
                if path_generation != self.path_generation(&fill.path)
                    || global_generation != self.global_generation
                {
                    self.stats.stale_fills_discarded += 1;
                    debug!(request = %id, path = %fill.path, "discarded fill after flush");
                    return;
                }
                let Some(data) = fill.buffer.read_at(fill.buffer_offset, fill.length as usize)
                else {
                    warn!(request = %id, path = %fill.path, "fill buffer shorter than range");
                    return;
                };
                let (inserted, evicted) = self.shared.insert(&fill.path, fill.offset, Bytes::from(data));
                self.stats.insertions += inserted;
                self.stats.evictions += evicted;
            }
            FillTarget::Dedicated { offset, length } => {
                let data = if succeeded {
                    fill.buffer.read_at(0, length as usize).map(Bytes::from)
                } else {
                    None
                };
                let Some(region) = self.dedicated.get_mut(&fill.path).and_then(|regions| {
                    regions.iter_mut().find(|r| {
                        r.offset == offset
                            && r.length == length
                            && matches!(r.state, RegionState::Loading(req) if req == id)
                    })
                }) else {
                    // Destroyed while loading.
                    return;
                };
                match data {
                    Some(data) => {
                        info!(path = %fill.path, offset, length, "dedicated region loaded");
                        region.state = RegionState::Ready(data);
                    }
                    None => {
                        warn!(path = %fill.path, offset, length, "dedicated region failed to load");
                        self.release_region(&fill.path, offset, length, true);
                    }
                }
            }
        }
    }

    fn flush_cache(&mut self, path: &RequestPath) {
        let evicted = self.shared.evict_path(path);
        self.stats.evictions += evicted;
        *self.path_generations.entry(path.clone()).or_insert(0) += 1;
        debug!(path = %path, evicted, "flushed cache for path");
        self.link.flush_cache(path);
    }

    fn flush_entire_cache(&mut self) {
        let evicted = self.shared.clear();
        self.stats.evictions += evicted;
        self.global_generation += 1;
        info!(evicted, "flushed entire cache");
        self.link.flush_entire_cache();
    }

    fn create_dedicated_cache(
        &mut self,
        ctx: &mut StreamerContext,
        id: RequestId,
        path: &RequestPath,
        range: ByteRange,
    ) -> StreamResult<()> {
        if !reaches_terminal(self.link.next()) {
            debug!(path = %path, range = %range, "no device below cache, dedicated region not created");
            return Ok(());
        }
        match self.resolve_region(path, range)? {
            Some((offset, length)) => self.reserve_region(ctx, id, path, offset, length),
            None => {
                self.query_region_size(ctx, id, path, range.offset);
                Ok(())
            }
        }
    }

    fn destroy_dedicated_cache(&mut self, path: &RequestPath, range: ByteRange) {
        let resolved = match range.length {
            Some(length) => Some((range.offset, length)),
            None => self.dedicated.get(path).and_then(|regions| {
                regions
                    .iter()
                    .find(|r| r.offset == range.offset)
                    .map(|r| (r.offset, r.length))
            }),
        };
        let known = resolved.is_some_and(|(offset, length)| {
            self.dedicated.get(path).is_some_and(|regions| {
                regions.iter().any(|r| r.offset == offset && r.length == length)
            })
        });
        match resolved {
            Some((offset, length)) if known => {
                debug!(path = %path, offset, length, "released dedicated region");
                self.release_region(path, offset, length, false);
            }
            _ => warn!(path = %path, range = %range, "no dedicated region to destroy"),
        }
        self.link.destroy_dedicated_cache(path, range);
    }

    fn collect_statistics(&self, out: &mut Vec<Statistic>) {
        let name = self.link.name();
        out.push(Statistic::counter(name, "hits", self.stats.hits));
        out.push(Statistic::counter(name, "partial_hits", self.stats.partial_hits));
        out.push(Statistic::counter(name, "misses", self.stats.misses));
        out.push(Statistic::counter(name, "bypassed", self.stats.bypassed));
        out.push(Statistic::counter(name, "insertions", self.stats.insertions));
        out.push(Statistic::counter(name, "evictions", self.stats.evictions));
        out.push(Statistic::counter(
            name,
            "stale_fills_discarded",
            self.stats.stale_fills_discarded,
        ));
        out.push(Statistic::counter(
            name,
            "dedicated_bytes_served",
            self.stats.dedicated_bytes_served,
        ));
        out.push(Statistic::gauge(name, "hit_rate", self.stats.hit_rate()));
        out.push(Statistic::gauge(name, "memory_bytes", self.shared.current_memory_bytes as f64));
        out.push(Statistic::gauge(name, "entries", self.shared.entry_count as f64));
        out.push(Statistic::gauge(name, "dedicated_bytes", self.dedicated_bytes as f64));
        out.push(Statistic::gauge(
            name,
            "dedicated_regions",
            self.dedicated.values().map(Vec::len).sum::<usize>() as f64,
        ));
        self.link.collect_statistics(out);
    }
}
