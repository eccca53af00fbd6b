#![warn(missing_docs)]

//! StreamStack core: layered asynchronous file-streaming pipeline
//!
//! Read requests travel down a chain of layers (cache, compressor, device)
//! driven by a single scheduler task. Layers split requests into child
//! requests, answer them from memory, or hand them to an I/O backend; the
//! caller awaits a [`RequestHandle`] that resolves once the data is in its
//! buffer.

pub mod cache;
pub mod compressor;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod io_backend;
pub mod layer;
pub mod path;
pub mod request;
pub mod scheduler;
pub mod stack;
pub mod statistics;
pub mod streamer;

#[cfg(test)]
mod test_support;

pub use cache::{CacheLayer, CacheLayerConfig, CacheStats, ReadPlan, Segment};
pub use compressor::{
    compress, decompress, CompressedFileEntry, CompressedFileInfo, CompressionAlgorithm,
    CompressorLayer, CompressorLayerConfig, CompressorStats,
};
pub use config::StreamerConfig;
pub use context::{ContextStats, StreamerContext};
pub use device::{DeviceConfig, DeviceLayer, DeviceStats};
pub use error::{StreamError, StreamResult};
pub use io_backend::{FileSystemBackend, IoBackend, IoStats, MemoryBackend};
pub use layer::{layer_names, reaches_terminal, LayerLink, StreamStackEntry};
pub use path::{AliasResolver, PathResolver, RequestPath};
pub use request::{
    ByteRange, FileRequest, ReadBuffer, RequestCommand, RequestCompletion, RequestId,
    RequestIdGen, RequestPriority, RequestStatus,
};
pub use scheduler::{
    DeadlineAwareOrdering, FifoOrdering, RequestOrdering, Scheduler, SchedulerConfig,
    SchedulerMessage, SchedulerStats,
};
pub use stack::{build_stack, StackBuilder};
pub use statistics::{render_prometheus, StatValue, Statistic, ThroughputEstimator};
pub use streamer::{RequestHandle, RequestOptions, Streamer};
