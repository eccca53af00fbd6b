//! Error types for the streaming pipeline.

use std::sync::Arc;

use thiserror::Error;

use crate::request::RequestId;

/// Result type alias for pipeline operations.
pub type StreamResult<T> = Result<T, StreamError>;

/// Error variants for pipeline operations.
///
/// Errors are `Clone` so a request's failure can be recorded on the request
/// and handed to the caller with its completion.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// An alias-relative path could not be resolved.
    #[error("Path resolution failed for '{path}': {reason}")]
    PathResolution {
        /// The path as supplied by the caller.
        path: String,
        /// Description of the failure.
        reason: String,
    },

    /// A request reached the end of the layer chain without meeting a device.
    #[error("Request reached the end of the layer chain at '{layer}' without a device")]
    ChainTermination {
        /// Name of the last layer the request visited.
        layer: String,
    },

    /// A dedicated cache region does not fit in the remaining budget.
    #[error("Dedicated cache reservation of {requested} bytes exceeds budget: {available} bytes available")]
    CacheReservation {
        /// Bytes requested for the region.
        requested: u64,
        /// Bytes still available in the dedicated budget.
        available: u64,
    },

    /// Device-level failure.
    #[error("Device error on {device}: {reason}")]
    DeviceIo {
        /// The device layer name.
        device: String,
        /// Description of the error.
        reason: String,
    },

    /// A request was completed twice.
    #[error("Request {request} completed more than once")]
    DoubleCompletion {
        /// The offending request.
        request: RequestId,
    },

    /// The requested file does not exist.
    #[error("File not found: {path}")]
    NotFound {
        /// Absolute path of the missing file.
        path: String,
    },

    /// A layer was asked for a size it has not learned yet.
    #[error("Size of {path} is not known yet; submit a size query first")]
    SizeUnknown {
        /// Absolute path of the file.
        path: String,
    },

    /// The requested byte range lies outside the file.
    #[error("Invalid range: offset {offset} + length {length} exceeds file size {file_size}")]
    InvalidRange {
        /// Start of the requested range.
        offset: u64,
        /// Length of the requested range.
        length: u64,
        /// Actual file size.
        file_size: u64,
    },

    /// A write into a read buffer would end past the addressable range.
    #[error("Buffer write of {length} bytes at offset {offset} overflows")]
    BufferOverflow {
        /// Buffer offset of the write.
        offset: usize,
        /// Bytes written.
        length: usize,
    },

    /// Decompression of a compressed file failed.
    #[error("Decompression failed: {0}")]
    Decompression(String),

    /// Invalid configuration or malformed layer chain.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The request was canceled before it completed.
    #[error("Request {request} was canceled")]
    Canceled {
        /// The canceled request.
        request: RequestId,
    },

    /// The streamer is no longer running.
    #[error("Streamer has shut down")]
    ShutDown,
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::Io(Arc::new(err))
    }
}
