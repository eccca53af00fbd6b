//! Assembly of layer chains.

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::info;

use crate::cache::CacheLayer;
use crate::compressor::CompressorLayer;
use crate::config::StreamerConfig;
use crate::device::DeviceLayer;
use crate::error::{StreamError, StreamResult};
use crate::io_backend::IoBackend;
use crate::layer::{layer_names, StreamStackEntry};
use crate::path::PathResolver;

/// Builds a chain from the top layer down.
///
/// A terminal layer is only accepted as the last entry. A chain without a
/// terminal is allowed; reads reaching its end fail with a chain-termination
/// error.
#[derive(Default)]
pub struct StackBuilder {
    layers: Vec<Box<dyn StreamStackEntry>>,
}

impl StackBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `layer` below the ones already pushed.
    pub fn push(mut self, layer: Box<dyn StreamStackEntry>) -> Self {
        self.layers.push(layer);
        self
    }

    /// Number of layers pushed so far.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Returns true if no layer was pushed.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Links the layers and returns the head, or `None` for an empty chain.
    pub fn build(self) -> StreamResult<Option<Box<dyn StreamStackEntry>>> {
        let count = self.layers.len();
        for (index, layer) in self.layers.iter().enumerate() {
            if layer.is_terminal() && index + 1 != count {
                return Err(StreamError::Config(format!(
                    "terminal layer '{}' must be the last in the chain",
                    layer.name()
                )));
            }
        }

        let mut below: Option<Box<dyn StreamStackEntry>> = None;
        for mut layer in self.layers.into_iter().rev() {
            layer.link_mut().set_next(below.take());
            below = Some(layer);
        }
        Ok(below)
    }
}

/// Builds the configured chain: cache, compressor, then the device over `backend`.
pub fn build_stack<B: IoBackend>(
    config: &StreamerConfig,
    backend: Arc<B>,
    runtime: Handle,
    resolver: &dyn PathResolver,
) -> StreamResult<Option<Box<dyn StreamStackEntry>>> {
    let mut builder = StackBuilder::new();
    if config.enable_cache {
        builder = builder.push(Box::new(CacheLayer::new("cache", config.cache.clone())));
    }
    if config.compressor.enabled {
        builder = builder.push(Box::new(CompressorLayer::from_config(
            "compressor",
            config.compressor.clone(),
            resolver,
            runtime.clone(),
        )?));
    }
    builder = builder.push(Box::new(DeviceLayer::new(
        "device",
        backend,
        runtime,
        config.device.clone(),
    )));

    let head = builder.build()?;
    info!(layers = ?layer_names(head.as_deref()), "layer chain assembled");
    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io_backend::MemoryBackend;
    use crate::layer::reaches_terminal;
    use crate::path::AliasResolver;
    use crate::test_support::{PassThrough, StubDevice};

    #[test]
    fn test_build_links_in_push_order() {
        let head = StackBuilder::new()
            .push(Box::new(PassThrough::new("top")))
            .push(Box::new(PassThrough::new("middle")))
            .push(Box::new(StubDevice::new()))
            .build()
            .unwrap();
        assert_eq!(
            layer_names(head.as_deref()),
            vec!["top", "middle", "stub-device"]
        );
        assert!(reaches_terminal(head.as_deref()));
    }

    #[test]
    fn test_empty_chain_allowed() {
        let builder = StackBuilder::new();
        assert!(builder.is_empty());
        assert!(builder.build().unwrap().is_none());
    }

    #[test]
    fn test_deviceless_chain_allowed() {
        let head = StackBuilder::new()
            .push(Box::new(PassThrough::new("only")))
            .build()
            .unwrap();
        assert!(!reaches_terminal(head.as_deref()));
    }

    #[test]
    fn test_terminal_must_be_last() {
        let err = StackBuilder::new()
            .push(Box::new(StubDevice::new()))
            .push(Box::new(PassThrough::new("below")))
            .build()
            .err().unwrap();
        assert!(matches!(err, StreamError::Config(_)));
    }

    #[tokio::test]
    async fn test_build_stack_from_config() {
        let config = StreamerConfig::default();
        let head = build_stack(
            &config,
            Arc::new(MemoryBackend::new()),
            Handle::current(),
            &AliasResolver::new(),
        )
        .unwrap();
        assert_eq!(
            layer_names(head.as_deref()),
            vec!["cache", "compressor", "device"]
        );
    }

    #[tokio::test]
    async fn test_build_stack_skips_disabled_layers() {
        let mut config = StreamerConfig::default();
        config.enable_cache = false;
        config.compressor.enabled = false;
        let head = build_stack(
            &config,
            Arc::new(MemoryBackend::new()),
            Handle::current(),
            &AliasResolver::new(),
        )
        .unwrap();
        assert_eq!(layer_names(head.as_deref()), vec!["device"]);
    }
}
