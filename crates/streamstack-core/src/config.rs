//! Streamer configuration loaded from TOML or JSON.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cache::CacheLayerConfig;
use crate::compressor::CompressorLayerConfig;
use crate::device::DeviceConfig;
use crate::error::{StreamError, StreamResult};
use crate::path::AliasResolver;
use crate::scheduler::SchedulerConfig;

/// Top-level configuration of a streamer and its layer chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// Scheduler loop settings.
    pub scheduler: SchedulerConfig,
    /// Whether the cache layer is part of the stack (default true).
    pub enable_cache: bool,
    /// Cache layer settings.
    pub cache: CacheLayerConfig,
    /// Compressor layer settings and registered files.
    pub compressor: CompressorLayerConfig,
    /// Device layer settings.
    pub device: DeviceConfig,
    /// Alias name to root directory.
    pub aliases: HashMap<String, String>,
    /// Alias applied to relative paths without an `@alias@` prefix.
    pub default_alias: Option<String>,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            enable_cache: true,
            cache: CacheLayerConfig::default(),
            compressor: CompressorLayerConfig::default(),
            device: DeviceConfig::default(),
            aliases: HashMap::new(),
            default_alias: None,
        }
    }
}

impl StreamerConfig {
    /// Loads a configuration file, choosing the format by extension.
    pub fn from_file(path: &Path) -> StreamResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: StreamerConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| StreamError::Config(e.to_string()))?,
            "json" => {
                serde_json::from_str(&contents).map_err(|e| StreamError::Config(e.to_string()))?
            }
            _ => {
                return Err(StreamError::Config(format!(
                    "Unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks limits and alias references.
    pub fn validate(&self) -> StreamResult<()> {
        fn invalid(message: &str) -> StreamResult<()> {
            Err(StreamError::Config(message.to_string()))
        }

        if self.scheduler.max_dispatch_per_tick == 0 {
            return invalid("scheduler.max_dispatch_per_tick must be positive");
        }
        if self.scheduler.idle_wait_ms == 0 {
            return invalid("scheduler.idle_wait_ms must be positive");
        }
        if self.device.max_in_flight == 0 {
            return invalid("device.max_in_flight must be positive");
        }
        if self.device.max_queued < self.device.max_in_flight {
            return invalid("device.max_queued must be at least device.max_in_flight");
        }
        if self.enable_cache && self.cache.max_entries == 0 {
            return invalid("cache.max_entries must be positive");
        }
        if self.compressor.enabled && self.compressor.max_concurrent_jobs == 0 {
            return invalid("compressor.max_concurrent_jobs must be positive");
        }
        for alias in self.aliases.keys() {
            if alias.is_empty() || alias.contains('@') {
                return Err(StreamError::Config(format!("invalid alias name {:?}", alias)));
            }
        }
        if let Some(default_alias) = &self.default_alias {
            if !self.aliases.contains_key(default_alias) {
                return Err(StreamError::Config(format!(
                    "default alias {:?} is not defined",
                    default_alias
                )));
            }
        }
        Ok(())
    }

    /// Builds the alias resolver described by this configuration.
    pub fn resolver(&self) -> AliasResolver {
        let mut resolver = AliasResolver::new();
        for (alias, root) in &self.aliases {
            resolver.set_alias(alias.clone(), root.clone());
        }
        if let Some(default_alias) = &self.default_alias {
            resolver.set_default_alias(default_alias.clone());
        }
        resolver
    }
}
