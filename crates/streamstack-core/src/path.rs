//! Canonical request paths and alias resolution.
//!
//! A [`RequestPath`] is the identity of a file throughout the pipeline. It is
//! built once when a request is created, either from an absolute path or from
//! an `@alias@`-prefixed path resolved through a [`PathResolver`], and carries
//! a precomputed hash used as the fast path for cache lookups.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{StreamError, StreamResult};

/// Resolves alias-relative paths into absolute paths.
pub trait PathResolver: Send + Sync {
    /// Resolve `path` (e.g. `@assets@/textures/a.dds`) into an absolute path.
    fn resolve(&self, path: &str) -> StreamResult<String>;
}

/// Splits `@alias@rest` into `("alias", "rest")`.
fn split_alias(path: &str) -> Option<(&str, &str)> {
    let stripped = path.strip_prefix('@')?;
    let end = stripped.find('@')?;
    if end == 0 {
        return None;
    }
    Some((&stripped[..end], &stripped[end + 1..]))
}

/// Normalizes separators and strips leading separators from a relative suffix.
fn normalize_relative(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches('/').to_string()
}

/// Alias table resolver: maps `@alias@` tokens to root directories.
#[derive(Debug, Clone, Default)]
pub struct AliasResolver {
    aliases: HashMap<String, String>,
    default_alias: Option<String>,
}

impl AliasResolver {
    /// Creates an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an alias mapping, returning the resolver for chaining.
    pub fn with_alias(mut self, alias: impl Into<String>, root: impl Into<String>) -> Self {
        self.set_alias(alias, root);
        self
    }

    /// Adds or replaces an alias mapping.
    pub fn set_alias(&mut self, alias: impl Into<String>, root: impl Into<String>) {
        let root = root.into().replace('\\', "/");
        let root = match root.trim_end_matches('/') {
            "" => "/".to_string(),
            trimmed => trimmed.to_string(),
        };
        self.aliases.insert(alias.into(), root);
    }

    /// Sets the alias used for paths without an `@alias@` prefix.
    pub fn set_default_alias(&mut self, alias: impl Into<String>) {
        self.default_alias = Some(alias.into());
    }

    /// Returns the root directory for `alias`, if registered.
    pub fn root(&self, alias: &str) -> Option<&str> {
        self.aliases.get(alias).map(String::as_str)
    }
}

impl PathResolver for AliasResolver {
    fn resolve(&self, path: &str) -> StreamResult<String> {
        let (alias, rest) = match split_alias(path) {
            Some(parts) => parts,
            None => match &self.default_alias {
                Some(alias) => (alias.as_str(), path),
                None => {
                    return Err(StreamError::PathResolution {
                        path: path.to_string(),
                        reason: "no alias prefix and no default alias configured".to_string(),
                    })
                }
            },
        };

        let root = self.aliases.get(alias).ok_or_else(|| StreamError::PathResolution {
            path: path.to_string(),
            reason: format!("unknown alias '@{}@'", alias),
        })?;

        let rest = normalize_relative(rest);
        if rest.is_empty() {
            return Ok(root.clone());
        }
        if root.ends_with('/') {
            Ok(format!("{}{}", root, rest))
        } else {
            Ok(format!("{}/{}", root, rest))
        }
    }
}

/// Canonical, hashed file identity used as the cache key throughout the pipeline.
///
/// Equality checks the hash first and then the full string; two paths whose
/// hashes collide are never considered equal.
#[derive(Clone)]
pub struct RequestPath {
    absolute: Arc<str>,
    hash: u64,
    relative_offset: usize,
}

impl RequestPath {
    /// Builds a path from an absolute path string, stored verbatim.
    pub fn from_absolute(path: &str) -> Self {
        Self {
            absolute: Arc::from(path),
            hash: xxh3_64(path.as_bytes()),
            relative_offset: 0,
        }
    }

    /// Builds a path from an alias-relative path, resolving it through `resolver`.
    pub fn from_relative(path: &str, resolver: &dyn PathResolver) -> StreamResult<Self> {
        let absolute = resolver.resolve(path)?;
        let relative = match split_alias(path) {
            Some((_, rest)) => normalize_relative(rest),
            None => normalize_relative(path),
        };
        let relative_offset = if !relative.is_empty() && absolute.ends_with(relative.as_str()) {
            absolute.len() - relative.len()
        } else {
            absolute.len()
        };

        debug!(path, absolute = %absolute, "resolved request path");

        Ok(Self {
            hash: xxh3_64(absolute.as_bytes()),
            absolute: Arc::from(absolute),
            relative_offset,
        })
    }

    /// Builds a path from user input: absolute paths are taken verbatim,
    /// everything else goes through the resolver.
    pub fn parse(path: &str, resolver: &dyn PathResolver) -> StreamResult<Self> {
        if !path.starts_with('@') && (path.starts_with('/') || Path::new(path).is_absolute()) {
            Ok(Self::from_absolute(path))
        } else {
            Self::from_relative(path, resolver)
        }
    }

    /// Returns the absolute path string.
    #[inline]
    pub fn absolute_path(&self) -> &str {
        &self.absolute
    }

    /// Returns the suffix of the absolute path that was relative to the alias.
    #[inline]
    pub fn relative_path(&self) -> &str {
        &self.absolute[self.relative_offset..]
    }

    /// Returns the precomputed hash.
    #[inline]
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// Returns true unless the path is empty (default or cleared).
    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.absolute.is_empty()
    }

    /// Resets the path to the invalid empty state.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    #[cfg(test)]
    pub(crate) fn with_forced_hash(path: &str, hash: u64) -> Self {
        Self {
            absolute: Arc::from(path),
            hash,
            relative_offset: 0,
        }
    }
}

impl Default for RequestPath {
    fn default() -> Self {
        Self {
            absolute: Arc::from(""),
            hash: 0,
            relative_offset: 0,
        }
    }
}

impl PartialEq for RequestPath {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.absolute == other.absolute
    }
}

impl Eq for RequestPath {}

impl Hash for RequestPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Debug for RequestPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestPath({:?}, {:#018x})", &*self.absolute, self.hash)
    }
}

impl fmt::Display for RequestPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.absolute)
    }
}
