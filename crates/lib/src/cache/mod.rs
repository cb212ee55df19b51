//! Content-addressed artifact caches.
//!
//! A cache maps a [`RuleKey`] to the [`ArtifactBundle`] a rule produced.
//! Equal keys promise byte-identical outputs, so a hit can stand in for
//! running the rule's steps.
//!
//! Stores:
//! - [`MemoryCache`]: process-local map, mostly for tests
//! - [`DirCache`]: on-disk store with per-file hash verification
//! - [`TieredCache`]: a local store in front of a remote one

mod bundle;
mod dir;
mod memory;
mod tiered;

pub use bundle::ArtifactBundle;
pub use dir::DirCache;
pub use memory::MemoryCache;
pub use tiered::TieredCache;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::rulekey::RuleKey;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
  #[error("failed to read cache entry {key}: {message}")]
  Read { key: RuleKey, message: String },

  #[error("failed to write cache entry {key}: {message}")]
  Write { key: RuleKey, message: String },

  #[error("cache entry {key} is corrupted at {path}")]
  Corrupted { key: RuleKey, path: PathBuf },
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
  Hit(ArtifactBundle),
  Miss,
}

impl CacheLookup {
  pub fn is_hit(&self) -> bool {
    matches!(self, CacheLookup::Hit(_))
  }
}

/// A store of artifact bundles keyed by rule key.
///
/// Implementations must be safe to share between concurrently building
/// rules. A `get` error is treated by the engine as a miss; a `put` error is
/// logged and otherwise ignored.
#[async_trait]
pub trait ArtifactStore: Send + Sync + std::fmt::Debug {
  /// Short human-readable name used in logs.
  fn name(&self) -> &str;

  async fn get(&self, key: &RuleKey) -> Result<CacheLookup, CacheError>;

  async fn put(&self, key: &RuleKey, bundle: &ArtifactBundle) -> Result<(), CacheError>;
}
