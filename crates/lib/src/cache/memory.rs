use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{ArtifactBundle, ArtifactStore, CacheError, CacheLookup};
use crate::rulekey::RuleKey;

/// In-process artifact store.
#[derive(Debug, Default)]
pub struct MemoryCache {
  entries: Mutex<HashMap<RuleKey, ArtifactBundle>>,
}

impl MemoryCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  pub fn contains(&self, key: &RuleKey) -> bool {
    self.lock().contains_key(key)
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<RuleKey, ArtifactBundle>> {
    self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

#[async_trait]
impl ArtifactStore for MemoryCache {
  fn name(&self) -> &str {
    "memory"
  }

  async fn get(&self, key: &RuleKey) -> Result<CacheLookup, CacheError> {
    Ok(match self.lock().get(key) {
      Some(bundle) => CacheLookup::Hit(bundle.clone()),
      None => CacheLookup::Miss,
    })
  }

  async fn put(&self, key: &RuleKey, bundle: &ArtifactBundle) -> Result<(), CacheError> {
    self.lock().insert(*key, bundle.clone());
    Ok(())
  }
}
