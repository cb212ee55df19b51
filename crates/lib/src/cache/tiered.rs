use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{ArtifactBundle, ArtifactStore, CacheError, CacheLookup};
use crate::rulekey::RuleKey;

/// A fast local store in front of a slower shared one.
///
/// Lookups try `local` first. A remote hit is copied into `local` so the
/// next lookup stays local. Writes go to both tiers; a failing tier is
/// logged and the other still receives the entry.
#[derive(Debug, Clone)]
pub struct TieredCache {
  local: Arc<dyn ArtifactStore>,
  remote: Arc<dyn ArtifactStore>,
}

impl TieredCache {
  pub fn new(local: Arc<dyn ArtifactStore>, remote: Arc<dyn ArtifactStore>) -> Self {
    Self { local, remote }
  }
}

#[async_trait]
impl ArtifactStore for TieredCache {
  fn name(&self) -> &str {
    "tiered"
  }

  async fn get(&self, key: &RuleKey) -> Result<CacheLookup, CacheError> {
    match self.local.get(key).await {
      Ok(CacheLookup::Hit(bundle)) => return Ok(CacheLookup::Hit(bundle)),
      Ok(CacheLookup::Miss) => {}
      Err(e) => warn!(store = self.local.name(), key = %key, error = %e, "local cache lookup failed"),
    }

    let bundle = match self.remote.get(key).await {
      Ok(CacheLookup::Hit(bundle)) => bundle,
      Ok(CacheLookup::Miss) => return Ok(CacheLookup::Miss),
      Err(e) => {
        warn!(store = self.remote.name(), key = %key, error = %e, "remote cache lookup failed");
        return Ok(CacheLookup::Miss);
      }
    };

    debug!(key = %key, "remote cache hit, mirroring locally");
    if let Err(e) = self.local.put(key, &bundle).await {
      warn!(store = self.local.name(), key = %key, error = %e, "failed to mirror remote hit");
    }
    Ok(CacheLookup::Hit(bundle))
  }

  async fn put(&self, key: &RuleKey, bundle: &ArtifactBundle) -> Result<(), CacheError> {
    let (local, remote) = tokio::join!(self.local.put(key, bundle), self.remote.put(key, bundle));
    match (local, remote) {
      (Ok(()), Ok(())) => Ok(()),
      (Err(e), Ok(())) | (Ok(()), Err(e)) => {
        warn!(key = %key, error = %e, "cache tier write failed");
        Ok(())
      }
      (Err(e), Err(_)) => Err(e),
    }
  }
}
