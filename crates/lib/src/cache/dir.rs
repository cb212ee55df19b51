//! On-disk artifact store.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/<first two hex chars of key>/<key>/
//!   entry.json      manifest: format version plus each file's SHA-256
//!   files/<path>    artifact bytes, by scope-relative path
//! ```
//!
//! Entries are staged in a temporary directory next to their final location
//! and renamed into place, so readers never observe a half-written entry. A
//! complete entry is never replaced. Entries whose files no longer match
//! their manifest are moved aside, deleted and reported as misses.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ArtifactBundle, ArtifactStore, CacheError, CacheLookup};
use crate::consts::{CACHE_ENTRY_FILES, CACHE_ENTRY_MANIFEST};
use crate::rulekey::RuleKey;
use crate::util::hash::{ContentHash, hash_bytes};
use crate::util::scope::{normalize_relative, resolve_within};

const ENTRY_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct EntryManifest {
  version: u32,
  key: RuleKey,
  files: Vec<EntryFile>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryFile {
  path: PathBuf,
  sha256: ContentHash,
}

#[derive(Debug, Clone)]
pub struct DirCache {
  root: PathBuf,
}

impl DirCache {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Directory holding the entry for `key`, whether or not it exists.
  pub fn entry_dir(&self, key: &RuleKey) -> PathBuf {
    let hex = key.to_hex();
    self.root.join(&hex[..2]).join(hex)
  }

  fn get_blocking(&self, key: &RuleKey) -> Result<CacheLookup, CacheError> {
    let entry = self.entry_dir(key);
    let manifest_path = entry.join(CACHE_ENTRY_MANIFEST);

    let content = match std::fs::read_to_string(&manifest_path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(CacheLookup::Miss),
      Err(e) => return Err(read_error(key, e)),
    };

    let corrupted = match read_entry(key, &entry, &content) {
      Ok(bundle) => return Ok(CacheLookup::Hit(bundle)),
      Err(EntryError::Corrupted(err)) => err,
      Err(EntryError::Vanished(path)) => {
        // Still listed by the same manifest: the file is really gone.
        if std::fs::read_to_string(&manifest_path).ok().as_deref() != Some(content.as_str()) {
          debug!(key = %key, path = ?path, "cache entry changed while reading");
          return Ok(CacheLookup::Miss);
        }
        CacheError::Corrupted { key: *key, path }
      }
    };

    warn!(key = %key, error = %corrupted, "cache entry corrupted, discarding");
    if let Err(e) = self.discard(&entry) {
      warn!(path = ?entry, error = %e, "failed to remove corrupted cache entry");
    }
    Ok(CacheLookup::Miss)
  }

  /// Move `entry` out of the way for deletion.
  ///
  /// The moved entry sits at `entry` inside the returned directory and is
  /// deleted when that directory is dropped.
  fn discard(&self, entry: &Path) -> io::Result<tempfile::TempDir> {
    let shard = entry.parent().unwrap_or(&self.root);
    let trash = tempfile::Builder::new().prefix(".discard-").tempdir_in(shard)?;
    std::fs::rename(entry, trash.path().join("entry"))?;
    Ok(trash)
  }

  fn put_blocking(&self, key: &RuleKey, bundle: &ArtifactBundle) -> Result<(), CacheError> {
    let entry = self.entry_dir(key);
    if entry.join(CACHE_ENTRY_MANIFEST).exists() {
      debug!(key = %key, "cache entry already present");
      return Ok(());
    }

    let shard = entry.parent().unwrap_or(&self.root).to_path_buf();
    std::fs::create_dir_all(&shard).map_err(|e| write_error(key, e))?;

    let staging = tempfile::Builder::new()
      .prefix(".staging-")
      .tempdir_in(&shard)
      .map_err(|e| write_error(key, e))?;

    let files_dir = staging.path().join(CACHE_ENTRY_FILES);
    std::fs::create_dir_all(&files_dir).map_err(|e| write_error(key, e))?;

    let mut files = Vec::with_capacity(bundle.len());
    for (rel, contents) in bundle.iter() {
      let path = resolve_within(&files_dir, rel).map_err(|e| CacheError::Write {
        key: *key,
        message: e.to_string(),
      })?;
      if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| write_error(key, e))?;
      }
      std::fs::write(&path, contents).map_err(|e| write_error(key, e))?;
      files.push(EntryFile {
        path: rel.clone(),
        sha256: hash_bytes(contents),
      });
    }

    let manifest = EntryManifest {
      version: ENTRY_FORMAT_VERSION,
      key: *key,
      files,
    };
    let json = serde_json::to_string_pretty(&manifest).map_err(|e| CacheError::Write {
      key: *key,
      message: e.to_string(),
    })?;
    std::fs::write(staging.path().join(CACHE_ENTRY_MANIFEST), format!("{}\n", json))
      .map_err(|e| write_error(key, e))?;

    match std::fs::rename(staging.path(), &entry) {
      Ok(()) => return Ok(()),
      // Another writer won the race; its entry has the same content.
      Err(_) if entry.join(CACHE_ENTRY_MANIFEST).exists() => return Ok(()),
      Err(_) if entry.exists() => {}
      Err(e) => return Err(write_error(key, e)),
    }

    // A leftover without a manifest is never readable. Move it aside; if a
    // complete entry landed in between, put that one back instead.
    let trash = self.discard(&entry).map_err(|e| write_error(key, e))?;
    let taken = trash.path().join("entry");
    if taken.join(CACHE_ENTRY_MANIFEST).exists() {
      let _ = std::fs::rename(&taken, &entry);
      return Ok(());
    }
    debug!(key = %key, "replaced incomplete cache entry");

    match std::fs::rename(staging.path(), &entry) {
      Ok(()) => Ok(()),
      Err(_) if entry.join(CACHE_ENTRY_MANIFEST).exists() => Ok(()),
      Err(e) => Err(write_error(key, e)),
    }
  }
}

enum EntryError {
  /// The entry does not match its manifest.
  Corrupted(CacheError),
  /// A listed file could not be found.
  Vanished(PathBuf),
}

fn read_entry(key: &RuleKey, entry: &Path, manifest: &str) -> Result<ArtifactBundle, EntryError> {
  let corrupted = |path: &Path| {
    EntryError::Corrupted(CacheError::Corrupted {
      key: *key,
      path: path.to_path_buf(),
    })
  };
  let manifest_path = entry.join(CACHE_ENTRY_MANIFEST);

  let manifest: EntryManifest = serde_json::from_str(manifest).map_err(|_| corrupted(&manifest_path))?;
  if manifest.version != ENTRY_FORMAT_VERSION || manifest.key != *key {
    return Err(corrupted(&manifest_path));
  }

  let files_dir = entry.join(CACHE_ENTRY_FILES);
  let mut bundle = ArtifactBundle::new();
  for file in manifest.files {
    let rel = normalize_relative(&file.path).ok_or_else(|| corrupted(&manifest_path))?;
    let path = files_dir.join(&rel);
    let contents = match std::fs::read(&path) {
      Ok(contents) => contents,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(EntryError::Vanished(path)),
      Err(_) => return Err(corrupted(&path)),
    };
    if hash_bytes(&contents) != file.sha256 {
      return Err(corrupted(&path));
    }
    bundle.insert(rel, contents);
  }
  Ok(bundle)
}

fn read_error(key: &RuleKey, err: io::Error) -> CacheError {
  CacheError::Read {
    key: *key,
    message: err.to_string(),
  }
}

fn write_error(key: &RuleKey, err: io::Error) -> CacheError {
  CacheError::Write {
    key: *key,
    message: err.to_string(),
  }
}

#[async_trait]
impl ArtifactStore for DirCache {
  fn name(&self) -> &str {
    "dir"
  }

  async fn get(&self, key: &RuleKey) -> Result<CacheLookup, CacheError> {
    let this = self.clone();
    let key = *key;
    tokio::task::spawn_blocking(move || this.get_blocking(&key))
      .await
      .map_err(|e| CacheError::Read {
        key,
        message: e.to_string(),
      })?
  }

  async fn put(&self, key: &RuleKey, bundle: &ArtifactBundle) -> Result<(), CacheError> {
    let this = self.clone();
    let key = *key;
    let bundle = bundle.clone();
    tokio::task::spawn_blocking(move || this.put_blocking(&key, &bundle))
      .await
      .map_err(|e| CacheError::Write {
        key,
        message: e.to_string(),
      })?
  }
}
