use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use super::FingerprintError;
use crate::rule::Rule;
use crate::target::Target;
use crate::util::hash::{ContentHash, HashError, hash_directory, hash_file};

/// Content hashes of a rule's input files, keyed by cell-relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputHashes {
  hashes: BTreeMap<PathBuf, ContentHash>,
}

impl InputHashes {
  pub fn insert(&mut self, path: PathBuf, hash: ContentHash) {
    self.hashes.insert(path, hash);
  }

  pub fn get(&self, path: &Path) -> Option<&ContentHash> {
    self.hashes.get(path)
  }

  pub fn len(&self) -> usize {
    self.hashes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.hashes.is_empty()
  }

  pub(super) fn require(&self, target: &Target, path: &Path) -> Result<&ContentHash, FingerprintError> {
    self.get(path).ok_or_else(|| FingerprintError::UnhashableInput {
      target: target.clone(),
      path: path.display().to_string(),
      message: "no content hash was computed for this input".to_string(),
    })
  }
}

/// Memoizing content hasher for input files under one cell root.
///
/// One instance lives as long as a build engine, so an input shared by many
/// rules is read from disk once.
#[derive(Debug)]
pub struct FileHashCache {
  cell_root: PathBuf,
  hashes: Mutex<HashMap<PathBuf, ContentHash>>,
}

impl FileHashCache {
  pub fn new(cell_root: impl Into<PathBuf>) -> Self {
    Self {
      cell_root: cell_root.into(),
      hashes: Mutex::new(HashMap::new()),
    }
  }

  pub fn cell_root(&self) -> &Path {
    &self.cell_root
  }

  /// Hash one cell-relative file or directory.
  pub fn hash(&self, relative: &Path) -> Result<ContentHash, HashError> {
    let absolute = self.cell_root.join(relative);

    if let Some(hash) = self.lock().get(&absolute) {
      return Ok(hash.clone());
    }

    let hash = match std::fs::metadata(&absolute) {
      Ok(meta) if meta.is_dir() => hash_directory(&absolute, &[])?,
      Ok(_) => hash_file(&absolute)?,
      Err(e) => {
        return Err(HashError::ReadFile {
          path: absolute.display().to_string(),
          message: e.to_string(),
        });
      }
    };
    debug!(path = %relative.display(), hash = %hash, "hashed input");

    self.lock().insert(absolute, hash.clone());
    Ok(hash)
  }

  /// Hash every input file referenced by `rule`'s key fields.
  pub fn hash_inputs(&self, rule: &Rule) -> Result<InputHashes, FingerprintError> {
    let mut inputs = InputHashes::default();
    for path in rule.input_files() {
      let hash = self.hash(path).map_err(|e| FingerprintError::UnhashableInput {
        target: rule.target().clone(),
        path: path.display().to_string(),
        message: e.to_string(),
      })?;
      inputs.insert(path.clone(), hash);
    }
    Ok(inputs)
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, ContentHash>> {
    // The map is only ever inserted into; a poisoned guard still holds valid data.
    self.hashes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}
