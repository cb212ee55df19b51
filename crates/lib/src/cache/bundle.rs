//! Artifact bundles: the value half of the cache.
//!
//! A bundle is an ordered map from scope-relative file path to file bytes.
//! It is produced by reading back exactly a rule's declared outputs and
//! written back into the same scope on a cache hit.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::util::scope::resolve_within;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactBundle {
  files: BTreeMap<PathBuf, Vec<u8>>,
}

impl ArtifactBundle {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) {
    self.files.insert(path.into(), contents.into());
  }

  pub fn get(&self, path: &Path) -> Option<&[u8]> {
    self.files.get(path).map(Vec::as_slice)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&PathBuf, &Vec<u8>)> {
    self.files.iter()
  }

  pub fn len(&self) -> usize {
    self.files.len()
  }

  pub fn is_empty(&self) -> bool {
    self.files.is_empty()
  }

  pub fn total_bytes(&self) -> u64 {
    self.files.values().map(|c| c.len() as u64).sum()
  }

  /// Read the declared `outputs` of a scope into a bundle.
  ///
  /// Directories are walked recursively; nothing outside the declared
  /// outputs is read. Symlinks are never followed, including a declared
  /// output that is itself a link: a bundle holds regular files only, so
  /// any link fails the collection.
  pub fn collect(scope: &Path, outputs: &[PathBuf]) -> io::Result<Self> {
    let mut bundle = Self::new();
    for output in outputs {
      let root = scope.join(output);
      let walk = WalkDir::new(&root).follow_links(false).follow_root_links(false).sort_by_file_name();
      for entry in walk {
        let entry = entry.map_err(io::Error::other)?;
        if entry.file_type().is_symlink() {
          return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("output {} is a symlink", entry.path().display()),
          ));
        }
        if entry.file_type().is_dir() {
          continue;
        }
        let rel = entry.path().strip_prefix(scope).map_err(io::Error::other)?;
        bundle.insert(rel, std::fs::read(entry.path())?);
      }
    }
    Ok(bundle)
  }

  /// Write this bundle into `scope`, replacing whatever the declared
  /// `outputs` currently hold.
  ///
  /// A declared output with no files in the bundle was an empty directory
  /// and is recreated as one. Entries that would land outside the scope are
  /// rejected.
  pub fn materialize(&self, scope: &Path, outputs: &[PathBuf]) -> io::Result<()> {
    for output in outputs {
      let target = scope.join(output);
      match std::fs::symlink_metadata(&target) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(&target)?,
        Ok(_) => std::fs::remove_file(&target)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
      }
    }

    for (rel, contents) in &self.files {
      let path = resolve_within(scope, rel).map_err(io::Error::other)?;
      if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
      }
      std::fs::write(&path, contents)?;
    }

    for output in outputs {
      let has_files = self.files.keys().any(|p| p.starts_with(output));
      if !has_files {
        std::fs::create_dir_all(scope.join(output))?;
      }
    }
    Ok(())
  }
}
