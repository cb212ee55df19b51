//! Output scope containment.
//!
//! Every rule owns a private directory under the output root. Paths handed to
//! steps are relative to that directory and must never resolve outside it.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("path {path} escapes output scope {scope}")]
pub struct ScopeError {
  pub path: PathBuf,
  pub scope: PathBuf,
}

/// Normalize a scope-relative path.
///
/// Returns `None` for empty paths, absolute paths, and any path containing a
/// `..` component. `.` components are dropped.
pub fn normalize_relative(path: &Path) -> Option<PathBuf> {
  let mut normalized = PathBuf::new();
  for component in path.components() {
    match component {
      Component::Normal(part) => normalized.push(part),
      Component::CurDir => {}
      Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
    }
  }
  if normalized.as_os_str().is_empty() {
    None
  } else {
    Some(normalized)
  }
}

/// Resolve `relative` inside `scope`, rejecting anything that would escape it.
pub fn resolve_within(scope: &Path, relative: &Path) -> Result<PathBuf, ScopeError> {
  normalize_relative(relative)
    .map(|rel| scope.join(rel))
    .ok_or_else(|| ScopeError {
      path: relative.to_path_buf(),
      scope: scope.to_path_buf(),
    })
}
