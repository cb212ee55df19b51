//! Context handed to rule kinds when they produce their steps.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::target::Target;
use crate::util::scope::{ScopeError, resolve_within};

/// Everything a rule kind may consult while producing its steps.
///
/// All references are already resolved: input paths are absolute under the
/// cell root, and every declared dependency has finished with known output
/// locations. Extra dependencies only order the build and do not appear here.
#[derive(Debug, Clone)]
pub struct BuildContext {
  target: Target,
  cell_root: PathBuf,
  scope_dir: PathBuf,
  dependency_outputs: BTreeMap<Target, Vec<PathBuf>>,
}

impl BuildContext {
  pub fn new(
    target: Target,
    cell_root: PathBuf,
    scope_dir: PathBuf,
    dependency_outputs: BTreeMap<Target, Vec<PathBuf>>,
  ) -> Self {
    Self {
      target,
      cell_root,
      scope_dir,
      dependency_outputs,
    }
  }

  pub fn target(&self) -> &Target {
    &self.target
  }

  pub fn cell_root(&self) -> &Path {
    &self.cell_root
  }

  /// The rule's private output directory.
  pub fn scope_dir(&self) -> &Path {
    &self.scope_dir
  }

  /// Absolute path of a cell-relative input.
  pub fn input_path(&self, relative: impl AsRef<Path>) -> PathBuf {
    self.cell_root.join(relative)
  }

  /// Absolute path of a scope-relative output, rejecting escapes.
  pub fn output_path(&self, relative: impl AsRef<Path>) -> Result<PathBuf, ScopeError> {
    resolve_within(&self.scope_dir, relative.as_ref())
  }

  /// Resolved outputs of every declared dependency.
  pub fn all_dependency_outputs(&self) -> &BTreeMap<Target, Vec<PathBuf>> {
    &self.dependency_outputs
  }

  /// Resolved output locations of a declared dependency.
  pub fn dependency_outputs(&self, dep: &Target) -> &[PathBuf] {
    self.dependency_outputs.get(dep).map(Vec::as_slice).unwrap_or(&[])
  }
}
