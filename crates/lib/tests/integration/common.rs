//! Shared helpers for engine integration tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_lib::cache::ArtifactStore;
use kiln_lib::rule::command::CommandRule;
use kiln_lib::{BuildEngine, EngineConfig, Rule, RuleBuilder, RuleGraph, Target};
use tempfile::TempDir;

/// A scratch cell: sources at the root, outputs under `kiln-out/`.
pub struct Cell {
  pub temp: TempDir,
}

impl Cell {
  pub fn new() -> Self {
    Self {
      temp: TempDir::new().unwrap(),
    }
  }

  pub fn root(&self) -> &Path {
    self.temp.path()
  }

  /// Write a cell-relative source file.
  pub fn write(&self, relative: &str, content: &str) {
    let path = self.root().join(relative);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
  }

  pub fn config(&self) -> EngineConfig {
    EngineConfig::new(self.root()).with_parallelism(4)
  }

  pub fn scope(&self, target: &Target) -> PathBuf {
    self.config().scope_dir(target)
  }

  /// Remove every generated output, as a clean checkout would.
  pub fn wipe_outputs(&self) {
    let out = self.config().output_root;
    if out.exists() {
      std::fs::remove_dir_all(out).unwrap();
    }
  }

  /// How many times commands wrapped with [`counted`] ran under `name`.
  pub fn runs(&self, name: &str) -> usize {
    std::fs::read_to_string(self.root().join(format!("{}.runs", name)))
      .map(|s| s.lines().count())
      .unwrap_or(0)
  }

  /// An engine over `rules` sharing `cache`.
  pub fn engine(&self, rules: Vec<Rule>, cache: Arc<dyn ArtifactStore>) -> BuildEngine {
    BuildEngine::new(RuleGraph::from_rules(rules).unwrap(), cache, self.config())
  }
}

pub fn t(s: &str) -> Target {
  s.parse().unwrap()
}

/// Prefix `cmd` with a line appended to `<cell>/<name>.runs`.
pub fn counted(name: &str, cmd: &str) -> String {
  format!("echo run >> \"$SRCDIR/{}.runs\" && {}", name, cmd)
}

pub fn genrule(target: &str, cmd: &str, srcs: &[&str], out: &str) -> RuleBuilder {
  CommandRule::new(cmd, srcs.iter().map(PathBuf::from).collect(), out).rule(t(target))
}

pub fn read(path: &Path) -> String {
  std::fs::read_to_string(path).unwrap_or_else(|e| panic!("failed to read {}: {}", path.display(), e))
}
