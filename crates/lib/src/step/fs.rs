//! Filesystem steps.
//!
//! Every path a step writes or deletes is relative to the rule's output scope
//! and resolved through [`ExecutionContext::scoped`], so a step can never
//! modify anything outside the scope it belongs to.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, error};
use walkdir::WalkDir;

use super::{ExecutionContext, Step, StepExecutionResult};

fn io_failure(action: &str, path: &Path, err: io::Error) -> StepExecutionResult {
  error!(path = %path.display(), error = %err, "{} failed", action);
  StepExecutionResult::failure(format!("{} {}: {}", action, path.display(), err))
}

/// Delete a file, or a directory tree when `recursive` is set.
#[derive(Debug, Clone)]
pub struct RmStep {
  path: PathBuf,
  recursive: bool,
}

impl RmStep {
  pub fn file(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      recursive: false,
    }
  }

  pub fn recursive(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      recursive: true,
    }
  }
}

#[async_trait]
impl Step for RmStep {
  fn short_name(&self) -> &str {
    "rm"
  }

  fn description(&self, _ctx: &ExecutionContext) -> String {
    let flags = if self.recursive { "-f -r" } else { "-f" };
    format!("rm {} {}", flags, self.path.display())
  }

  async fn execute(&self, ctx: &ExecutionContext) -> StepExecutionResult {
    let absolute = match ctx.scoped(&self.path) {
      Ok(p) => p,
      Err(e) => return e.into(),
    };

    let result = if self.recursive {
      fs::remove_dir_all(&absolute).await
    } else {
      fs::remove_file(&absolute).await
    };

    match result {
      Ok(()) => StepExecutionResult::Success,
      Err(e) if e.kind() == io::ErrorKind::NotFound => StepExecutionResult::Success,
      Err(e) => io_failure("rm", &absolute, e),
    }
  }
}

/// Create a directory and all of its parents.
#[derive(Debug, Clone)]
pub struct MkdirStep {
  path: PathBuf,
}

impl MkdirStep {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }
}

#[async_trait]
impl Step for MkdirStep {
  fn short_name(&self) -> &str {
    "mkdir"
  }

  fn description(&self, _ctx: &ExecutionContext) -> String {
    format!("mkdir -p {}", self.path.display())
  }

  async fn execute(&self, ctx: &ExecutionContext) -> StepExecutionResult {
    let absolute = match ctx.scoped(&self.path) {
      Ok(p) => p,
      Err(e) => return e.into(),
    };
    match fs::create_dir_all(&absolute).await {
      Ok(()) => StepExecutionResult::Success,
      Err(e) => io_failure("mkdir", &absolute, e),
    }
  }
}

/// Write fixed contents to a file, creating parent directories.
#[derive(Debug, Clone)]
pub struct WriteFileStep {
  path: PathBuf,
  contents: Vec<u8>,
}

impl WriteFileStep {
  pub fn new(path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Self {
    Self {
      path: path.into(),
      contents: contents.into(),
    }
  }
}

#[async_trait]
impl Step for WriteFileStep {
  fn short_name(&self) -> &str {
    "write"
  }

  fn description(&self, _ctx: &ExecutionContext) -> String {
    format!("write {} bytes to {}", self.contents.len(), self.path.display())
  }

  async fn execute(&self, ctx: &ExecutionContext) -> StepExecutionResult {
    let absolute = match ctx.scoped(&self.path) {
      Ok(p) => p,
      Err(e) => return e.into(),
    };
    if let Some(parent) = absolute.parent()
      && let Err(e) = fs::create_dir_all(parent).await
    {
      return io_failure("mkdir", parent, e);
    }
    match fs::write(&absolute, &self.contents).await {
      Ok(()) => StepExecutionResult::Success,
      Err(e) => io_failure("write", &absolute, e),
    }
  }
}

/// Copy an already-resolved source (file or directory) into the scope.
#[derive(Debug, Clone)]
pub struct CopyStep {
  from: PathBuf,
  to: PathBuf,
}

impl CopyStep {
  /// `from` is absolute (an input or a dependency output); `to` is
  /// scope-relative.
  pub fn new(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
    Self {
      from: from.into(),
      to: to.into(),
    }
  }
}

#[async_trait]
impl Step for CopyStep {
  fn short_name(&self) -> &str {
    "cp"
  }

  fn description(&self, _ctx: &ExecutionContext) -> String {
    format!("cp -r {} {}", self.from.display(), self.to.display())
  }

  async fn execute(&self, ctx: &ExecutionContext) -> StepExecutionResult {
    let destination = match ctx.scoped(&self.to) {
      Ok(p) => p,
      Err(e) => return e.into(),
    };
    let from = self.from.clone();
    let copy = tokio::task::spawn_blocking(move || copy_tree(&from, &destination)).await;

    match copy {
      Ok(Ok(count)) => {
        debug!(from = %self.from.display(), files = count, "copied");
        StepExecutionResult::Success
      }
      Ok(Err(e)) => io_failure("cp", &self.from, e),
      Err(e) => StepExecutionResult::failure(format!("copy task failed: {}", e)),
    }
  }
}

fn copy_tree(from: &Path, to: &Path) -> io::Result<usize> {
  if !std::fs::metadata(from)?.is_dir() {
    if let Some(parent) = to.parent() {
      std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(from, to)?;
    return Ok(1);
  }

  let mut count = 0;
  for entry in WalkDir::new(from).sort_by_file_name() {
    let entry = entry.map_err(io::Error::other)?;
    let rel = entry.path().strip_prefix(from).map_err(io::Error::other)?;
    let target = to.join(rel);
    if entry.file_type().is_dir() {
      std::fs::create_dir_all(&target)?;
    } else {
      std::fs::copy(entry.path(), &target)?;
      count += 1;
    }
  }
  Ok(count)
}
