//! Runs one rule's steps.
//!
//! Execution has three phases:
//! 1. pre-clean the declared outputs so stale files from an earlier,
//!    differently configured run never reach the cache
//! 2. run the steps in order, stopping at the first failure
//! 3. record the declared outputs that the engine will cache

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};
use walkdir::WalkDir;

use super::{ExecutionContext, Step, StepExecutionResult};
use crate::cancel::CancelToken;
use crate::engine::{BuildError, CancelReason};
use crate::rule::Rule;

/// Output locations produced by a successful run, as absolute paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedOutputs {
  pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct StepExecutor {
  cancel: CancelToken,
}

impl StepExecutor {
  pub fn new(cancel: CancelToken) -> Self {
    Self { cancel }
  }

  /// Run `steps` for `rule` inside `ctx`.
  ///
  /// Cancellation is checked between steps only: a running step always
  /// finishes.
  pub async fn run(
    &self,
    rule: &Rule,
    steps: &[Box<dyn Step>],
    ctx: &ExecutionContext,
  ) -> Result<RecordedOutputs, BuildError> {
    let scope = ctx.scope_dir().to_path_buf();
    tokio::fs::create_dir_all(&scope)
      .await
      .map_err(|e| BuildError::Internal(format!("failed to create {}: {}", scope.display(), e)))?;

    let outputs = rule.outputs().to_vec();
    let keep = rule.keep_on_clean().clone();
    let clean_scope = scope.clone();
    let removed = tokio::task::spawn_blocking(move || clean_outputs(&clean_scope, &outputs, &keep))
      .await
      .map_err(|e| BuildError::Internal(format!("clean task failed: {}", e)))?
      .map_err(|e| BuildError::Internal(format!("failed to clean outputs: {}", e)))?;
    if !removed.is_empty() {
      debug!(rule = %rule.target(), removed = removed.len(), "cleaned stale outputs");
    }

    for (idx, step) in steps.iter().enumerate() {
      if self.cancel.is_cancelled() {
        return Err(BuildError::Cancelled {
          reason: CancelReason::Requested,
        });
      }

      let description = step.description(ctx);
      debug!(rule = %rule.target(), step_idx = idx, step = step.short_name(), "executing step");

      if let StepExecutionResult::Failure { exit_code, message } = step.execute(ctx).await {
        return Err(BuildError::StepFailure {
          step_index: idx,
          short_name: step.short_name().to_string(),
          description,
          exit_code,
          message,
        });
      }
    }

    let mut paths = Vec::with_capacity(rule.outputs().len());
    for output in rule.outputs() {
      let absolute = scope.join(output);
      if tokio::fs::symlink_metadata(&absolute).await.is_err() {
        return Err(BuildError::MissingOutput { path: output.clone() });
      }
      paths.push(absolute);
    }

    Ok(RecordedOutputs { paths })
  }
}

/// Remove everything under the declared outputs of a scope except the paths
/// in `keep` (and anything below a kept directory).
///
/// A declared output that is a file is removed unless kept. A declared output
/// that is a directory is emptied of unkept files, pruned of directories left
/// empty, and itself left in place. Symlinks are removed, never followed, so
/// the walk cannot leave `scope`.
///
/// Returns the removed paths, relative to `scope`.
pub fn clean_outputs(scope: &Path, outputs: &[PathBuf], keep: &BTreeSet<PathBuf>) -> io::Result<Vec<PathBuf>> {
  let is_kept = |rel: &Path| keep.iter().any(|k| rel.starts_with(k));
  let mut removed = Vec::new();

  for output in outputs {
    let root = scope.join(output);
    let meta = match std::fs::symlink_metadata(&root) {
      Ok(meta) => meta,
      Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
      Err(e) => return Err(e),
    };

    if !meta.is_dir() {
      if !is_kept(output) {
        std::fs::remove_file(&root)?;
        removed.push(output.clone());
      }
      continue;
    }

    for entry in WalkDir::new(&root).follow_links(false).contents_first(true) {
      let entry = entry.map_err(io::Error::other)?;
      let path = entry.path();
      let rel = path.strip_prefix(scope).map_err(io::Error::other)?;

      if entry.file_type().is_dir() {
        if path != root && std::fs::read_dir(path)?.next().is_none() {
          trace!(path = %rel.display(), "cleaning empty directory");
          std::fs::remove_dir(path)?;
          removed.push(rel.to_path_buf());
        }
      } else if !is_kept(rel) {
        trace!(path = %rel.display(), "cleaning");
        std::fs::remove_file(path)?;
        removed.push(rel.to_path_buf());
      }
    }
  }

  Ok(removed)
}
