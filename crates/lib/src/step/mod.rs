//! Steps: atomic, idempotent units of executable work.
//!
//! Each step belongs to exactly one rule. Steps of a rule run strictly in
//! order and the first failure aborts the rest.
//!
//! # Submodules
//!
//! - [`executor`] - runs a rule's steps inside its output scope
//! - [`fs`] - filesystem steps (`rm`, `mkdir`, `write`, `cp`)
//! - [`shell`] - isolated shell command step

pub mod executor;
pub mod fs;
pub mod shell;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::util::scope::{ScopeError, resolve_within};

pub use executor::StepExecutor;
pub use fs::{CopyStep, MkdirStep, RmStep, WriteFileStep};
pub use shell::ShellStep;

/// Outcome of executing one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepExecutionResult {
  Success,
  Failure { exit_code: Option<i32>, message: String },
}

impl StepExecutionResult {
  pub fn failure(message: impl Into<String>) -> Self {
    StepExecutionResult::Failure {
      exit_code: None,
      message: message.into(),
    }
  }

  pub fn is_success(&self) -> bool {
    matches!(self, StepExecutionResult::Success)
  }
}

impl From<ScopeError> for StepExecutionResult {
  fn from(err: ScopeError) -> Self {
    StepExecutionResult::failure(err.to_string())
  }
}

#[async_trait]
pub trait Step: Send + Sync + fmt::Debug {
  /// Short identifier used in logs, e.g. `rm` or `shell`.
  fn short_name(&self) -> &str;

  /// Human-readable description, surfaced when the step fails.
  fn description(&self, ctx: &ExecutionContext) -> String;

  async fn execute(&self, ctx: &ExecutionContext) -> StepExecutionResult;
}

/// Resolved environment in which a rule's steps run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
  cell_root: PathBuf,
  scope_dir: PathBuf,
  env: BTreeMap<String, String>,
  shell: Option<String>,
}

impl ExecutionContext {
  pub fn new(cell_root: PathBuf, scope_dir: PathBuf) -> Self {
    Self {
      cell_root,
      scope_dir,
      env: BTreeMap::new(),
      shell: None,
    }
  }

  pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
    self.env = env;
    self
  }

  pub fn with_shell(mut self, shell: Option<String>) -> Self {
    self.shell = shell;
    self
  }

  pub fn cell_root(&self) -> &Path {
    &self.cell_root
  }

  /// The rule's private output directory; also the working directory.
  pub fn scope_dir(&self) -> &Path {
    &self.scope_dir
  }

  pub fn env(&self) -> &BTreeMap<String, String> {
    &self.env
  }

  pub fn shell(&self) -> Option<&str> {
    self.shell.as_deref()
  }

  /// Resolve a scope-relative path; anything escaping the scope is rejected.
  pub fn scoped(&self, relative: &Path) -> Result<PathBuf, ScopeError> {
    resolve_within(&self.scope_dir, relative)
  }
}
