//! Types for build scheduling.
//!
//! This module defines the per-rule states and results, the aggregate
//! report returned from [`super::BuildEngine::build`], and engine
//! configuration.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

use crate::consts::{DEFAULT_OUT_DIR, ENV_CACHE_DIR, ENV_JOBS, ENV_OUT_DIR, ENV_SHELL, GEN_DIR};
use crate::rulekey::{FingerprintError, RuleKey};
use crate::target::Target;

/// Terminal status of one rule in one build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildStatus {
  SuccessFromCache,
  SuccessBuiltLocally,
  Failed,
  Cancelled,
}

impl BuildStatus {
  pub fn is_success(self) -> bool {
    matches!(self, BuildStatus::SuccessFromCache | BuildStatus::SuccessBuiltLocally)
  }
}

impl fmt::Display for BuildStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      BuildStatus::SuccessFromCache => "cached",
      BuildStatus::SuccessBuiltLocally => "built",
      BuildStatus::Failed => "failed",
      BuildStatus::Cancelled => "cancelled",
    };
    f.write_str(s)
  }
}

/// Lifecycle of a rule inside the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleState {
  Pending,
  AwaitingDependencies,
  Fingerprinting,
  CacheLookup,
  Executing,
  Done(BuildStatus),
}

/// Progress notification: `target` entered `state`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleEvent {
  pub target: Target,
  pub state: RuleState,
}

/// Why a rule was cancelled instead of attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
  /// The build was cancelled by its caller.
  Requested,
  /// A dependency failed or was itself cancelled.
  DependencyFailed {
    /// The direct dependency that did not succeed.
    dependency: Target,
    /// The rule whose failure started the chain.
    root_cause: Target,
  },
}

impl fmt::Display for CancelReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CancelReason::Requested => f.write_str("build cancelled"),
      CancelReason::DependencyFailed { dependency, root_cause } if dependency == root_cause => {
        write!(f, "dependency {} failed", dependency)
      }
      CancelReason::DependencyFailed { dependency, root_cause } => {
        write!(f, "dependency {} did not build (caused by {})", dependency, root_cause)
      }
    }
  }
}

/// Errors attached to a rule's build result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
  /// A declared input could not be read while computing the rule key.
  #[error("unhashable input {path}: {message}")]
  UnhashableInput { path: String, message: String },

  /// A step reported failure; remaining steps were not run.
  #[error("step {step_index} ({short_name}) failed: {description}: {message}")]
  StepFailure {
    step_index: usize,
    short_name: String,
    description: String,
    exit_code: Option<i32>,
    message: String,
  },

  /// Every step succeeded but a declared output was not produced.
  #[error("declared output {path} was not produced")]
  MissingOutput { path: PathBuf },

  /// Writing to the artifact cache failed. Logged, never fails a rule.
  #[error("cache write failed: {message}")]
  CacheWriteFailure { message: String },

  #[error("cancelled: {reason}")]
  Cancelled { reason: CancelReason },

  /// The engine itself misbehaved (I/O around steps, a panicked task).
  #[error("internal error: {0}")]
  Internal(String),
}

impl From<FingerprintError> for BuildError {
  fn from(err: FingerprintError) -> Self {
    match err {
      FingerprintError::UnhashableInput { path, message, .. } => BuildError::UnhashableInput { path, message },
      other => BuildError::Internal(other.to_string()),
    }
  }
}

/// Result of building a single rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
  pub status: BuildStatus,

  /// Known for every rule that got past fingerprinting.
  pub rule_key: Option<RuleKey>,

  /// Absolute paths of the rule's declared outputs (empty unless successful).
  pub outputs: Vec<PathBuf>,

  pub error: Option<BuildError>,
}

impl BuildResult {
  pub fn success(status: BuildStatus, rule_key: RuleKey, outputs: Vec<PathBuf>) -> Self {
    Self {
      status,
      rule_key: Some(rule_key),
      outputs,
      error: None,
    }
  }

  pub fn failed(rule_key: Option<RuleKey>, error: BuildError) -> Self {
    Self {
      status: BuildStatus::Failed,
      rule_key,
      outputs: Vec::new(),
      error: Some(error),
    }
  }

  pub fn cancelled(rule_key: Option<RuleKey>, reason: CancelReason) -> Self {
    Self {
      status: BuildStatus::Cancelled,
      rule_key,
      outputs: Vec::new(),
      error: Some(BuildError::Cancelled { reason }),
    }
  }

  pub fn is_success(&self) -> bool {
    self.status.is_success()
  }

  /// The rule at the origin of this result's failure chain, if any.
  pub fn root_cause<'a>(&'a self, me: &'a Target) -> Option<&'a Target> {
    match (&self.status, &self.error) {
      (BuildStatus::Failed, _) => Some(me),
      (
        BuildStatus::Cancelled,
        Some(BuildError::Cancelled {
          reason: CancelReason::DependencyFailed { root_cause, .. },
        }),
      ) => Some(root_cause),
      _ => None,
    }
  }
}

/// Terminal result of every requested and transitively required rule.
#[derive(Debug, Clone, Default)]
pub struct BuildReport {
  pub results: BTreeMap<Target, BuildResult>,
}

impl BuildReport {
  pub fn get(&self, target: &Target) -> Option<&BuildResult> {
    self.results.get(target)
  }

  /// True when no rule failed or was cancelled.
  pub fn is_success(&self) -> bool {
    self.results.values().all(BuildResult::is_success)
  }

  /// Rules that failed themselves, with their error.
  pub fn failures(&self) -> impl Iterator<Item = (&Target, &BuildError)> {
    self.results.iter().filter_map(|(target, result)| match (&result.status, &result.error) {
      (BuildStatus::Failed, Some(err)) => Some((target, err)),
      _ => None,
    })
  }

  /// Every rule cancelled because `failed` did not build, directly or through
  /// other cancelled rules.
  pub fn cancelled_by(&self, failed: &Target) -> BTreeSet<Target> {
    self
      .results
      .iter()
      .filter(|(target, result)| {
        result.status == BuildStatus::Cancelled && result.root_cause(target) == Some(failed)
      })
      .map(|(target, _)| target.clone())
      .collect()
  }

  pub fn count(&self, status: BuildStatus) -> usize {
    self.results.values().filter(|r| r.status == status).count()
  }

  pub fn len(&self) -> usize {
    self.results.len()
  }

  pub fn is_empty(&self) -> bool {
    self.results.is_empty()
  }
}

/// Configuration for a build engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
  /// Maximum number of rules executing steps at the same time.
  pub parallelism: usize,

  /// Root of the source tree; cell-relative inputs resolve against it.
  pub cell_root: PathBuf,

  /// Root of all generated outputs.
  pub output_root: PathBuf,

  /// On-disk local cache. `None` keeps the local tier in memory.
  pub local_cache_dir: Option<PathBuf>,

  /// Shell override for shell steps.
  pub shell: Option<String>,

  /// Environment passed to every step.
  pub env: BTreeMap<String, String>,
}

impl EngineConfig {
  pub fn new(cell_root: impl Into<PathBuf>) -> Self {
    let cell_root = cell_root.into();
    let mut env = BTreeMap::new();
    if let Ok(path) = std::env::var("PATH") {
      env.insert("PATH".to_string(), path);
    }
    Self {
      parallelism: num_cpus(),
      output_root: cell_root.join(DEFAULT_OUT_DIR),
      cell_root,
      local_cache_dir: None,
      shell: None,
      env,
    }
  }

  /// Like [`EngineConfig::new`], then apply `KILN_*` environment overrides.
  pub fn from_env(cell_root: impl Into<PathBuf>) -> Self {
    let mut config = Self::new(cell_root);

    if let Ok(jobs) = std::env::var(ENV_JOBS) {
      match jobs.parse::<usize>() {
        Ok(n) if n > 0 => config.parallelism = n,
        _ => warn!(var = ENV_JOBS, value = %jobs, "ignoring invalid parallelism"),
      }
    }
    if let Some(out) = std::env::var_os(ENV_OUT_DIR) {
      config.output_root = config.cell_root.join(out);
    }
    if let Some(cache) = std::env::var_os(ENV_CACHE_DIR) {
      config.local_cache_dir = Some(config.cell_root.join(cache));
    }
    if let Ok(shell) = std::env::var(ENV_SHELL)
      && !shell.is_empty()
    {
      config.shell = Some(shell);
    }

    config
  }

  pub fn with_parallelism(mut self, parallelism: usize) -> Self {
    self.parallelism = parallelism.max(1);
    self
  }

  pub fn with_output_root(mut self, output_root: impl Into<PathBuf>) -> Self {
    self.output_root = output_root.into();
    self
  }

  pub fn with_local_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.local_cache_dir = Some(dir.into());
    self
  }

  /// Use the per-user cache directory as the local tier, when one is known.
  pub fn with_user_cache(mut self) -> Self {
    if let Some(dir) = crate::paths::default_artifact_cache_dir() {
      self.local_cache_dir = Some(dir);
    }
    self
  }

  /// Private output directory of `target`.
  pub fn scope_dir(&self, target: &Target) -> PathBuf {
    self.output_root.join(GEN_DIR).join(target.scope_dir())
  }

  pub fn cell_root(&self) -> &Path {
    &self.cell_root
  }
}

fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}
