//! The build scheduler.
//!
//! [`BuildEngine::build`] resolves the dependency closure of the requested
//! targets and drives every rule in it through
//! `Pending -> AwaitingDependencies -> Fingerprinting -> CacheLookup ->
//! Executing -> Done`.
//!
//! Each target gets exactly one in-flight computation per engine, created by
//! the first request and shared by every later one, so a rule's steps run at
//! most once no matter how many dependents or concurrent builds ask for it.
//! Only rules that are executing steps hold one of the `parallelism` slots;
//! waiting on dependencies, fingerprinting and cache lookups do not.
//!
//! Distinct targets can share a rule key. Once fingerprinted, rules with the
//! same key pass through a per-key gate one at a time, and the outputs the
//! first one produced are recorded for the engine's lifetime, so the others
//! restore them instead of running their steps.

mod types;

pub use types::*;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{ArtifactBundle, ArtifactStore, CacheLookup, DirCache, MemoryCache, TieredCache};
use crate::cancel::CancelToken;
use crate::graph::{GraphError, RuleGraph};
use crate::rule::{BuildContext, Rule};
use crate::rulekey::{FileHashCache, RuleKey, compute_key};
use crate::step::{ExecutionContext, StepExecutor};
use crate::target::Target;

type ResultSlot = watch::Receiver<Option<Arc<BuildResult>>>;

/// Outputs recorded under one rule key, behind the lock that serializes it.
type KeyGate = Arc<tokio::sync::Mutex<Option<Arc<ArtifactBundle>>>>;

/// Handle to a build engine. Clones share all state.
#[derive(Clone)]
pub struct BuildEngine {
  inner: Arc<Inner>,
}

struct Inner {
  graph: RuleGraph,
  cache: Arc<dyn ArtifactStore>,
  config: EngineConfig,
  hashes: Arc<FileHashCache>,
  slots: Arc<Semaphore>,
  cancel: CancelToken,
  in_flight: Mutex<HashMap<Target, ResultSlot>>,
  by_key: Mutex<HashMap<RuleKey, KeyGate>>,
  subscribers: Mutex<Vec<mpsc::UnboundedSender<RuleEvent>>>,
  uploads: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for BuildEngine {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("BuildEngine")
      .field("rules", &self.inner.graph.len())
      .field("cache", &self.inner.cache.name())
      .field("parallelism", &self.inner.config.parallelism)
      .finish()
  }
}

/// Build the cache configured by `config`: the local tier is a [`DirCache`]
/// when `local_cache_dir` is set and a [`MemoryCache`] otherwise, fronting
/// `remote` when one is given.
pub fn open_cache(config: &EngineConfig, remote: Option<Arc<dyn ArtifactStore>>) -> Arc<dyn ArtifactStore> {
  let local: Arc<dyn ArtifactStore> = match &config.local_cache_dir {
    Some(dir) => Arc::new(DirCache::new(dir)),
    None => Arc::new(MemoryCache::new()),
  };
  match remote {
    Some(remote) => Arc::new(TieredCache::new(local, remote)),
    None => local,
  }
}

impl BuildEngine {
  pub fn new(graph: RuleGraph, cache: Arc<dyn ArtifactStore>, mut config: EngineConfig) -> Self {
    if let Ok(canonical) = dunce::canonicalize(&config.cell_root) {
      config.cell_root = canonical;
    }
    debug!(
      cell_root = ?config.cell_root,
      output_root = ?config.output_root,
      parallelism = config.parallelism,
      cache = cache.name(),
      "creating build engine"
    );

    let hashes = Arc::new(FileHashCache::new(config.cell_root.clone()));
    let slots = Arc::new(Semaphore::new(config.parallelism.max(1)));
    Self {
      inner: Arc::new(Inner {
        graph,
        cache,
        config,
        hashes,
        slots,
        cancel: CancelToken::new(),
        in_flight: Mutex::new(HashMap::new()),
        by_key: Mutex::new(HashMap::new()),
        subscribers: Mutex::new(Vec::new()),
        uploads: Mutex::new(Vec::new()),
      }),
    }
  }

  /// Create an engine whose cache comes from [`open_cache`].
  pub fn from_config(graph: RuleGraph, config: EngineConfig, remote: Option<Arc<dyn ArtifactStore>>) -> Self {
    let cache = open_cache(&config, remote);
    Self::new(graph, cache, config)
  }

  pub fn config(&self) -> &EngineConfig {
    &self.inner.config
  }

  pub fn graph(&self) -> &RuleGraph {
    &self.inner.graph
  }

  /// Receive a [`RuleEvent`] for every state a rule enters from now on.
  pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RuleEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    lock(&self.inner.subscribers).push(tx);
    rx
  }

  /// Cancel all current and future builds of this engine.
  ///
  /// Rules that have not started executing are reported cancelled; rules
  /// that are executing finish their current step first.
  pub fn cancel(&self) {
    info!("cancelling build");
    self.inner.cancel.cancel();
  }

  pub fn cancel_token(&self) -> CancelToken {
    self.inner.cancel.clone()
  }

  /// Build `targets` and everything they depend on.
  ///
  /// Fails only when the graph itself is unusable (unknown target, cycle);
  /// rule failures are reported per target in the returned report.
  pub async fn build(&self, targets: &[Target]) -> Result<BuildReport, GraphError> {
    let closure = self.inner.graph.transitive_closure(targets)?;
    info!(requested = targets.len(), rules = closure.len(), "starting build");

    let slots: Vec<(Target, ResultSlot)> = closure
      .into_iter()
      .map(|t| {
        let slot = self.resolve(&t);
        (t, slot)
      })
      .collect();

    let mut report = BuildReport::default();
    for (target, slot) in slots {
      let result = wait(&target, slot).await;
      report.results.insert(target, (*result).clone());
    }

    info!(
      rules = report.len(),
      built = report.count(BuildStatus::SuccessBuiltLocally),
      cached = report.count(BuildStatus::SuccessFromCache),
      failed = report.count(BuildStatus::Failed),
      cancelled = report.count(BuildStatus::Cancelled),
      "build finished"
    );
    Ok(report)
  }

  /// Wait for every background cache upload started so far.
  pub async fn wait_for_uploads(&self) {
    loop {
      let pending: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&self.inner.uploads));
      if pending.is_empty() {
        return;
      }
      for handle in pending {
        if let Err(e) = handle.await {
          warn!(error = %e, "cache upload task failed");
        }
      }
    }
  }

  /// Find or start the computation for `target`.
  ///
  /// Creating and attaching happen under one lock, so there is never more
  /// than one computation per target.
  fn resolve(&self, target: &Target) -> ResultSlot {
    let mut in_flight = lock(&self.inner.in_flight);
    if let Some(slot) = in_flight.get(target) {
      return slot.clone();
    }

    let (tx, rx) = watch::channel(None);
    in_flight.insert(target.clone(), rx.clone());
    drop(in_flight);

    self.emit(target, RuleState::Pending);
    let engine = self.clone();
    let target = target.clone();
    tokio::spawn(async move {
      let result = engine.build_rule(&target).await;
      engine.emit(&target, RuleState::Done(result.status));
      tx.send_replace(Some(Arc::new(result)));
    });
    rx
  }

  async fn build_rule(&self, target: &Target) -> BuildResult {
    let Some(rule) = self.inner.graph.get_rule(target).cloned() else {
      return BuildResult::failed(None, BuildError::Internal(format!("no rule for {}", target)));
    };

    self.emit(target, RuleState::AwaitingDependencies);
    let pending: Vec<(Target, ResultSlot)> = rule.all_deps().map(|dep| (dep.clone(), self.resolve(dep))).collect();
    let mut deps: BTreeMap<Target, Arc<BuildResult>> = BTreeMap::new();
    for (dep, slot) in pending {
      let result = wait(&dep, slot).await;
      deps.insert(dep, result);
    }

    for dep in rule.all_deps() {
      let Some(result) = deps.get(dep) else { continue };
      if result.is_success() {
        continue;
      }
      let reason = match &result.error {
        Some(BuildError::Cancelled {
          reason: CancelReason::Requested,
        }) => CancelReason::Requested,
        _ => CancelReason::DependencyFailed {
          dependency: dep.clone(),
          root_cause: result.root_cause(dep).unwrap_or(dep).clone(),
        },
      };
      warn!(rule = %target, dependency = %dep, reason = %reason, "skipping rule, dependency did not build");
      return BuildResult::cancelled(None, reason);
    }

    if self.inner.cancel.is_cancelled() {
      warn!(rule = %target, "skipping rule, build cancelled");
      return BuildResult::cancelled(None, CancelReason::Requested);
    }

    self.emit(target, RuleState::Fingerprinting);
    let key = match self.fingerprint(&rule, &deps).await {
      Ok(key) => key,
      Err(err) => {
        error!(rule = %target, error = %err, "failed to fingerprint rule");
        return BuildResult::failed(None, err);
      }
    };
    debug!(rule = %target, rule_key = %key, "computed rule key");

    let scope = self.inner.config.scope_dir(target);

    let gate = self.key_gate(key);
    let mut reusable = gate.lock().await;

    if rule.is_cacheable() {
      self.emit(target, RuleState::CacheLookup);
      let bundle = match reusable.as_ref() {
        Some(bundle) => Some(bundle.clone()),
        None => self.lookup(&rule, &key).await,
      };
      if let Some(bundle) = bundle
        && let Some(outputs) = self.restore(&rule, &key, &scope, bundle.clone()).await
      {
        info!(rule = %target, rule_key = %key, "cache hit");
        *reusable = Some(bundle);
        return BuildResult::success(BuildStatus::SuccessFromCache, key, outputs);
      }
    }

    let Ok(_permit) = self.inner.slots.clone().acquire_owned().await else {
      return BuildResult::failed(Some(key), BuildError::Internal("executor slots closed".to_string()));
    };
    if self.inner.cancel.is_cancelled() {
      warn!(rule = %target, "skipping rule, build cancelled");
      return BuildResult::cancelled(Some(key), CancelReason::Requested);
    }

    self.emit(target, RuleState::Executing);
    let dependency_outputs = rule
      .declared_deps()
      .iter()
      .filter_map(|dep| deps.get(dep).map(|result| (dep.clone(), result.outputs.clone())))
      .collect();
    let build_ctx = BuildContext::new(
      target.clone(),
      self.inner.config.cell_root.clone(),
      scope.clone(),
      dependency_outputs,
    );
    let steps = rule.steps(&build_ctx);
    let exec_ctx = ExecutionContext::new(self.inner.config.cell_root.clone(), scope.clone())
      .with_env(self.inner.config.env.clone())
      .with_shell(self.inner.config.shell.clone());

    let recorded = match StepExecutor::new(self.inner.cancel.clone()).run(&rule, &steps, &exec_ctx).await {
      Ok(recorded) => recorded,
      Err(BuildError::Cancelled { reason }) => {
        warn!(rule = %target, "rule cancelled between steps");
        return BuildResult::cancelled(Some(key), reason);
      }
      Err(err) => {
        error!(rule = %target, rule_key = %key, error = %err, "rule failed");
        return BuildResult::failed(Some(key), err);
      }
    };

    info!(rule = %target, rule_key = %key, steps = steps.len(), "built");
    if rule.is_cacheable()
      && let Some(bundle) = self.collect_outputs(&rule, &key, &scope).await
    {
      *reusable = Some(bundle.clone());
      self.upload(target, key, bundle);
    }
    BuildResult::success(BuildStatus::SuccessBuiltLocally, key, recorded.paths)
  }

  async fn fingerprint(&self, rule: &Arc<Rule>, deps: &BTreeMap<Target, Arc<BuildResult>>) -> Result<RuleKey, BuildError> {
    let mut dependency_keys = Vec::with_capacity(rule.declared_deps().len());
    for dep in rule.declared_deps() {
      let key = deps.get(dep).and_then(|r| r.rule_key).ok_or_else(|| {
        BuildError::Internal(format!("dependency {} finished without a rule key", dep))
      })?;
      dependency_keys.push(key);
    }

    let hashes = self.inner.hashes.clone();
    let hashed_rule = rule.clone();
    let inputs = tokio::task::spawn_blocking(move || hashes.hash_inputs(&hashed_rule))
      .await
      .map_err(|e| BuildError::Internal(format!("input hashing task failed: {}", e)))??;

    Ok(compute_key(rule, &dependency_keys, &inputs)?)
  }

  /// Serialization point for every rule fingerprinted to `key`.
  fn key_gate(&self, key: RuleKey) -> KeyGate {
    lock(&self.inner.by_key)
      .entry(key)
      .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
      .clone()
  }

  /// Look up `key` in the cache. Lookup errors count as a miss.
  async fn lookup(&self, rule: &Arc<Rule>, key: &RuleKey) -> Option<Arc<ArtifactBundle>> {
    match self.inner.cache.get(key).await {
      Ok(CacheLookup::Hit(bundle)) => Some(Arc::new(bundle)),
      Ok(CacheLookup::Miss) => {
        debug!(rule = %rule.target(), rule_key = %key, "cache miss");
        None
      }
      Err(e) => {
        warn!(rule = %rule.target(), rule_key = %key, error = %e, "cache lookup failed, building");
        None
      }
    }
  }

  /// Materialize `bundle` into `scope`, returning the absolute outputs.
  async fn restore(
    &self,
    rule: &Arc<Rule>,
    key: &RuleKey,
    scope: &Path,
    bundle: Arc<ArtifactBundle>,
  ) -> Option<Vec<PathBuf>> {
    let outputs = rule.outputs().to_vec();
    let restore_scope = scope.to_path_buf();
    let restored = tokio::task::spawn_blocking(move || bundle.materialize(&restore_scope, &outputs)).await;
    match restored {
      Ok(Ok(())) => Some(rule.outputs().iter().map(|o| scope.join(o)).collect()),
      Ok(Err(e)) => {
        warn!(rule = %rule.target(), rule_key = %key, error = %e, "failed to restore cached outputs, building");
        None
      }
      Err(e) => {
        warn!(rule = %rule.target(), rule_key = %key, error = %e, "restore task failed, building");
        None
      }
    }
  }

  /// Read back the rule's declared outputs after a local build.
  async fn collect_outputs(&self, rule: &Arc<Rule>, key: &RuleKey, scope: &Path) -> Option<Arc<ArtifactBundle>> {
    let outputs = rule.outputs().to_vec();
    let scope = scope.to_path_buf();
    let collected = tokio::task::spawn_blocking(move || ArtifactBundle::collect(&scope, &outputs)).await;
    match collected {
      Ok(Ok(bundle)) => Some(Arc::new(bundle)),
      Ok(Err(e)) => {
        report_write_failure(rule.target(), key, e.to_string());
        None
      }
      Err(e) => {
        report_write_failure(rule.target(), key, e.to_string());
        None
      }
    }
  }

  /// Store `bundle` under `key` in the background.
  fn upload(&self, target: &Target, key: RuleKey, bundle: Arc<ArtifactBundle>) {
    let cache = self.inner.cache.clone();
    let target = target.clone();

    let handle = tokio::spawn(async move {
      match cache.put(&key, &bundle).await {
        Ok(()) => debug!(rule = %target, rule_key = %key, files = bundle.len(), "stored in cache"),
        Err(e) => report_write_failure(&target, &key, e.to_string()),
      }
    });
    lock(&self.inner.uploads).push(handle);
  }

  fn emit(&self, target: &Target, state: RuleState) {
    debug!(rule = %target, state = ?state, "rule state");
    let event = RuleEvent {
      target: target.clone(),
      state,
    };
    lock(&self.inner.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
  }
}

fn report_write_failure(target: &Target, key: &RuleKey, message: String) {
  let err = BuildError::CacheWriteFailure { message };
  warn!(rule = %target, rule_key = %key, error = %err, "failed to store outputs in cache");
}

async fn wait(target: &Target, mut slot: ResultSlot) -> Arc<BuildResult> {
  let finished = match slot.wait_for(Option::is_some).await {
    Ok(value) => value.clone(),
    Err(_) => None,
  };
  finished.unwrap_or_else(|| {
    Arc::new(BuildResult::failed(
      None,
      BuildError::Internal(format!("build of {} ended without a result", target)),
    ))
  })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
