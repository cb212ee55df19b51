use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use super::context::BuildContext;
use super::field::{KeyField, KeyValue};
use crate::step::Step;
use crate::target::Target;
use crate::util::scope::normalize_relative;

/// Behavior specific to one kind of rule (compile, link, package, ...).
///
/// A kind contributes a stable type tag, which is hashed into the rule key,
/// and the ordered steps that produce the rule's outputs.
pub trait RuleKind: Send + Sync + fmt::Debug {
  fn type_tag(&self) -> &str;

  fn steps(&self, ctx: &BuildContext) -> Vec<Box<dyn Step>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
  #[error("{target}: output {path} escapes the rule's output scope")]
  OutputOutsideScope { target: Target, path: PathBuf },

  #[error("{target}: input {path} is not inside the cell")]
  InputOutsideCell { target: Target, path: PathBuf },

  #[error("{0}: a rule cannot depend on itself")]
  SelfDependency(Target),

  #[error("{target}: key field {name:?} declared twice")]
  DuplicateField { target: Target, name: String },
}

/// A frozen node of the rule graph.
///
/// Built once through [`RuleBuilder`] and never mutated afterwards. Cheap to
/// clone: the kind is shared.
#[derive(Debug, Clone)]
pub struct Rule {
  target: Target,
  kind: Arc<dyn RuleKind>,
  declared_deps: Vec<Target>,
  extra_deps: BTreeSet<Target>,
  fields: Vec<KeyField>,
  outputs: Vec<PathBuf>,
  keep_on_clean: BTreeSet<PathBuf>,
  input_files: BTreeSet<PathBuf>,
  cacheable: bool,
}

impl Rule {
  pub fn builder(target: Target, kind: Arc<dyn RuleKind>) -> RuleBuilder {
    RuleBuilder::new(target, kind)
  }

  pub fn target(&self) -> &Target {
    &self.target
  }

  pub fn type_tag(&self) -> &str {
    self.kind.type_tag()
  }

  pub fn kind(&self) -> &Arc<dyn RuleKind> {
    &self.kind
  }

  /// Dependencies whose rule keys feed this rule's key, in declaration order.
  pub fn declared_deps(&self) -> &[Target] {
    &self.declared_deps
  }

  /// Ordering-only dependencies. They never contribute to the rule key.
  pub fn extra_deps(&self) -> &BTreeSet<Target> {
    &self.extra_deps
  }

  /// Declared dependencies followed by extra dependencies.
  pub fn all_deps(&self) -> impl Iterator<Item = &Target> {
    self.declared_deps.iter().chain(self.extra_deps.iter())
  }

  pub fn fields(&self) -> &[KeyField] {
    &self.fields
  }

  /// Declared output locations, relative to the rule's output scope.
  pub fn outputs(&self) -> &[PathBuf] {
    &self.outputs
  }

  /// Paths under the declared outputs that survive pre-execution cleaning.
  pub fn keep_on_clean(&self) -> &BTreeSet<PathBuf> {
    &self.keep_on_clean
  }

  /// Every cell-relative file referenced from a key field.
  pub fn input_files(&self) -> &BTreeSet<PathBuf> {
    &self.input_files
  }

  pub fn is_cacheable(&self) -> bool {
    self.cacheable
  }

  pub fn steps(&self, ctx: &BuildContext) -> Vec<Box<dyn Step>> {
    self.kind.steps(ctx)
  }
}

/// Immutable-style builder for [`Rule`].
#[derive(Debug)]
pub struct RuleBuilder {
  target: Target,
  kind: Arc<dyn RuleKind>,
  declared_deps: Vec<Target>,
  extra_deps: BTreeSet<Target>,
  fields: Vec<KeyField>,
  outputs: Vec<PathBuf>,
  keep_on_clean: Vec<PathBuf>,
  cacheable: bool,
}

impl RuleBuilder {
  pub fn new(target: Target, kind: Arc<dyn RuleKind>) -> Self {
    Self {
      target,
      kind,
      declared_deps: Vec::new(),
      extra_deps: BTreeSet::new(),
      fields: Vec::new(),
      outputs: Vec::new(),
      keep_on_clean: Vec::new(),
      cacheable: true,
    }
  }

  pub fn declared_dep(mut self, dep: Target) -> Self {
    self.declared_deps.push(dep);
    self
  }

  pub fn declared_deps(mut self, deps: impl IntoIterator<Item = Target>) -> Self {
    self.declared_deps.extend(deps);
    self
  }

  pub fn extra_dep(mut self, dep: Target) -> Self {
    self.extra_deps.insert(dep);
    self
  }

  pub fn field(mut self, name: &str, value: impl Into<KeyValue>) -> Self {
    self.fields.push(KeyField {
      name: name.to_string(),
      value: value.into(),
    });
    self
  }

  pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
    self.outputs.push(path.into());
    self
  }

  pub fn keep_on_clean(mut self, path: impl Into<PathBuf>) -> Self {
    self.keep_on_clean.push(path.into());
    self
  }

  pub fn cacheable(mut self, cacheable: bool) -> Self {
    self.cacheable = cacheable;
    self
  }

  /// Validate and freeze the rule.
  pub fn build(self) -> Result<Rule, RuleError> {
    let target = self.target;

    if self.declared_deps.contains(&target) || self.extra_deps.contains(&target) {
      return Err(RuleError::SelfDependency(target));
    }

    let mut seen = HashSet::new();
    let declared_deps: Vec<Target> = self
      .declared_deps
      .into_iter()
      .filter(|dep| seen.insert(dep.clone()))
      .collect();
    let extra_deps: BTreeSet<Target> = self
      .extra_deps
      .into_iter()
      .filter(|dep| !seen.contains(dep))
      .collect();

    let mut names = HashSet::new();
    for field in &self.fields {
      if !names.insert(field.name.as_str()) {
        return Err(RuleError::DuplicateField {
          target,
          name: field.name.clone(),
        });
      }
    }

    let outputs = normalize_all(&target, self.outputs)?;
    let keep_on_clean = normalize_all(&target, self.keep_on_clean)?.into_iter().collect();

    let mut input_files = BTreeSet::new();
    for field in &self.fields {
      field.value.visit_files(&mut |path: &Path| {
        input_files.insert(path.to_path_buf());
      });
    }
    if let Some(path) = input_files.iter().find(|p| normalize_relative(p).is_none()) {
      return Err(RuleError::InputOutsideCell {
        target,
        path: path.clone(),
      });
    }

    Ok(Rule {
      target,
      kind: self.kind,
      declared_deps,
      extra_deps,
      fields: self.fields,
      outputs,
      keep_on_clean,
      input_files,
      cacheable: self.cacheable,
    })
  }
}

fn normalize_all(target: &Target, paths: Vec<PathBuf>) -> Result<Vec<PathBuf>, RuleError> {
  let mut normalized = Vec::with_capacity(paths.len());
  for path in paths {
    match normalize_relative(&path) {
      Some(rel) if !normalized.contains(&rel) => normalized.push(rel),
      Some(_) => {}
      None => {
        return Err(RuleError::OutputOutsideScope {
          target: target.clone(),
          path,
        });
      }
    }
  }
  Ok(normalized)
}
