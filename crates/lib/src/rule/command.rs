//! `genrule`: run one shell command over source files to produce one output.
//!
//! The command sees:
//! - `SRCS`: space-separated absolute paths of the sources
//! - `OUT`: absolute path of the declared output
//! - `DEPS`: space-separated absolute paths of every declared dependency's outputs
//! - `SRCDIR`: the cell root

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use super::{BuildContext, KeyValue, RuleBuilder, RuleKind};
use crate::step::{MkdirStep, ShellStep, Step};
use crate::target::Target;

#[derive(Debug, Clone)]
pub struct CommandRule {
  cmd: String,
  srcs: Vec<PathBuf>,
  out: PathBuf,
}

impl CommandRule {
  pub fn new(cmd: impl Into<String>, srcs: Vec<PathBuf>, out: impl Into<PathBuf>) -> Self {
    Self {
      cmd: cmd.into(),
      srcs,
      out: out.into(),
    }
  }

  /// A rule builder for this command with its key fields and output declared.
  ///
  /// Callers add dependencies and any extra fields before building.
  pub fn rule(self, target: Target) -> RuleBuilder {
    let srcs = KeyValue::list(self.srcs.iter().cloned().map(KeyValue::File));
    let cmd = self.cmd.clone();
    let out = self.out.clone();

    RuleBuilder::new(target, Arc::new(self))
      .field("cmd", cmd)
      .field("srcs", srcs)
      .field("out", out.to_string_lossy().into_owned())
      .output(out)
  }
}

impl RuleKind for CommandRule {
  fn type_tag(&self) -> &str {
    "genrule"
  }

  fn steps(&self, ctx: &BuildContext) -> Vec<Box<dyn Step>> {
    let join = |paths: Vec<String>| paths.join(" ");

    let srcs = join(
      self
        .srcs
        .iter()
        .map(|src| ctx.input_path(src).to_string_lossy().into_owned())
        .collect(),
    );
    let deps = join(
      ctx
        .all_dependency_outputs()
        .values()
        .flatten()
        .map(|p| p.to_string_lossy().into_owned())
        .collect(),
    );

    let env = BTreeMap::from([
      ("SRCS".to_string(), srcs),
      ("OUT".to_string(), ctx.scope_dir().join(&self.out).to_string_lossy().into_owned()),
      ("DEPS".to_string(), deps),
      ("SRCDIR".to_string(), ctx.cell_root().to_string_lossy().into_owned()),
    ]);

    let mut steps: Vec<Box<dyn Step>> = Vec::new();
    if let Some(parent) = self.out.parent().filter(|p| !p.as_os_str().is_empty()) {
      steps.push(Box::new(MkdirStep::new(parent)));
    }
    steps.push(Box::new(ShellStep::new(self.cmd.clone()).with_env(env)));
    steps
  }
}
