//! Target identifiers.
//!
//! A target names exactly one rule in the graph. It is the triple of a base
//! path, a short name and a sorted set of flavors, and prints as
//! `//base/path:name#flavor1,flavor2`.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced when constructing or parsing a target.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
  #[error("target must start with '//': {0}")]
  MissingRootPrefix(String),

  #[error("target is missing ':name': {0}")]
  MissingName(String),

  #[error("invalid base path segment {segment:?} in {input}")]
  InvalidBasePath { input: String, segment: String },

  #[error("invalid target name {0:?}")]
  InvalidName(String),

  #[error("invalid flavor {0:?}")]
  InvalidFlavor(String),
}

/// Unique, immutable identifier of a rule.
///
/// Ordering and equality are structural: base path, then name, then the
/// sorted flavor set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Target {
  base_path: String,
  name: String,
  flavors: BTreeSet<String>,
}

impl Target {
  /// Create an unflavored target.
  pub fn new(base_path: &str, name: &str) -> Result<Self, TargetError> {
    validate_base_path(base_path, base_path)?;
    validate_name(name)?;
    Ok(Self {
      base_path: base_path.to_string(),
      name: name.to_string(),
      flavors: BTreeSet::new(),
    })
  }

  /// Return a distinct target with `flavor` added.
  pub fn with_flavor(&self, flavor: &str) -> Result<Self, TargetError> {
    validate_flavor(flavor)?;
    let mut flavored = self.clone();
    flavored.flavors.insert(flavor.to_string());
    Ok(flavored)
  }

  /// Return the same target with every flavor removed.
  pub fn unflavored(&self) -> Self {
    Self {
      base_path: self.base_path.clone(),
      name: self.name.clone(),
      flavors: BTreeSet::new(),
    }
  }

  pub fn base_path(&self) -> &str {
    &self.base_path
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn flavors(&self) -> &BTreeSet<String> {
    &self.flavors
  }

  pub fn is_flavored(&self) -> bool {
    !self.flavors.is_empty()
  }

  /// Path of this target's private output scope, relative to the gen directory.
  ///
  /// The leaf is `__name#flavors__`, a form no base-path segment may take,
  /// so one target's scope never contains another's. Flavored variants get
  /// their own directory, so two variants of one declaration never share
  /// outputs.
  pub fn scope_dir(&self) -> PathBuf {
    let mut path = PathBuf::new();
    for segment in self.base_path.split('/').filter(|s| !s.is_empty()) {
      path.push(segment);
    }
    path.push(format!("__{}__", self.short_name_with_flavors()));
    path
  }

  fn short_name_with_flavors(&self) -> String {
    if self.flavors.is_empty() {
      self.name.clone()
    } else {
      let flavors: Vec<&str> = self.flavors.iter().map(String::as_str).collect();
      format!("{}#{}", self.name, flavors.join(","))
    }
  }
}

impl fmt::Display for Target {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "//{}:{}", self.base_path, self.short_name_with_flavors())
  }
}

impl FromStr for Target {
  type Err = TargetError;

  fn from_str(input: &str) -> Result<Self, Self::Err> {
    let rest = input
      .strip_prefix("//")
      .ok_or_else(|| TargetError::MissingRootPrefix(input.to_string()))?;
    let (base_path, name_and_flavors) = rest
      .split_once(':')
      .ok_or_else(|| TargetError::MissingName(input.to_string()))?;

    validate_base_path(input, base_path)?;

    let (name, flavors) = match name_and_flavors.split_once('#') {
      Some((name, flavors)) => (name, Some(flavors)),
      None => (name_and_flavors, None),
    };
    validate_name(name)?;

    let mut target = Self {
      base_path: base_path.to_string(),
      name: name.to_string(),
      flavors: BTreeSet::new(),
    };
    if let Some(flavors) = flavors {
      for flavor in flavors.split(',') {
        validate_flavor(flavor)?;
        target.flavors.insert(flavor.to_string());
      }
    }
    Ok(target)
  }
}

impl TryFrom<String> for Target {
  type Error = TargetError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    value.parse()
  }
}

impl From<Target> for String {
  fn from(target: Target) -> Self {
    target.to_string()
  }
}

fn validate_base_path(input: &str, base_path: &str) -> Result<(), TargetError> {
  if base_path.is_empty() {
    return Ok(());
  }
  for segment in base_path.split('/') {
    let bad = segment.is_empty()
      || segment == "."
      || segment == ".."
      || segment.contains([':', '#', ',', '\\'])
      || is_reserved_segment(segment);
    if bad {
      return Err(TargetError::InvalidBasePath {
        input: input.to_string(),
        segment: segment.to_string(),
      });
    }
  }
  Ok(())
}

/// `__x__` is the shape of a scope leaf.
fn is_reserved_segment(segment: &str) -> bool {
  segment.len() >= 4 && segment.starts_with("__") && segment.ends_with("__")
}

fn validate_name(name: &str) -> Result<(), TargetError> {
  if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', ':', '#', ',']) {
    return Err(TargetError::InvalidName(name.to_string()));
  }
  Ok(())
}

fn validate_flavor(flavor: &str) -> Result<(), TargetError> {
  let valid = !flavor.is_empty()
    && flavor
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
  if valid {
    Ok(())
  } else {
    Err(TargetError::InvalidFlavor(flavor.to_string()))
  }
}
