//! Key-contributing values.
//!
//! Every field a rule declares as participating in its rule key is a
//! [`KeyField`]: a name plus a [`KeyValue`]. File references are resolved to
//! content hashes during fingerprinting, never hashed by path.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A reference to an external tool used by a rule (compiler, linker, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tool {
  pub name: String,
  pub version: String,
  /// Cell-relative path of the tool binary, hashed by content when present.
  pub binary: Option<PathBuf>,
}

impl Tool {
  pub fn new(name: &str, version: &str) -> Self {
    Self {
      name: name.to_string(),
      version: version.to_string(),
      binary: None,
    }
  }

  pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
    self.binary = Some(binary.into());
    self
  }
}

/// A value participating in rule key computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyValue {
  String(String),
  Int(i64),
  Bool(bool),
  /// An absent optional value.
  None,
  /// A cell-relative input file or directory, contributing its content hash.
  File(PathBuf),
  Tool(Tool),
  List {
    items: Vec<KeyValue>,
    /// When set, items are sorted by their canonical encoding before hashing.
    order_insensitive: bool,
  },
  /// Nested structure; keys are always hashed in sorted order.
  Map(BTreeMap<String, KeyValue>),
}

impl KeyValue {
  /// An ordered list; reordering items changes the key.
  pub fn list(items: impl IntoIterator<Item = KeyValue>) -> Self {
    KeyValue::List {
      items: items.into_iter().collect(),
      order_insensitive: false,
    }
  }

  /// A list treated as a set; reordering items does not change the key.
  pub fn set(items: impl IntoIterator<Item = KeyValue>) -> Self {
    KeyValue::List {
      items: items.into_iter().collect(),
      order_insensitive: true,
    }
  }

  pub fn file(path: impl Into<PathBuf>) -> Self {
    KeyValue::File(path.into())
  }

  pub fn strings<S: AsRef<str>>(items: impl IntoIterator<Item = S>) -> Self {
    Self::list(items.into_iter().map(|s| KeyValue::from(s.as_ref())))
  }

  /// Visit every file reference (including tool binaries) in this value.
  pub fn visit_files<'a>(&'a self, visit: &mut dyn FnMut(&'a Path)) {
    match self {
      KeyValue::File(path) => visit(path),
      KeyValue::Tool(tool) => {
        if let Some(binary) = &tool.binary {
          visit(binary);
        }
      }
      KeyValue::List { items, .. } => {
        for item in items {
          item.visit_files(visit);
        }
      }
      KeyValue::Map(map) => {
        for value in map.values() {
          value.visit_files(visit);
        }
      }
      KeyValue::String(_) | KeyValue::Int(_) | KeyValue::Bool(_) | KeyValue::None => {}
    }
  }
}

impl From<&str> for KeyValue {
  fn from(value: &str) -> Self {
    KeyValue::String(value.to_string())
  }
}

impl From<String> for KeyValue {
  fn from(value: String) -> Self {
    KeyValue::String(value)
  }
}

impl From<i64> for KeyValue {
  fn from(value: i64) -> Self {
    KeyValue::Int(value)
  }
}

impl From<bool> for KeyValue {
  fn from(value: bool) -> Self {
    KeyValue::Bool(value)
  }
}

impl From<Tool> for KeyValue {
  fn from(value: Tool) -> Self {
    KeyValue::Tool(value)
  }
}

impl<T: Into<KeyValue>> From<Option<T>> for KeyValue {
  fn from(value: Option<T>) -> Self {
    value.map(Into::into).unwrap_or(KeyValue::None)
  }
}

/// A named key-contributing field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyField {
  pub name: String,
  pub value: KeyValue,
}
