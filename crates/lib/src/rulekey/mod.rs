//! Rule key computation.
//!
//! A rule key is a SHA-256 digest over an ordered list of contributions:
//!
//! 1. the key format version and the rule's type tag,
//! 2. each key field in declaration order, in canonical byte form,
//! 3. each declared dependency's rule key, in declaration order.
//!
//! File references contribute their content hash, never their path. Extra
//! (ordering-only) dependencies contribute nothing. Every token is
//! type-tagged and length-prefixed, so two different contribution lists can
//! never produce the same byte stream.

mod inputs;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::consts::RULE_KEY_VERSION;
use crate::rule::{KeyValue, Rule};
use crate::target::Target;

pub use inputs::{FileHashCache, InputHashes};

/// Opaque 256-bit rule fingerprint, printed as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RuleKey([u8; 32]);

impl RuleKey {
  pub fn from_bytes(bytes: [u8; 32]) -> Self {
    Self(bytes)
  }

  pub fn as_bytes(&self) -> &[u8; 32] {
    &self.0
  }

  pub fn to_hex(&self) -> String {
    hex::encode(self.0)
  }
}

impl fmt::Display for RuleKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.to_hex())
  }
}

impl fmt::Debug for RuleKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "RuleKey({})", self.to_hex())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid rule key {0:?}: expected 64 hex characters")]
pub struct RuleKeyParseError(String);

impl FromStr for RuleKey {
  type Err = RuleKeyParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(s, &mut bytes).map_err(|_| RuleKeyParseError(s.to_string()))?;
    Ok(Self(bytes))
  }
}

impl TryFrom<String> for RuleKey {
  type Error = RuleKeyParseError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    value.parse()
  }
}

impl From<RuleKey> for String {
  fn from(key: RuleKey) -> Self {
    key.to_hex()
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FingerprintError {
  #[error("{target}: cannot hash input {path}: {message}")]
  UnhashableInput {
    target: Target,
    path: String,
    message: String,
  },

  #[error("{target}: expected {expected} dependency keys, got {actual}")]
  DependencyKeyMismatch {
    target: Target,
    expected: usize,
    actual: usize,
  },
}

/// Compute the rule key of `rule`.
///
/// `dependency_keys` must hold the keys of `rule.declared_deps()` in the same
/// order. `inputs` must hold a content hash for every file referenced by the
/// rule's key fields.
pub fn compute_key(rule: &Rule, dependency_keys: &[RuleKey], inputs: &InputHashes) -> Result<RuleKey, FingerprintError> {
  if dependency_keys.len() != rule.declared_deps().len() {
    return Err(FingerprintError::DependencyKeyMismatch {
      target: rule.target().clone(),
      expected: rule.declared_deps().len(),
      actual: dependency_keys.len(),
    });
  }

  let mut enc = Encoder::default();
  enc.str(RULE_KEY_VERSION);
  enc.tag(b'K');
  enc.str(rule.type_tag());

  enc.tag(b'F');
  enc.len(rule.fields().len());
  for field in rule.fields() {
    enc.str(&field.name);
    encode_value(rule.target(), &field.value, inputs, &mut enc)?;
  }

  enc.tag(b'D');
  enc.len(dependency_keys.len());
  for key in dependency_keys {
    enc.raw(key.as_bytes());
  }

  Ok(RuleKey(Sha256::digest(&enc.buf).into()))
}

fn encode_value(target: &Target, value: &KeyValue, inputs: &InputHashes, enc: &mut Encoder) -> Result<(), FingerprintError> {
  match value {
    KeyValue::String(s) => {
      enc.tag(b's');
      enc.str(s);
    }
    KeyValue::Int(i) => {
      enc.tag(b'i');
      enc.raw(&i.to_le_bytes());
    }
    KeyValue::Bool(b) => {
      enc.tag(b'b');
      enc.raw(&[u8::from(*b)]);
    }
    KeyValue::None => enc.tag(b'n'),
    KeyValue::File(path) => {
      enc.tag(b'f');
      enc.str(&inputs.require(target, path)?.0);
    }
    KeyValue::Tool(tool) => {
      enc.tag(b't');
      enc.str(&tool.name);
      enc.str(&tool.version);
      match &tool.binary {
        Some(binary) => {
          enc.tag(b'f');
          enc.str(&inputs.require(target, binary)?.0);
        }
        None => enc.tag(b'n'),
      }
    }
    KeyValue::List {
      items,
      order_insensitive,
    } => {
      let mut encoded = Vec::with_capacity(items.len());
      for item in items {
        let mut sub = Encoder::default();
        encode_value(target, item, inputs, &mut sub)?;
        encoded.push(sub.buf);
      }
      if *order_insensitive {
        encoded.sort();
      }
      enc.tag(b'l');
      enc.len(encoded.len());
      for item in &encoded {
        enc.bytes(item);
      }
    }
    KeyValue::Map(map) => {
      enc.tag(b'm');
      enc.len(map.len());
      for (name, value) in map {
        enc.str(name);
        encode_value(target, value, inputs, enc)?;
      }
    }
  }
  Ok(())
}

/// Canonical byte writer for rule key contributions.
#[derive(Default)]
struct Encoder {
  buf: Vec<u8>,
}

impl Encoder {
  fn tag(&mut self, tag: u8) {
    self.buf.push(tag);
  }

  fn len(&mut self, len: usize) {
    self.buf.extend_from_slice(&(len as u64).to_le_bytes());
  }

  fn raw(&mut self, bytes: &[u8]) {
    self.buf.extend_from_slice(bytes);
  }

  fn bytes(&mut self, bytes: &[u8]) {
    self.len(bytes.len());
    self.raw(bytes);
  }

  fn str(&mut self, s: &str) {
    self.bytes(s.as_bytes());
  }
}
