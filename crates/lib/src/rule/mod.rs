//! Rules: the nodes of the build graph.
//!
//! A rule is any value exposing a target, its dependencies, its
//! key-contributing fields and its steps. Kind-specific behavior lives behind
//! the [`RuleKind`] trait; everything the engine needs is on the frozen
//! [`Rule`] produced by [`RuleBuilder`].
//!
//! # Submodules
//!
//! - [`command`] - the built-in `genrule`-style kind that runs a shell command
//! - `context` - [`BuildContext`] handed to kinds when producing steps
//! - `field` - key-contributing values

pub mod command;
mod context;
mod field;
mod types;

pub use context::BuildContext;
pub use field::{KeyField, KeyValue, Tool};
pub use types::*;
