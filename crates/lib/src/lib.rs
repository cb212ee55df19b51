//! kiln-lib: an incremental build engine
//!
//! This crate provides the pieces of a content-addressed build:
//! - `Target` and `Rule`: immutable nodes of the build graph
//! - `RuleGraph`: dependency DAG with cycle detection
//! - `RuleKey`: deterministic fingerprint of a rule's inputs and dependencies
//! - `ArtifactStore`: cache of outputs addressed by rule key
//! - `BuildEngine`: concurrent scheduler that dedupes in-flight work
//! - `Step`: atomic units of work run inside a rule's output scope

pub mod cache;
pub mod cancel;
pub mod consts;
pub mod engine;
pub mod graph;
pub mod paths;
pub mod rule;
pub mod rulekey;
pub mod step;
pub mod target;
pub mod util;

pub use cache::{ArtifactBundle, ArtifactStore, CacheLookup, DirCache, MemoryCache, TieredCache};
pub use engine::{BuildEngine, BuildReport, BuildResult, BuildStatus, EngineConfig};
pub use graph::{GraphError, RuleGraph};
pub use rule::{Rule, RuleBuilder, RuleKind};
pub use rulekey::RuleKey;
pub use target::Target;
