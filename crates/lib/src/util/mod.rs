//! Shared utilities: content hashing, output scope checks and test helpers.

pub mod hash;
pub mod scope;
