//! End-to-end tests driving the build engine over real cells on disk.

mod build_tests;
mod common;
mod dedup_tests;
mod extra_dep_tests;
mod failure_tests;
mod graph_tests;
