//! Integration testing framework for perf-harness
//!
//! Scenarios drive the orchestrator library against real child processes
//! and the `perf-harness` binary itself (including its hidden hop worker).

pub mod scenarios;

pub use infrastructure::{CliTestHarness, OrchestratorTestHarness, TestProcess};
