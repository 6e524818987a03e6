//! Backend of a network performance test harness.
//!
//! External measurement tools (iperf3, connection counters, a hop-count
//! probe) run as independent processes, tracked per operation kind. Each
//! run leaves one result file behind that callers poll for.

pub mod command;
pub mod error;
pub mod hop_probe;
pub mod operation;
pub mod orchestrator;
pub mod registry;
pub mod result_store;
pub mod runner;

pub use error::{OrchestratorError, StartFailure};
pub use hop_probe::{ProgressEvent, MAX_HOPS};
pub use operation::{OperationKind, OperationParams};
pub use orchestrator::{OrchestratorConfig, RunState, TestOrchestrator};
pub use registry::{ProcessHandle, ProcessRegistry};
pub use result_store::{ConnectionLog, HopCount, ProbeResult, ProbeResultStore, ThroughputLatency};
pub use runner::{Completion, ExternalCommandRunner, SpawnError};
