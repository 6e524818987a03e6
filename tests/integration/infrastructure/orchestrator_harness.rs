use anyhow::{anyhow, Context, Result};
use perf_harness::command::ConnectionTool;
use perf_harness::{
    OperationKind, OrchestratorConfig, OrchestratorError, ProbeResult, RunState, TestOrchestrator,
};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Builds orchestrators whose results, tools, and hop worker live in a scratch directory
pub struct OrchestratorTestHarness {
    temp_dir: TempDir,
}

impl OrchestratorTestHarness {
    pub fn new() -> Result<Self> {
        let temp_dir = TempDir::new().context("Failed to create temporary directory")?;
        Ok(Self { temp_dir })
    }

    pub fn results_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Configuration using the real `perf-harness` binary as hop worker
    pub fn config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            results_dir: self.temp_dir.path().to_path_buf(),
            worker_program: Some(PathBuf::from(env!("CARGO_BIN_EXE_perf-harness"))),
            ping_program: PathBuf::from("true"),
            monitor_duration: Duration::from_secs(30),
            monitor_interval: Duration::from_secs(1),
            connection_tools: vec![Self::counting_tool(3)],
            ..Default::default()
        }
    }

    pub fn orchestrator(&self) -> TestOrchestrator {
        TestOrchestrator::new(self.config())
    }

    /// Connection tool whose pipeline always prints `count` lines
    pub fn counting_tool(count: u32) -> ConnectionTool {
        ConnectionTool {
            program: "true".to_string(),
            check_args: vec![],
            pipeline: format!("seq {}", count),
        }
    }

    /// Writes an executable shell script into the scratch directory
    pub fn script(&self, name: &str, body: &str) -> Result<PathBuf> {
        let path = self.temp_dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    /// Polls `results` until something other than NotReady comes back
    pub async fn poll_results(
        orchestrator: &TestOrchestrator,
        kind: OperationKind,
        timeout: Duration,
    ) -> Result<ProbeResult> {
        let start = Instant::now();
        loop {
            match orchestrator.results(kind) {
                Ok(result) => return Ok(result),
                Err(OrchestratorError::NotReady { .. }) if start.elapsed() < timeout => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => return Err(anyhow!("no result for {} after {:?}: {}", kind, timeout, e)),
            }
        }
    }

    /// Polls `state` until the run of `kind` leaves Running
    pub async fn wait_terminal(
        orchestrator: &TestOrchestrator,
        kind: OperationKind,
        timeout: Duration,
    ) -> Result<RunState> {
        let start = Instant::now();
        loop {
            let state = orchestrator.state(kind);
            if state.is_terminal() {
                return Ok(state);
            }
            if start.elapsed() > timeout {
                return Err(anyhow!("{} still {:?} after {:?}", kind, state, timeout));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
