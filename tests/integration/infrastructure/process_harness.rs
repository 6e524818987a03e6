use anyhow::{Context, Result};
use nix::{sys::signal::Signal, unistd::Pid};
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tokio::time::timeout;

/// Runs the `perf-harness` binary against a scratch results directory
pub struct CliTestHarness {
    temp_dir: TempDir,
    cleanup_pids: Vec<Pid>,
}

impl CliTestHarness {
    pub fn new() -> Result<Self> {
        let temp_dir = TempDir::new().context("Failed to create temporary directory")?;
        Ok(Self {
            temp_dir,
            cleanup_pids: Vec::new(),
        })
    }

    /// Directory passed as `--results-dir` to every invocation
    pub fn results_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Spawn `perf-harness` with the given arguments, capturing stdout and stderr
    pub fn spawn(&mut self, args: &[&str]) -> Result<TestProcess> {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_perf-harness"));
        cmd.args(args);
        cmd.env("PERF_HARNESS_RESULTS_DIR", self.temp_dir.path());
        cmd.env("RUST_LOG", "perf_harness=debug");
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        // Keep terminal signals aimed at the test runner away from it
        cmd.process_group(0);

        let child = cmd.spawn().context("Failed to spawn perf-harness")?;
        let pid = Pid::from_raw(
            child
                .id()
                .ok_or_else(|| anyhow::anyhow!("Failed to get child PID"))? as i32,
        );
        self.cleanup_pids.push(pid);

        Ok(TestProcess {
            pid,
            child: Some(child),
        })
    }

    /// Run `perf-harness` to completion
    pub async fn run(&mut self, args: &[&str], limit: Duration) -> Result<Output> {
        let process = self.spawn(args)?;
        process
            .wait_with_output_timeout(limit)
            .await?
            .ok_or_else(|| anyhow::anyhow!("perf-harness {:?} did not exit within {:?}", args, limit))
    }
}

impl Drop for CliTestHarness {
    fn drop(&mut self) {
        for pid in &self.cleanup_pids {
            let _ = nix::sys::signal::kill(Pid::from_raw(-pid.as_raw()), Signal::SIGKILL);
        }
    }
}

/// A spawned `perf-harness` process
pub struct TestProcess {
    pub pid: Pid,
    child: Option<tokio::process::Child>,
}

impl TestProcess {
    /// Check if the process is still running
    pub fn is_running(&mut self) -> bool {
        match &mut self.child {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub fn send_signal(&self, signal: Signal) -> Result<()> {
        nix::sys::signal::kill(self.pid, signal)
            .with_context(|| format!("Failed to send {:?} to {}", signal, self.pid))
    }

    /// Wait for exit and collect output; `None` on timeout
    pub async fn wait_with_output_timeout(mut self, limit: Duration) -> Result<Option<Output>> {
        let child = self
            .child
            .take()
            .ok_or_else(|| anyhow::anyhow!("Process already consumed"))?;
        match timeout(limit, child.wait_with_output()).await {
            Ok(output) => Ok(Some(output.context("Failed to wait for perf-harness")?)),
            Err(_) => Ok(None),
        }
    }
}
