use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::command::{connection_monitor_command, throughput_command, ConnectionTool};
use crate::error::{OrchestratorError, Result, StartFailure};
use crate::hop_probe::{ProgressEvent, MAX_HOPS};
use crate::operation::{OperationKind, OperationParams};
use crate::registry::ProcessRegistry;
use crate::result_store::{ProbeResult, ProbeResultStore, StoreError};
use crate::runner::{
    wait_for_exit, Completion, CompletionReceiver, ExternalCommandRunner, Launch, SpawnError,
};

/// Configuration for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Directory holding one result file per operation kind
    pub results_dir: PathBuf,
    /// Executable providing the `hop-worker` subcommand (default: current executable)
    pub worker_program: Option<PathBuf>,
    /// Program the hop worker probes with
    pub ping_program: PathBuf,
    /// iperf3 test length
    pub throughput_duration: Duration,
    /// Wall-clock window of the connection monitors
    pub monitor_duration: Duration,
    /// Sampling interval of the connection monitors
    pub monitor_interval: Duration,
    /// Hop ceiling of the hop-count probe
    pub max_hops: u32,
    /// Connection counting tools in preference order
    pub connection_tools: Vec<ConnectionTool>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            results_dir: std::env::temp_dir(),
            worker_program: None,
            ping_program: PathBuf::from("ping"),
            throughput_duration: Duration::from_secs(5),
            monitor_duration: Duration::from_secs(300),
            monitor_interval: Duration::from_secs(1),
            max_hops: MAX_HOPS,
            connection_tools: ConnectionTool::defaults(),
        }
    }
}

/// Lifecycle of one operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Never started
    Idle,
    /// Launched and not yet exited
    Running,
    /// Exited successfully
    Finished,
    /// The hop probe gave up at the hop ceiling
    Unreachable,
    /// Exited with an error, or could not be launched
    Failed,
    /// Killed through `stop`
    Stopped,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Idle | RunState::Running)
    }
}

#[derive(Debug)]
struct RunSlot {
    state: RunState,
    // Bumped on every start so exits of older runs are ignored.
    generation: u64,
    completion: Option<CompletionReceiver>,
}

impl Default for RunSlot {
    fn default() -> Self {
        Self {
            state: RunState::Idle,
            generation: 0,
            completion: None,
        }
    }
}

type Slots = Arc<Mutex<HashMap<OperationKind, RunSlot>>>;

/// Starts, tracks, and stops test operations.
///
/// Commands are launched without being awaited. Callers learn about
/// results by polling [`TestOrchestrator::results`]; `wait` and `state`
/// expose the process exit for callers that want it.
pub struct TestOrchestrator {
    config: OrchestratorConfig,
    store: ProbeResultStore,
    registry: Arc<ProcessRegistry>,
    runner: ExternalCommandRunner,
    slots: Slots,
    // Held across drain, clear, spawn and register so restarts of one kind
    // never overlap.
    start_locks: HashMap<OperationKind, AsyncMutex<()>>,
}

impl TestOrchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::with_registry(config, Arc::new(ProcessRegistry::new()))
    }

    pub fn with_registry(config: OrchestratorConfig, registry: Arc<ProcessRegistry>) -> Self {
        Self {
            store: ProbeResultStore::new(config.results_dir.clone()),
            config,
            registry,
            runner: ExternalCommandRunner::new(),
            slots: Arc::new(Mutex::new(HashMap::new())),
            start_locks: OperationKind::ALL
                .into_iter()
                .map(|kind| (kind, AsyncMutex::new(())))
                .collect(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn store(&self) -> &ProbeResultStore {
        &self.store
    }

    /// Launches `kind` and returns its status line.
    ///
    /// Any processes still registered for `kind` are killed and its
    /// previous result file is deleted before the new launch.
    pub async fn start(&self, kind: OperationKind, params: &OperationParams) -> Result<String> {
        info!("Start operation {}", kind);

        let _start_guard = match self.start_locks.get(&kind) {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let launch = self.build_launch(kind, params).await?;

        let stale = self.registry.drain_and_kill(kind);
        if stale > 0 {
            info!("Killed {} leftover {} processes before restart", stale, kind);
        }

        let start_failed = |source: StartFailure| OrchestratorError::StartFailed { kind, source };
        self.store
            .ensure_dir()
            .and_then(|_| self.store.clear(kind))
            .map_err(|e| start_failed(e.into()))?;

        let (lines_tx, progress) = if kind == OperationKind::MaxHops {
            let (tx, rx) = mpsc::unbounded_channel();
            let target = params.target.clone().unwrap_or_default();
            (Some(tx), Some(tokio::spawn(forward_progress(target, rx))))
        } else {
            (None, None)
        };

        let spawned = match self.runner.run(kind, &launch, lines_tx) {
            Ok(spawned) => spawned,
            Err(e) => {
                error!("Could not start {}: {}", kind, e);
                self.set_state(kind, RunState::Failed);
                return Err(start_failed(e.into()));
            }
        };

        let pid = spawned.handle.pid;
        self.registry.register(spawned.handle);

        let generation = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            let slot = slots.entry(kind).or_default();
            slot.generation += 1;
            slot.state = RunState::Running;
            slot.completion = Some(spawned.completion.clone());
            slot.generation
        };

        tokio::spawn(track_completion(
            Arc::clone(&self.registry),
            Arc::clone(&self.slots),
            kind,
            pid,
            generation,
            spawned.completion,
            progress,
        ));

        Ok(kind.started_message().to_string())
    }

    /// Reads the current result of `kind`.
    ///
    /// A missing or unparsable file is reported as `NotReady`.
    pub fn results(&self, kind: OperationKind) -> Result<ProbeResult> {
        match self.store.read_parsed(kind) {
            Ok(result) => {
                debug!("Results for {}: {:?}", kind, result);
                Ok(result)
            }
            Err(StoreError::NotReady(path)) => {
                debug!("{} has no result at {} yet", kind, path.display());
                Err(OrchestratorError::NotReady { kind })
            }
            Err(e @ StoreError::Corrupt { .. }) => {
                warn!("Unusable result for {}: {}", kind, e);
                Err(OrchestratorError::NotReady { kind })
            }
            Err(e @ StoreError::Io { .. }) => {
                error!("Could not read result for {}: {}", kind, e);
                Err(OrchestratorError::NotReady { kind })
            }
        }
    }

    /// Kills every process of `kind`. Returns how many were terminated.
    pub fn stop(&self, kind: OperationKind) -> usize {
        info!("Stop operation {}", kind);
        let terminated = self.registry.drain_and_kill(kind);
        self.set_state(kind, RunState::Stopped);
        info!("Stopped {} ({} processes terminated)", kind, terminated);
        terminated
    }

    pub fn state(&self, kind: OperationKind) -> RunState {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(&kind).map_or(RunState::Idle, |slot| slot.state)
    }

    /// Waits for the most recently started process of `kind` to exit.
    /// Returns `None` if `kind` was never started.
    pub async fn wait(&self, kind: OperationKind) -> Option<Completion> {
        let mut completion = {
            let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.get(&kind)?.completion.clone()?
        };
        wait_for_exit(&mut completion).await
    }

    fn set_state(&self, kind: OperationKind, state: RunState) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(kind).or_default().state = state;
    }

    async fn build_launch(&self, kind: OperationKind, params: &OperationParams) -> Result<Launch> {
        let output = self.store.path_for(kind);
        match kind {
            OperationKind::SingleUeThroughput | OperationKind::MultiUeThroughput => {
                let target = params.require_target(kind)?;
                let streams = params.stream_count(kind)?;
                Ok(Launch::Shell(throughput_command(
                    target,
                    streams,
                    self.config.throughput_duration,
                    &output,
                )))
            }
            OperationKind::MaxConnections | OperationKind::CallbackMaxConnections => {
                if self.config.monitor_interval.is_zero() {
                    return Err(OrchestratorError::BadRequest(
                        "monitor interval must be positive".to_string(),
                    ));
                }
                let tools = &self.config.connection_tools;
                let tool = ConnectionTool::discover(tools).await.ok_or_else(|| {
                    OrchestratorError::ToolUnavailable {
                        kind,
                        tried: tools.iter().map(|t| t.program.clone()).collect(),
                    }
                })?;
                Ok(Launch::Shell(connection_monitor_command(
                    &tool,
                    self.config.monitor_duration,
                    self.config.monitor_interval,
                    &output,
                )))
            }
            OperationKind::MaxHops => {
                let target = params.require_target(kind)?;
                let program = self.worker_program().map_err(|e| OrchestratorError::StartFailed {
                    kind,
                    source: e.into(),
                })?;
                info!("Will compute the number of hops until the target {}", target);
                Ok(Launch::Program {
                    program,
                    args: vec![
                        "hop-worker".to_string(),
                        "--target".to_string(),
                        target.to_string(),
                        "--output".to_string(),
                        output.display().to_string(),
                        "--max-hops".to_string(),
                        self.config.max_hops.to_string(),
                        "--ping-program".to_string(),
                        self.config.ping_program.display().to_string(),
                    ],
                })
            }
        }
    }

    fn worker_program(&self) -> std::result::Result<PathBuf, SpawnError> {
        match &self.config.worker_program {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe().map_err(|source| SpawnError {
                command: "hop-worker".to_string(),
                source,
            }),
        }
    }
}

/// Logs hop worker events and returns the last terminal one
async fn forward_progress(
    target: String,
    mut lines: mpsc::UnboundedReceiver<String>,
) -> Option<ProgressEvent> {
    let mut terminal = None;
    while let Some(line) = lines.recv().await {
        let event = match serde_json::from_str::<ProgressEvent>(&line) {
            Ok(event) => event,
            Err(_) => {
                debug!("Ignoring hop worker output: {}", line);
                continue;
            }
        };

        match &event {
            ProgressEvent::Probing { ttl } => info!("Hop probe {}: probing with TTL {}", target, ttl),
            ProgressEvent::Reached { ttl } => info!("Hop probe {}: reached with {} hops", target, ttl),
            ProgressEvent::Unreachable => warn!("Hop probe {}: not reachable within the hop limit", target),
            ProgressEvent::WriteError { cause } => {
                error!("Hop probe {}: could not write result: {}", target, cause)
            }
        }
        if event.is_terminal() {
            terminal = Some(event);
        }
    }
    terminal
}

async fn track_completion(
    registry: Arc<ProcessRegistry>,
    slots: Slots,
    kind: OperationKind,
    pid: nix::unistd::Pid,
    generation: u64,
    mut completion: CompletionReceiver,
    progress: Option<JoinHandle<Option<ProgressEvent>>>,
) {
    let exit = wait_for_exit(&mut completion).await;
    let last_event = match progress {
        Some(task) => task.await.ok().flatten(),
        None => None,
    };

    registry.remove(kind, pid);

    let next = match (&exit, &last_event) {
        (_, Some(ProgressEvent::Unreachable)) => RunState::Unreachable,
        (_, Some(ProgressEvent::WriteError { .. })) => RunState::Failed,
        (Some(exit), _) if exit.is_success() => RunState::Finished,
        _ => RunState::Failed,
    };

    let mut slots = slots.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(slot) = slots.get_mut(&kind) {
        if slot.generation == generation && slot.state == RunState::Running {
            debug!("{} moved to {:?}", kind, next);
            slot.state = next;
        }
    }
}
