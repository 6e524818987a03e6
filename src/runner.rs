use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::operation::OperationKind;
use crate::registry::ProcessHandle;

/// The OS refused to create the process
#[derive(Error, Debug)]
#[error("failed to spawn `{command}`: {source}")]
pub struct SpawnError {
    pub command: String,
    #[source]
    pub source: std::io::Error,
}

/// What to execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launch {
    /// A command line run through `sh -c`
    Shell(String),
    /// A program run directly with arguments
    Program { program: PathBuf, args: Vec<String> },
}

impl Launch {
    fn describe(&self) -> String {
        match self {
            Launch::Shell(line) => line.clone(),
            Launch::Program { program, args } => {
                format!("{} {}", program.display(), args.join(" "))
            }
        }
    }

    fn command(&self) -> Command {
        match self {
            Launch::Shell(line) => {
                let mut command = Command::new("sh");
                command.arg("-c").arg(line);
                command
            }
            Launch::Program { program, args } => {
                let mut command = Command::new(program);
                command.args(args);
                command
            }
        }
    }
}

/// How a launched process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Exited with a status code
    Exited(i32),
    /// Terminated by a signal
    Signaled(i32),
    /// Waiting on the child failed
    WaitFailed(String),
}

impl Completion {
    fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Completion::Exited(code),
            (None, Some(signal)) => Completion::Signaled(signal),
            (None, None) => Completion::WaitFailed(format!("unknown exit status {:?}", status)),
        }
    }

    pub fn is_success(&self) -> bool {
        *self == Completion::Exited(0)
    }
}

/// Receives the completion of one process; `None` while it runs
pub type CompletionReceiver = watch::Receiver<Option<Completion>>;

/// Resolves once the process behind `completion` has exited.
/// Returns `None` if the reaper went away without publishing an exit.
pub async fn wait_for_exit(completion: &mut CompletionReceiver) -> Option<Completion> {
    let current = completion.borrow().clone();
    if current.is_some() {
        return current;
    }
    match completion.wait_for(Option::is_some).await {
        Ok(exit) => (*exit).clone(),
        Err(_) => None,
    }
}

/// A process that was started and is now owned by a background reaper
#[derive(Debug)]
pub struct SpawnedProcess {
    pub handle: ProcessHandle,
    pub completion: CompletionReceiver,
}

/// Launches external commands without waiting for them.
///
/// Each process leads its own process group so a single signal reaches
/// every member of a shell pipeline. A background task reaps the child,
/// logs its output, and publishes the exit on the completion channel.
#[derive(Debug, Default, Clone)]
pub struct ExternalCommandRunner;

impl ExternalCommandRunner {
    pub fn new() -> Self {
        Self
    }

    /// Spawns `launch` for `kind`.
    ///
    /// Every stdout line is logged and, when `stdout_lines` is given,
    /// forwarded to it. stderr is collected and logged on exit.
    pub fn run(
        &self,
        kind: OperationKind,
        launch: &Launch,
        stdout_lines: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<SpawnedProcess, SpawnError> {
        let description = launch.describe();
        info!("Running {} command: {}", kind, description);

        let mut command = launch.command();
        command.process_group(0);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let child = command.spawn().map_err(|source| SpawnError {
            command: description.clone(),
            source,
        })?;

        let raw_pid = child.id().ok_or_else(|| SpawnError {
            command: description.clone(),
            source: std::io::Error::other("process exited before its pid was read"),
        })?;
        let pid = Pid::from_raw(raw_pid as i32);

        info!("Started {} process with PID: {}", kind, pid);

        let (completion_tx, completion_rx) = watch::channel(None);
        tokio::spawn(reap(kind, pid, child, stdout_lines, completion_tx));

        Ok(SpawnedProcess {
            handle: ProcessHandle::new(pid, kind),
            completion: completion_rx,
        })
    }
}

async fn reap(
    kind: OperationKind,
    pid: Pid,
    mut child: Child,
    stdout_lines: Option<mpsc::UnboundedSender<String>>,
    completion_tx: watch::Sender<Option<Completion>>,
) {
    let stdout_task = child.stdout.take().map(|stdout| {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        debug!("[{} {}] stdout: {}", kind, pid, line);
                        if let Some(ref tx) = stdout_lines {
                            // The receiver may be gone; keep draining the pipe anyway.
                            let _ = tx.send(line);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to read stdout of {}: {}", pid, e);
                        break;
                    }
                }
            }
        })
    });

    let stderr_task = child.stderr.take().map(|mut stderr| {
        tokio::spawn(async move {
            let mut buf = String::new();
            if let Err(e) = stderr.read_to_string(&mut buf).await {
                warn!("Failed to read stderr of {}: {}", pid, e);
            }
            buf
        })
    });

    let completion = match child.wait().await {
        Ok(status) => Completion::from_status(status),
        Err(e) => {
            error!("Error waiting for process {}: {}", pid, e);
            Completion::WaitFailed(e.to_string())
        }
    };

    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        if let Ok(stderr) = task.await {
            if !stderr.trim().is_empty() {
                warn!("[{} {}] stderr: {}", kind, pid, stderr.trim_end());
            }
        }
    }

    match &completion {
        Completion::Exited(0) => info!("Command {} (PID {}) finished", kind, pid),
        other => warn!("Command {} (PID {}) ended with {:?}", kind, pid, other),
    }

    completion_tx.send_replace(Some(completion));
}
