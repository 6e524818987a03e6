use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::operation::OperationKind;

/// The orchestrator's record of one spawned process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    /// Process ID, also the process group ID since every launch leads its own group
    pub pid: Pid,
    /// Operation the process belongs to
    pub kind: OperationKind,
    /// When the process was spawned
    pub started_at: DateTime<Utc>,
}

impl ProcessHandle {
    pub fn new(pid: Pid, kind: OperationKind) -> Self {
        Self {
            pid,
            kind,
            started_at: Utc::now(),
        }
    }
}

/// Sends the termination signal for a registered process
pub trait Terminator: Send + Sync {
    fn terminate(&self, pid: Pid) -> nix::Result<()>;
}

/// SIGKILLs the whole process group led by `pid`
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessGroupKiller;

impl Terminator for ProcessGroupKiller {
    fn terminate(&self, pid: Pid) -> nix::Result<()> {
        debug!("Sending SIGKILL to process group {}", pid);
        kill(Pid::from_raw(-pid.as_raw()), Signal::SIGKILL)
    }
}

/// Maps each operation kind to the processes it owns.
///
/// Handles are kept in registration order and drained last-in-first-out.
/// A single lock guards the map, so a natural-exit `remove` and a
/// `drain_and_kill` for the same kind can never interleave; signals are
/// sent after the lock is released.
pub struct ProcessRegistry {
    processes: Mutex<HashMap<OperationKind, Vec<ProcessHandle>>>,
    terminator: Box<dyn Terminator>,
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::with_terminator(ProcessGroupKiller)
    }

    pub fn with_terminator(terminator: impl Terminator + 'static) -> Self {
        Self {
            processes: Mutex::new(HashMap::new()),
            terminator: Box::new(terminator),
        }
    }

    /// Records a handle under its operation kind
    pub fn register(&self, handle: ProcessHandle) {
        let mut processes = self.processes.lock().unwrap_or_else(PoisonError::into_inner);

        // A pid belongs to at most one kind.
        for (kind, handles) in processes.iter_mut() {
            if *kind != handle.kind {
                handles.retain(|h| h.pid != handle.pid);
            }
        }

        debug!("Registered PID {} under {}", handle.pid, handle.kind);
        processes.entry(handle.kind).or_default().push(handle);
    }

    /// Forgets a process that exited on its own. Returns false if a
    /// drain already took it.
    pub fn remove(&self, kind: OperationKind, pid: Pid) -> bool {
        let mut processes = self.processes.lock().unwrap_or_else(PoisonError::into_inner);
        match processes.get_mut(&kind) {
            Some(handles) => {
                let before = handles.len();
                handles.retain(|h| h.pid != pid);
                before != handles.len()
            }
            None => false,
        }
    }

    /// Removes every handle recorded for `kind` and kills them, newest first.
    ///
    /// Individual failures are logged and skipped. Returns how many
    /// processes were signalled successfully.
    pub fn drain_and_kill(&self, kind: OperationKind) -> usize {
        let drained = {
            let mut processes = self.processes.lock().unwrap_or_else(PoisonError::into_inner);
            processes.remove(&kind).unwrap_or_default()
        };

        let mut terminated = 0;
        for handle in drained.into_iter().rev() {
            info!("Will kill process with PID {} ({})", handle.pid, kind);
            match self.terminator.terminate(handle.pid) {
                Ok(()) => {
                    info!("Process with PID {} was terminated", handle.pid);
                    terminated += 1;
                }
                Err(Errno::ESRCH) => {
                    debug!("Process with PID {} had already exited", handle.pid);
                }
                Err(e) => {
                    warn!("Error terminating process {}: {}", handle.pid, e);
                }
            }
        }
        terminated
    }

    /// PIDs currently recorded for `kind`, in registration order
    pub fn pids(&self, kind: OperationKind) -> Vec<Pid> {
        let processes = self.processes.lock().unwrap_or_else(PoisonError::into_inner);
        processes
            .get(&kind)
            .map(|handles| handles.iter().map(|h| h.pid).collect())
            .unwrap_or_default()
    }

    pub fn len(&self, kind: OperationKind) -> usize {
        let processes = self.processes.lock().unwrap_or_else(PoisonError::into_inner);
        processes.get(&kind).map_or(0, Vec::len)
    }

    pub fn is_empty(&self, kind: OperationKind) -> bool {
        self.len(kind) == 0
    }
}
