//! Minimum hop distance discovery.
//!
//! The probe raises the hop limit one step at a time until the target
//! answers or [`MAX_HOPS`] is exceeded. It runs inside its own worker
//! process (`perf-harness hop-worker`) and reports progress to the parent
//! as JSON lines on stdout.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

use crate::result_store::{HopCount, ProbeResult, ProbeResultStore};

/// Highest hop limit that is probed
pub const MAX_HOPS: u32 = 30;

/// Packets sent per hop limit
pub const PROBE_PACKETS: u32 = 3;

/// Progress reported by the worker while it runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// About to probe with this hop limit
    Probing { ttl: u32 },
    /// The target answered at this hop limit
    Reached { ttl: u32 },
    /// No answer within the hop ceiling
    Unreachable,
    /// The result file could not be written
    WriteError { cause: String },
}

impl ProgressEvent {
    /// Whether this event ends the probe
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressEvent::Probing { .. })
    }
}

/// One bounded reachability attempt
pub trait HopProbe {
    /// Returns true if any reply came back with the given hop limit
    fn reaches(&mut self, target: &str, ttl: u32) -> bool;
}

impl<F> HopProbe for F
where
    F: FnMut(&str, u32) -> bool,
{
    fn reaches(&mut self, target: &str, ttl: u32) -> bool {
        self(target, ttl)
    }
}

/// Probes with the system `ping` (or a compatible program)
#[derive(Debug, Clone)]
pub struct PingProbe {
    pub program: PathBuf,
}

impl Default for PingProbe {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ping"),
        }
    }
}

impl PingProbe {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[cfg(target_os = "macos")]
const TTL_FLAG: &str = "-m";
#[cfg(not(target_os = "macos"))]
const TTL_FLAG: &str = "-t";

impl HopProbe for PingProbe {
    fn reaches(&mut self, target: &str, ttl: u32) -> bool {
        let status = Command::new(&self.program)
            .arg("-c")
            .arg(PROBE_PACKETS.to_string())
            .arg(TTL_FLAG)
            .arg(ttl.to_string())
            .arg(target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match status {
            Ok(status) => status.success(),
            Err(e) => {
                debug!("Could not run {}: {}", self.program.display(), e);
                false
            }
        }
    }
}

/// Returns the smallest hop limit in `1..=max_hops` at which `target`
/// answers, or `None` if it never does. Only `Probing` events are emitted
/// here; the terminal event follows once the result is persisted.
pub fn discover_hops(
    probe: &mut impl HopProbe,
    target: &str,
    max_hops: u32,
    emit: &mut impl FnMut(ProgressEvent),
) -> Option<u32> {
    let mut ttl = 1;
    loop {
        emit(ProgressEvent::Probing { ttl });
        if ttl > max_hops {
            return None;
        }
        if probe.reaches(target, ttl) {
            return Some(ttl);
        }
        ttl += 1;
    }
}

/// Runs the whole probe and persists `{"hops_until_target": n}` to
/// `output`, with -1 for unreachable. Returns the persisted value.
///
/// `Reached`/`Unreachable` is emitted only after the file is written, so
/// a terminal event always means the result is readable. A failed write
/// emits `WriteError` instead.
pub fn run_worker(
    probe: &mut impl HopProbe,
    target: &str,
    max_hops: u32,
    output: &Path,
    emit: &mut impl FnMut(ProgressEvent),
) -> i32 {
    let reached = discover_hops(probe, target, max_hops, emit);
    let hops = reached.map_or(HopCount::UNREACHABLE, |ttl| ttl as i32);

    let result = ProbeResult::Hops(HopCount {
        hops_until_target: hops,
    });
    match ProbeResultStore::write(output, &result) {
        Ok(()) => emit(match reached {
            Some(ttl) => ProgressEvent::Reached { ttl },
            None => ProgressEvent::Unreachable,
        }),
        Err(e) => emit(ProgressEvent::WriteError {
            cause: e.to_string(),
        }),
    }
    hops
}
