use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::operation::{OperationKind, ResultShape};

/// Throughput and latency derived from an iperf3 report
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThroughputLatency {
    pub throughput_mbps: f64,
    pub mean_rtt_ms: f64,
}

/// Outcome of the hop-count probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopCount {
    /// Minimum hop limit that reached the target, or -1
    pub hops_until_target: i32,
}

impl HopCount {
    pub const UNREACHABLE: i32 = -1;

    pub fn is_reachable(&self) -> bool {
        self.hops_until_target != Self::UNREACHABLE
    }
}

/// Raw output of a connection monitor, one count per line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionLog(pub String);

impl ConnectionLog {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Counts in the order they were sampled; blank or garbled lines are skipped
    pub fn samples(&self) -> Vec<u64> {
        self.0
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect()
    }

    /// Highest connection count observed
    pub fn peak(&self) -> Option<u64> {
        self.samples().into_iter().max()
    }
}

/// A parsed result file
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProbeResult {
    Throughput(ThroughputLatency),
    Hops(HopCount),
    Connections(ConnectionLog),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("result file {0} does not exist yet")]
    NotReady(PathBuf),

    #[error("result file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

// Subset of the iperf3 -J report that is consumed
#[derive(Debug, Deserialize)]
struct IperfReport {
    end: IperfEnd,
}

#[derive(Debug, Deserialize)]
struct IperfEnd {
    sum_sent: IperfSum,
    streams: Vec<IperfStream>,
}

#[derive(Debug, Deserialize)]
struct IperfSum {
    bits_per_second: f64,
}

#[derive(Debug, Deserialize)]
struct IperfStream {
    sender: IperfSender,
}

#[derive(Debug, Deserialize)]
struct IperfSender {
    /// Microseconds
    mean_rtt: f64,
}

impl IperfReport {
    fn summarize(&self) -> Result<ThroughputLatency, String> {
        if self.end.streams.is_empty() {
            return Err("report has no streams".to_string());
        }
        let rtts_ms: Vec<f64> = self
            .end
            .streams
            .iter()
            .map(|s| s.sender.mean_rtt / 1000.0)
            .collect();

        Ok(ThroughputLatency {
            throughput_mbps: self.end.sum_sent.bits_per_second / 1_000_000.0,
            mean_rtt_ms: rtts_ms.iter().sum::<f64>() / rtts_ms.len() as f64,
        })
    }
}

/// Parses an iperf3 JSON report into throughput and mean RTT
pub fn parse_iperf_report(raw: &str) -> Result<ThroughputLatency, String> {
    let report: IperfReport = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    report.summarize()
}

/// Result files live at deterministic per-kind paths inside one directory.
///
/// Each file has exactly one writer (the launched process). Readers may
/// see a partial file, which parses as corrupt and is reported as not ready.
#[derive(Debug, Clone)]
pub struct ProbeResultStore {
    dir: PathBuf,
}

impl ProbeResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates the results directory if needed
    pub fn ensure_dir(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })
    }

    pub fn path_for(&self, kind: OperationKind) -> PathBuf {
        self.dir.join(kind.result_file_name())
    }

    /// Deletes the result file of `kind` if present
    pub fn clear(&self, kind: OperationKind) -> Result<(), StoreError> {
        let path = self.path_for(kind);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed stale result file {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    /// Reads and parses the result file of `kind`
    pub fn read_parsed(&self, kind: OperationKind) -> Result<ProbeResult, StoreError> {
        let path = self.path_for(kind);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotReady(path));
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        let corrupt = |reason: String| StoreError::Corrupt {
            path: path.clone(),
            reason,
        };

        match kind.result_shape() {
            ResultShape::IperfReport => parse_iperf_report(&raw)
                .map(ProbeResult::Throughput)
                .map_err(corrupt),
            ResultShape::HopCount => serde_json::from_str::<HopCount>(&raw)
                .map(ProbeResult::Hops)
                .map_err(|e| corrupt(e.to_string())),
            ResultShape::ConnectionLog => Ok(ProbeResult::Connections(ConnectionLog(raw))),
        }
    }

    /// Serializes `result` to `path`, replacing any previous content
    pub fn write(path: &Path, result: &ProbeResult) -> Result<(), StoreError> {
        let contents = match result {
            ProbeResult::Connections(log) => log.0.clone(),
            structured => serde_json::to_string(structured).map_err(|e| StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?,
        };
        fs::write(path, contents).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Writes the result of `kind` inside this store
    pub fn write_for(&self, kind: OperationKind, result: &ProbeResult) -> Result<(), StoreError> {
        Self::write(&self.path_for(kind), result)
    }
}
