use std::fmt;
use std::str::FromStr;

use crate::error::{OrchestratorError, StartFailure};

/// The closed set of test types the orchestrator knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum OperationKind {
    /// Single UE end-to-end throughput and latency (one iperf3 stream)
    #[value(name = "e2e-single-ue")]
    SingleUeThroughput,
    /// Multiple UE end-to-end throughput and latency (one stream per UE)
    #[value(name = "e2e-multiple-ue")]
    MultiUeThroughput,
    /// Established TCP connection counter
    #[value(name = "max-connections")]
    MaxConnections,
    /// Established TCP connection counter for callback traffic
    #[value(name = "callback-max-connections")]
    CallbackMaxConnections,
    /// Minimum hop distance to a target
    #[value(name = "max-hops")]
    MaxHops,
}

/// Shape of the file a kind produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    /// iperf3 JSON report
    IperfReport,
    /// `{"hops_until_target": n}`
    HopCount,
    /// One connection count per line
    ConnectionLog,
}

impl OperationKind {
    pub const ALL: [OperationKind; 5] = [
        OperationKind::SingleUeThroughput,
        OperationKind::MultiUeThroughput,
        OperationKind::MaxConnections,
        OperationKind::CallbackMaxConnections,
        OperationKind::MaxHops,
    ];

    /// Stable identifier used on the command line and in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::SingleUeThroughput => "e2e-single-ue",
            OperationKind::MultiUeThroughput => "e2e-multiple-ue",
            OperationKind::MaxConnections => "max-connections",
            OperationKind::CallbackMaxConnections => "callback-max-connections",
            OperationKind::MaxHops => "max-hops",
        }
    }

    /// File name of the result inside the results directory
    pub fn result_file_name(&self) -> &'static str {
        match self {
            OperationKind::SingleUeThroughput => "client_output_Def14Perf1.json",
            OperationKind::MultiUeThroughput => "client_output_Def14Perf2.json",
            OperationKind::MaxConnections => "client_output_Def14Perf11.txt",
            OperationKind::CallbackMaxConnections => "client_output_Def14Perf7.txt",
            OperationKind::MaxHops => "client_output_Def14Perf13.json",
        }
    }

    pub fn result_shape(&self) -> ResultShape {
        match self {
            OperationKind::SingleUeThroughput | OperationKind::MultiUeThroughput => {
                ResultShape::IperfReport
            }
            OperationKind::MaxConnections | OperationKind::CallbackMaxConnections => {
                ResultShape::ConnectionLog
            }
            OperationKind::MaxHops => ResultShape::HopCount,
        }
    }

    /// Connection monitors run for a fixed wall-clock window and only
    /// have a complete result once they exit.
    pub fn is_monitor(&self) -> bool {
        self.result_shape() == ResultShape::ConnectionLog
    }

    /// Status line returned by a successful start
    pub fn started_message(&self) -> &'static str {
        match self {
            OperationKind::SingleUeThroughput => {
                "Started E2E Single UE Throughput and Latency Performance Test."
            }
            OperationKind::MultiUeThroughput => {
                "Started E2E Multiple UE Throughput and Latency Performance Test."
            }
            OperationKind::MaxConnections | OperationKind::CallbackMaxConnections => {
                "Connections monitoring process was started..."
            }
            OperationKind::MaxHops => "Started Max Hops Performance Test",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| OrchestratorError::BadRequest(format!("unknown operation '{}'", s)))
    }
}

/// Caller-supplied parameters for a start request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationParams {
    /// Target address or host name
    pub target: Option<String>,
    /// Number of UEs, i.e. parallel iperf3 streams
    pub ue_count: Option<u32>,
}

impl OperationParams {
    pub fn with_target(target: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            ue_count: None,
        }
    }

    /// Returns the validated target for kinds that need one
    pub fn require_target(&self, kind: OperationKind) -> Result<&str, OrchestratorError> {
        let target = self
            .target
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(OrchestratorError::StartFailed {
                kind,
                source: StartFailure::MissingParameter("target"),
            })?;

        if !is_plain_host(target) {
            return Err(OrchestratorError::BadRequest(format!(
                "target '{}' is not a host name or IP address",
                target
            )));
        }
        Ok(target)
    }

    /// Returns the stream count for a throughput kind
    pub fn stream_count(&self, kind: OperationKind) -> Result<u32, OrchestratorError> {
        match kind {
            OperationKind::MultiUeThroughput => match self.ue_count {
                Some(0) => Err(OrchestratorError::BadRequest(
                    "ue_count must be at least 1".to_string(),
                )),
                Some(n) => Ok(n),
                None => Err(OrchestratorError::StartFailed {
                    kind,
                    source: StartFailure::MissingParameter("ue_count"),
                }),
            },
            _ => Ok(1),
        }
    }
}

// Targets are interpolated into shell command lines.
fn is_plain_host(target: &str) -> bool {
    target
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':' | '%'))
        && !target.starts_with('-')
}
