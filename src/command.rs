use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error};

/// A tool able to list established TCP connections, one per line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTool {
    /// Program looked up to decide whether the tool exists
    pub program: String,
    /// Arguments for the availability check
    pub check_args: Vec<String>,
    /// Shell pipeline printing one line per established connection
    pub pipeline: String,
}

impl ConnectionTool {
    pub fn netstat() -> Self {
        Self {
            program: "netstat".to_string(),
            check_args: vec!["--version".to_string()],
            pipeline: "netstat -an | grep \"ESTABLISHED\"".to_string(),
        }
    }

    pub fn ss() -> Self {
        Self {
            program: "ss".to_string(),
            check_args: vec!["--version".to_string()],
            pipeline: "ss -t state established | tail -n +2".to_string(),
        }
    }

    /// netstat first, ss as fallback
    pub fn defaults() -> Vec<Self> {
        vec![Self::netstat(), Self::ss()]
    }

    /// Checks whether the tool runs on this host
    pub async fn is_available(&self) -> bool {
        let status = Command::new(&self.program)
            .args(&self.check_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) => status.success(),
            Err(e) => {
                debug!("{} is not available: {}", self.program, e);
                false
            }
        }
    }

    /// Returns the first available tool in preference order
    pub async fn discover(candidates: &[ConnectionTool]) -> Option<ConnectionTool> {
        for tool in candidates {
            if tool.is_available().await {
                debug!("Using {} to count connections", tool.program);
                return Some(tool.clone());
            }
        }
        error!(
            "None of the connection counting tools are available: {:?}",
            candidates.iter().map(|t| t.program.as_str()).collect::<Vec<_>>()
        );
        None
    }
}

/// iperf3 client run writing its JSON report to `output`
pub fn throughput_command(target: &str, streams: u32, duration: Duration, output: &Path) -> String {
    format!(
        "iperf3 -t {} -c {} -P {} -J > {}",
        duration.as_secs().max(1),
        target,
        streams,
        shell_quote(output)
    )
}

/// Loop appending the established connection count to `output` every
/// `interval` until `duration` has elapsed. Sub-second intervals are
/// passed to `sleep` as fractions.
pub fn connection_monitor_command(
    tool: &ConnectionTool,
    duration: Duration,
    interval: Duration,
    output: &Path,
) -> String {
    format!(
        "start_time=$(date +%s); \
         while true; do \
         current_time=$(date +%s); \
         elapsed_time=$((current_time - start_time)); \
         if [ $elapsed_time -ge {} ]; then break; fi; \
         {} | wc -l >> {}; \
         sleep {}; \
         done",
        duration.as_secs(),
        tool.pipeline,
        shell_quote(output),
        interval.as_secs_f64(),
    )
}

/// Single-quotes `path` for `sh`, so spaces and metacharacters stay literal
pub fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', "'\\''"))
}
