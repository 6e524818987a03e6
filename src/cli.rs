use clap::{Parser, Subcommand};
use eyre::eyre;
use std::path::PathBuf;
use std::time::Duration;

use perf_harness::{OperationKind, OperationParams, OrchestratorConfig, MAX_HOPS};

type Result<T> = color_eyre::eyre::Result<T>;

/// Launches and tracks network performance tests
#[derive(Parser)]
#[command(name = "perf-harness")]
#[command(about = "Launches and tracks network performance tests")]
#[command(version)]
pub struct Cli {
    /// Directory for result files (default: system temp dir)
    #[arg(long, global = true, env = "PERF_HARNESS_RESULTS_DIR")]
    pub results_dir: Option<PathBuf>,

    /// Program used by the hop-count probe
    #[arg(long, global = true, default_value = "ping", env = "PERF_HARNESS_PING")]
    pub ping_program: PathBuf,

    /// Hop ceiling of the hop-count probe
    #[arg(long, global = true, default_value_t = MAX_HOPS)]
    pub max_hops: u32,

    /// iperf3 test duration (seconds)
    #[arg(long, global = true, default_value = "5")]
    pub throughput_duration_secs: u64,

    /// Connection monitor window (seconds)
    #[arg(long, global = true, default_value = "300")]
    pub monitor_duration_secs: u64,

    /// Connection monitor sampling interval (seconds)
    #[arg(long, global = true, default_value = "1")]
    pub monitor_interval_secs: u64,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start an operation and wait for its result
    Run {
        /// Operation to run
        #[arg(value_enum)]
        kind: OperationKind,

        /// Target address or host name
        #[arg(long)]
        target: Option<String>,

        /// Number of UEs (parallel streams) for e2e-multiple-ue
        #[arg(long)]
        ue_count: Option<u32>,

        /// Give up and stop the operation after this many seconds
        #[arg(long, default_value = "600")]
        timeout_secs: u64,

        /// Result polling interval (ms)
        #[arg(long, default_value = "500")]
        poll_interval_ms: u64,
    },

    /// Print the persisted result of an operation
    Results {
        /// Operation whose result is read
        #[arg(value_enum)]
        kind: OperationKind,
    },

    /// Run the hop-count probe, reporting progress as JSON lines on stdout
    #[command(hide = true)]
    HopWorker {
        /// Target address or host name
        #[arg(long)]
        target: String,

        /// Result file to write
        #[arg(long)]
        output: PathBuf,
    },
}

/// A start-and-wait request from the command line
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub kind: OperationKind,
    pub params: OperationParams,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub enum Action {
    Run(RunRequest),
    Results(OperationKind),
    HopWorker { target: String, output: PathBuf },
}

/// Parsed configuration of one invocation
#[derive(Debug, Clone)]
pub struct Config {
    pub orchestrator: OrchestratorConfig,
    pub action: Action,
}

impl Config {
    /// Parse command line arguments into configuration
    pub fn from_cli(cli: Cli) -> Result<Self> {
        if cli.max_hops == 0 {
            return Err(eyre!("--max-hops must be at least 1"));
        }
        if cli.monitor_interval_secs == 0 {
            return Err(eyre!("--monitor-interval-secs must be at least 1"));
        }

        let defaults = OrchestratorConfig::default();
        let orchestrator = OrchestratorConfig {
            results_dir: cli.results_dir.unwrap_or(defaults.results_dir),
            ping_program: cli.ping_program,
            max_hops: cli.max_hops,
            throughput_duration: Duration::from_secs(cli.throughput_duration_secs),
            monitor_duration: Duration::from_secs(cli.monitor_duration_secs),
            monitor_interval: Duration::from_secs(cli.monitor_interval_secs),
            ..defaults
        };

        let action = match cli.command {
            Commands::Run {
                kind,
                target,
                ue_count,
                timeout_secs,
                poll_interval_ms,
            } => {
                if poll_interval_ms == 0 {
                    return Err(eyre!("--poll-interval-ms must be positive"));
                }
                Action::Run(RunRequest {
                    kind,
                    params: OperationParams { target, ue_count },
                    timeout: Duration::from_secs(timeout_secs),
                    poll_interval: Duration::from_millis(poll_interval_ms),
                })
            }
            Commands::Results { kind } => Action::Results(kind),
            Commands::HopWorker { target, output } => Action::HopWorker { target, output },
        };

        Ok(Config {
            orchestrator,
            action,
        })
    }
}
