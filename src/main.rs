type Result<T> = color_eyre::eyre::Result<T>;

mod cli;
mod signals;

use clap::Parser;
use eyre::eyre;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::select;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Action, Cli, Config, RunRequest};
use perf_harness::hop_probe::{self, PingProbe, ProgressEvent};
use perf_harness::{Completion, ProbeResult, TestOrchestrator};
use signals::Signals;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    // stdout carries results and hop worker events, so logs go to stderr
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_cli(cli)?;

    match config.action {
        Action::HopWorker { target, output } => {
            let ping_program = config.orchestrator.ping_program.clone();
            let max_hops = config.orchestrator.max_hops;
            tokio::task::spawn_blocking(move || {
                run_hop_worker(&target, &output, ping_program, max_hops)
            })
            .await?;
            Ok(())
        }
        Action::Results(kind) => {
            let orchestrator = TestOrchestrator::new(config.orchestrator);
            let result = orchestrator.results(kind)?;
            print_result(&result)
        }
        Action::Run(request) => {
            let orchestrator = TestOrchestrator::new(config.orchestrator);
            run_operation(&orchestrator, request).await
        }
    }
}

/// Worker side of the hop-count probe
fn run_hop_worker(target: &str, output: &Path, ping_program: PathBuf, max_hops: u32) {
    info!("Computing the number of hops until {}", target);

    let mut probe = PingProbe::new(ping_program);
    let mut emit = |event: ProgressEvent| {
        if let Err(e) = report_progress(&event) {
            // The parent may have gone away; the result file still matters.
            debug!("Could not report {:?}: {}", event, e);
        }
    };

    let hops = hop_probe::run_worker(&mut probe, target, max_hops, output, &mut emit);
    info!("Hop probe for {} finished with {}", target, hops);
}

/// Writes one event as a JSON line to stdout
fn report_progress(event: &ProgressEvent) -> std::io::Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, event)?;
    writeln!(stdout)?;
    stdout.flush()
}

enum Outcome {
    Ready(ProbeResult),
    Exited(Option<Completion>),
    Interrupted,
    TimedOut,
}

/// Starts one operation and waits for a usable result, a signal, or the timeout
async fn run_operation(orchestrator: &TestOrchestrator, request: RunRequest) -> Result<()> {
    let kind = request.kind;
    let mut signals = Signals::new()?;

    let status = orchestrator.start(kind, &request.params).await?;
    println!("{}", status);

    let deadline = sleep(request.timeout);
    tokio::pin!(deadline);
    let mut poll = interval(request.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Monitors append as they go, so their file is only complete at exit.
    let poll_results = !kind.is_monitor();

    let outcome = loop {
        select! {
            _ = signals.next() => {
                info!("received signal, stopping {}", kind);
                break Outcome::Interrupted;
            }
            _ = &mut deadline => break Outcome::TimedOut,
            exit = orchestrator.wait(kind) => {
                break match orchestrator.results(kind) {
                    Ok(result) => Outcome::Ready(result),
                    Err(_) => Outcome::Exited(exit),
                };
            }
            _ = poll.tick(), if poll_results => {
                match orchestrator.results(kind) {
                    Ok(result) => break Outcome::Ready(result),
                    Err(e) if e.is_not_ready() => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }
    };

    match outcome {
        Outcome::Ready(result) => print_result(&result),
        Outcome::Interrupted => {
            let terminated = orchestrator.stop(kind);
            println!(
                "Successfully Cleaned Up test environment ({} processes terminated)",
                terminated
            );
            Ok(())
        }
        Outcome::TimedOut => {
            let terminated = orchestrator.stop(kind);
            warn!("{} timed out, terminated {} processes", kind, terminated);
            Err(eyre!("{} produced no result within {:?}", kind, request.timeout))
        }
        Outcome::Exited(exit) => Err(eyre!(
            "{} ended ({:?}) without a usable result",
            kind,
            exit
        )),
    }
}

fn print_result(result: &ProbeResult) -> Result<()> {
    match result {
        ProbeResult::Connections(log) => print!("{}", log.as_str()),
        structured => println!("{}", serde_json::to_string_pretty(structured)?),
    }
    Ok(())
}
