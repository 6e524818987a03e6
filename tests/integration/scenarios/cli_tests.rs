//! The `run` and `results` commands of the binary

use crate::integration::CliTestHarness;
use anyhow::Result;
use nix::sys::signal::Signal;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

const IPERF_REPORT: &str = r#"{
    "start": { "test_start": { "protocol": "TCP", "num_streams": 2 } },
    "end": {
        "streams": [
            { "sender": { "mean_rtt": 20000 } },
            { "sender": { "mean_rtt": 30000 } }
        ],
        "sum_sent": { "bits_per_second": 500000000 }
    }
}"#;

#[tokio::test]
async fn test_results_of_unfinished_test_fail() -> Result<()> {
    let mut harness = CliTestHarness::new()?;
    let output = harness
        .run(&["results", "max-hops"], Duration::from_secs(10))
        .await?;

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not finished"), "stderr: {}", stderr);
    Ok(())
}

#[tokio::test]
async fn test_results_prints_throughput_summary() -> Result<()> {
    let mut harness = CliTestHarness::new()?;
    std::fs::write(
        harness.results_dir().join("client_output_Def14Perf1.json"),
        IPERF_REPORT,
    )?;

    let output = harness
        .run(&["results", "e2e-single-ue"], Duration::from_secs(10))
        .await?;

    assert!(output.status.success());
    let summary: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(summary["throughput_mbps"], 500.0);
    assert_eq!(summary["mean_rtt_ms"], 25.0);
    Ok(())
}

#[tokio::test]
async fn test_results_prints_connection_log_verbatim() -> Result<()> {
    let mut harness = CliTestHarness::new()?;
    std::fs::write(
        harness.results_dir().join("client_output_Def14Perf7.txt"),
        "4\n9\n6\n",
    )?;

    let output = harness
        .run(&["results", "callback-max-connections"], Duration::from_secs(10))
        .await?;

    assert!(output.status.success());
    assert_eq!(String::from_utf8(output.stdout)?, "4\n9\n6\n");
    Ok(())
}

#[tokio::test]
async fn test_run_max_hops_until_result() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = CliTestHarness::new()?;
    let output = harness
        .run(
            &[
                "run",
                "max-hops",
                "--target",
                "127.0.0.1",
                "--ping-program",
                "true",
                "--poll-interval-ms",
                "50",
            ],
            Duration::from_secs(20),
        )
        .await?;

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8(output.stdout)?;
    let (status, result) = stdout
        .split_once('\n')
        .ok_or_else(|| anyhow::anyhow!("unexpected output: {}", stdout))?;
    assert_eq!(status, "Started Max Hops Performance Test");

    let result: serde_json::Value = serde_json::from_str(result)?;
    assert_eq!(result["hops_until_target"], 1);
    assert!(harness
        .results_dir()
        .join("client_output_Def14Perf13.json")
        .exists());
    Ok(())
}

#[tokio::test]
async fn test_run_rejects_missing_ue_count() -> Result<()> {
    let mut harness = CliTestHarness::new()?;
    let output = harness
        .run(
            &["run", "e2e-multiple-ue", "--target", "10.45.0.1"],
            Duration::from_secs(10),
        )
        .await?;

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("ue_count"), "stderr: {}", stderr);
    Ok(())
}

#[tokio::test]
async fn test_interrupt_cleans_up_running_test() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = CliTestHarness::new()?;
    let slow_ping = harness.results_dir().join("slow-ping.sh");
    std::fs::write(&slow_ping, "#!/bin/sh\nsleep 30\n")?;
    std::fs::set_permissions(&slow_ping, std::fs::Permissions::from_mode(0o755))?;
    let slow_ping_arg = slow_ping.display().to_string();

    let mut process = harness.spawn(&[
        "run",
        "max-hops",
        "--target",
        "127.0.0.1",
        "--ping-program",
        &slow_ping_arg,
    ])?;

    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert!(process.is_running(), "run should block on the hop probe");

    process.send_signal(Signal::SIGINT)?;
    let output = process
        .wait_with_output_timeout(Duration::from_secs(10))
        .await?
        .ok_or_else(|| anyhow::anyhow!("perf-harness did not exit after SIGINT"))?;

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8(output.stdout)?;
    assert!(
        stdout.contains("Successfully Cleaned Up test environment (1 processes terminated)"),
        "stdout: {}",
        stdout
    );
    Ok(())
}
