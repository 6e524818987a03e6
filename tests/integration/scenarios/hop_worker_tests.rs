//! The hidden `hop-worker` subcommand, run as the orchestrator runs it

use crate::integration::CliTestHarness;
use anyhow::Result;
use perf_harness::ProgressEvent;
use std::time::Duration;

fn events(stdout: &[u8]) -> Result<Vec<ProgressEvent>> {
    std::str::from_utf8(stdout)?
        .lines()
        .map(|line| serde_json::from_str::<ProgressEvent>(line).map_err(anyhow::Error::from))
        .collect()
}

#[tokio::test]
async fn test_worker_reports_first_reaching_ttl() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = CliTestHarness::new()?;
    let output = harness.results_dir().join("hops.json");
    let output_arg = output.display().to_string();

    let result = harness
        .run(
            &[
                "hop-worker",
                "--target",
                "127.0.0.1",
                "--output",
                &output_arg,
                "--ping-program",
                "true",
            ],
            Duration::from_secs(10),
        )
        .await?;

    assert!(result.status.success());
    assert_eq!(
        events(&result.stdout)?,
        vec![
            ProgressEvent::Probing { ttl: 1 },
            ProgressEvent::Reached { ttl: 1 },
        ]
    );
    assert_eq!(std::fs::read_to_string(&output)?, r#"{"hops_until_target":1}"#);
    Ok(())
}

#[tokio::test]
async fn test_worker_gives_up_at_hop_ceiling() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = CliTestHarness::new()?;
    let output = harness.results_dir().join("hops.json");
    let output_arg = output.display().to_string();

    let result = harness
        .run(
            &[
                "hop-worker",
                "--target",
                "203.0.113.9",
                "--output",
                &output_arg,
                "--ping-program",
                "false",
                "--max-hops",
                "4",
            ],
            Duration::from_secs(10),
        )
        .await?;

    // Unreachable is a result, not a worker failure
    assert!(result.status.success());

    let events = events(&result.stdout)?;
    let probed: Vec<u32> = events
        .iter()
        .filter_map(|event| match event {
            ProgressEvent::Probing { ttl } => Some(*ttl),
            _ => None,
        })
        .collect();
    assert_eq!(probed, vec![1, 2, 3, 4, 5]);
    assert_eq!(events.last(), Some(&ProgressEvent::Unreachable));
    assert_eq!(std::fs::read_to_string(&output)?, r#"{"hops_until_target":-1}"#);
    Ok(())
}

#[tokio::test]
async fn test_worker_reports_unwritable_output() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = CliTestHarness::new()?;
    let output = harness.results_dir().join("missing").join("hops.json");
    let output_arg = output.display().to_string();

    let result = harness
        .run(
            &[
                "hop-worker",
                "--target",
                "127.0.0.1",
                "--output",
                &output_arg,
                "--ping-program",
                "true",
            ],
            Duration::from_secs(10),
        )
        .await?;

    let events = events(&result.stdout)?;
    assert!(matches!(events.last(), Some(ProgressEvent::WriteError { .. })));
    assert!(!output.exists());
    Ok(())
}
