//! Background-job streaming behavior over the public registry API.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use shellgate::config::ServerConfig;
use shellgate::exec::jobs::{JobRegistry, JobStatus, MAX_JOB_OUTPUT};

fn shell() -> shellgate::config::ShellProfile {
    let config = ServerConfig::default();
    config
        .shells
        .get("bash")
        .or_else(|| config.shells.get("sh"))
        .or_else(|| config.shells.values().next())
        .expect("a default shell")
        .clone()
}

fn env() -> HashMap<String, String> {
    std::env::vars().collect()
}

async fn wait_complete(registry: &JobRegistry, id: &str) {
    for _ in 0..200 {
        if registry.output(id, 0).await.unwrap().complete {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job {id} never completed");
}

#[tokio::test]
async fn streaming_poll_yields_non_overlapping_increments() {
    let registry = JobRegistry::new(20);
    let id = registry
        .start(
            "bash",
            &shell(),
            "printf alpha; sleep 0.4; printf beta; sleep 0.4; printf gamma",
            PathBuf::from("/tmp"),
            env(),
            Duration::from_secs(30),
        )
        .await
        .unwrap();

    let mut offset = 0usize;
    let mut pieces: Vec<String> = Vec::new();
    loop {
        let polled = registry.output(&id, offset).await.unwrap();
        if !polled.output.is_empty() {
            pieces.push(polled.output.clone());
        }
        offset = polled.total_size;
        if polled.complete {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let combined = pieces.concat();
    assert_eq!(combined, "alphabetagamma");
    // Each marker arrived exactly once across the incremental reads.
    for marker in ["alpha", "beta", "gamma"] {
        assert_eq!(combined.matches(marker).count(), 1, "{marker}");
    }
}

#[tokio::test]
async fn output_window_is_bounded_and_keeps_suffix() {
    let registry = JobRegistry::new(20);
    let id = registry
        .start(
            "bash",
            &shell(),
            // ~1.5 MiB in 1 KiB lines, each tagged with its index
            "for i in $(seq 1 1536); do printf 'L%06d%01016d\\n' $i 0; done",
            PathBuf::from("/tmp"),
            env(),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
    wait_complete(&registry, &id).await;

    let out = registry.output(&id, 0).await.unwrap();
    assert!(out.output.len() <= MAX_JOB_OUTPUT);
    assert!(out.total_size > MAX_JOB_OUTPUT);
    // The retained bytes are the suffix of the full stream.
    assert!(out.output.contains("L001536"));
    assert!(!out.output.contains("L000001"));
}

#[tokio::test]
async fn timeout_transitions_to_timeout_status() {
    let registry = JobRegistry::new(20);
    let id = registry
        .start(
            "bash",
            &shell(),
            "sleep 60",
            PathBuf::from("/tmp"),
            env(),
            Duration::from_millis(300),
        )
        .await
        .unwrap();
    wait_complete(&registry, &id).await;

    let record = registry.get(&id).await.unwrap();
    assert_eq!(record.status, JobStatus::Timeout);
    assert!(record.end_time.is_some());
    let out = registry.output(&id, 0).await.unwrap();
    assert!(out.output.contains("timed out"));
}

#[tokio::test]
async fn registry_capacity_and_cleanup_paths() {
    let registry = JobRegistry::new(3);
    for _ in 0..3 {
        registry
            .start(
                "bash",
                &shell(),
                "sleep 5",
                PathBuf::from("/tmp"),
                env(),
                Duration::from_secs(30),
            )
            .await
            .unwrap();
    }
    // Full of running jobs: cleanup cannot help, so the start refuses.
    assert!(
        registry
            .start(
                "bash",
                &shell(),
                "true",
                PathBuf::from("/tmp"),
                env(),
                Duration::from_secs(30),
            )
            .await
            .is_err()
    );

    let records = registry.list().await;
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == JobStatus::Running));
}
