//! Child process supervision against real `sh` processes.
#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use delivery::error::DeliveryError;
use delivery::io::config::SPRING_BOOT_STARTED;
use delivery::io::process::{SpawnCommand, SpawnOptions, spawn_and_watch};
use delivery::io::progress_log::{EphemeralProgressLog, ProgressLog};
use delivery::io::service::{ServiceOptions, ServiceOutcome, spawn_service, spawn_service_until};
use regex::Regex;

fn sh(script: &str) -> SpawnCommand {
    SpawnCommand::new("sh", ["-c", script])
}

fn service_options() -> ServiceOptions {
    ServiceOptions {
        success_patterns: vec![Regex::new(SPRING_BOOT_STARTED).expect("regex")],
        ..ServiceOptions::default()
    }
}

#[tokio::test]
async fn zero_exit_streams_both_streams_line_by_line() {
    let log = EphemeralProgressLog::new("build");
    let result = spawn_and_watch(
        &sh("echo out; echo err >&2; printf 'tail'"),
        &SpawnOptions::default(),
        &log,
    )
    .await
    .expect("spawn");

    assert!(!result.error);
    assert_eq!(result.code, Some(0));
    assert!(!result.timed_out);
    let mut lines: Vec<&str> = result.log.lines().collect();
    lines.sort_unstable();
    assert_eq!(lines, vec!["err", "out", "tail"]);
    assert!(log.log().ends_with('\n'));
}

#[tokio::test]
async fn nonzero_exit_is_a_value_not_an_error() {
    let log = EphemeralProgressLog::new("build");
    let result = spawn_and_watch(&sh("echo failing; exit 7"), &SpawnOptions::default(), &log)
        .await
        .expect("spawn");

    assert!(result.error);
    assert_eq!(result.code, Some(7));
    assert_eq!(result.signal, None);
    assert_eq!(result.log, "failing\n");
}

#[tokio::test]
async fn error_finder_can_fail_a_zero_exit() {
    let log = EphemeralProgressLog::new("build");
    let options = SpawnOptions {
        error_finder: Arc::new(|_code, _signal, log: &str| log.contains("ERR!")),
        ..SpawnOptions::default()
    };
    let result = spawn_and_watch(&sh("echo 'npm ERR! missing script'"), &options, &log)
        .await
        .expect("spawn");

    assert_eq!(result.code, Some(0));
    assert!(result.error);
}

#[tokio::test]
async fn timeout_kills_the_process() {
    let log = EphemeralProgressLog::new("build");
    let options = SpawnOptions {
        timeout: Duration::from_millis(300),
        ..SpawnOptions::default()
    };
    let started = Instant::now();
    let result = spawn_and_watch(&sh("echo begun; exec sleep 30"), &options, &log)
        .await
        .expect("spawn");

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(result.error);
    assert!(result.timed_out);
    assert_eq!(result.code, None);
    assert_eq!(result.signal, Some(9));
    assert_eq!(log.log(), "begun\n");
}

#[tokio::test]
async fn background_grandchild_holding_output_does_not_delay_exit() {
    let log = EphemeralProgressLog::new("build");
    let options = SpawnOptions {
        timeout: Duration::from_secs(4),
        ..SpawnOptions::default()
    };
    let started = Instant::now();
    let result = spawn_and_watch(&sh("sleep 8 & echo hi; exit 0"), &options, &log)
        .await
        .expect("spawn");

    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(!result.timed_out);
    assert!(!result.error);
    assert_eq!(result.code, Some(0));
    assert_eq!(result.log, "hi\n");
}

#[tokio::test]
async fn strip_ansi_cleans_captured_lines() {
    let log = EphemeralProgressLog::new("build");
    let options = SpawnOptions {
        strip_ansi: true,
        ..SpawnOptions::default()
    };
    let result = spawn_and_watch(&sh(r"printf '\033[32mok\033[0m\n'"), &options, &log)
        .await
        .expect("spawn");

    assert_eq!(result.log, "ok\n");
}

#[tokio::test]
async fn missing_program_is_a_spawn_error() {
    let log = EphemeralProgressLog::new("build");
    let err = spawn_and_watch(
        &SpawnCommand::new("definitely-not-a-real-program-xyz", ["--version"]),
        &SpawnOptions::default(),
        &log,
    )
    .await
    .unwrap_err();

    match err.downcast_ref::<DeliveryError>() {
        Some(DeliveryError::Spawn { command, .. }) => {
            assert_eq!(command, "definitely-not-a-real-program-xyz --version");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn service_success_line_resolves_before_exit() {
    let log: Arc<EphemeralProgressLog> = Arc::new(EphemeralProgressLog::new("deploy"));
    let started = Instant::now();
    let outcome = spawn_service(
        &sh("echo booting; echo 'Started App in 0.4 seconds'; sleep 0.3; echo after; exec sleep 30"),
        &service_options(),
        log.clone(),
    )
    .await
    .expect("spawn");

    let ServiceOutcome::Started(service) = outcome else {
        panic!("expected start, got {outcome:?}");
    };
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(service.started_line(), "Started App in 0.4 seconds");
    assert!(service.pid().is_some());

    // Output after the match keeps flowing into the log.
    let deadline = Instant::now() + Duration::from_secs(5);
    while !log.log().contains("after") && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(log.log().contains("after"));

    service
        .terminate(Duration::from_secs(2))
        .await
        .expect("terminate");
}

#[tokio::test]
async fn service_exit_before_match_fails_with_exit_info() {
    let log = Arc::new(EphemeralProgressLog::new("deploy"));
    let outcome = spawn_service(
        &sh("echo 'Address already in use' >&2; exit 1"),
        &service_options(),
        log,
    )
    .await
    .expect("spawn");

    match outcome {
        ServiceOutcome::Exited { code, signal, log } => {
            assert_eq!(code, Some(1));
            assert_eq!(signal, None);
            assert_eq!(log, "Address already in use\n");
        }
        other => panic!("expected exit, got {other:?}"),
    }
}

#[tokio::test]
async fn service_printing_success_then_exiting_still_counts_as_started() {
    let log = Arc::new(EphemeralProgressLog::new("deploy"));
    let outcome = spawn_service(
        &sh("echo 'Started App in 0.1 seconds'; exit 0"),
        &service_options(),
        log,
    )
    .await
    .expect("spawn");

    let ServiceOutcome::Started(service) = outcome else {
        panic!("expected start, got {outcome:?}");
    };
    service
        .terminate(Duration::from_millis(500))
        .await
        .expect("terminate");
}

#[tokio::test]
async fn service_startup_timeout_kills_the_process() {
    let log = Arc::new(EphemeralProgressLog::new("deploy"));
    let options = ServiceOptions {
        startup_timeout: Some(Duration::from_millis(300)),
        ..service_options()
    };
    let outcome = spawn_service(&sh("echo still booting; exec sleep 30"), &options, log)
        .await
        .expect("spawn");

    match outcome {
        ServiceOutcome::TimedOut { log } => assert_eq!(log, "still booting\n"),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn cancelled_startup_kills_the_process() {
    let log = Arc::new(EphemeralProgressLog::new("deploy"));
    let started = Instant::now();
    let outcome = spawn_service_until(
        &sh("echo still booting; exec sleep 30"),
        &service_options(),
        log,
        tokio::time::sleep(Duration::from_millis(300)),
    )
    .await
    .expect("spawn");

    match outcome {
        ServiceOutcome::Cancelled { log } => assert_eq!(log, "still booting\n"),
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn terminate_escalates_when_sigterm_is_ignored() {
    let log = Arc::new(EphemeralProgressLog::new("deploy"));
    let outcome = spawn_service(
        &sh("trap '' TERM; echo 'Started App in 0.1 seconds'; while :; do sleep 0.1; done"),
        &service_options(),
        log,
    )
    .await
    .expect("spawn");
    let ServiceOutcome::Started(service) = outcome else {
        panic!("expected start, got {outcome:?}");
    };

    let started = Instant::now();
    service
        .terminate(Duration::from_millis(300))
        .await
        .expect("terminate");
    assert!(started.elapsed() < Duration::from_secs(5));
}
