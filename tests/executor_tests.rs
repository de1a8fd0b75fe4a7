//! End-to-end attempts against a real Docker daemon.
//!
//! Run with `cargo test --test executor_tests -- --ignored`.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use job_executor::config::ExecutorConfig;
use job_executor::execution::{ExecutionReport, FailureCause, TerminalState};
use job_executor::job::{JobRunRequest, Step};
use job_executor::lease::InMemoryLeaseService;
use job_executor::runtime::DockerCliRuntime;
use job_executor::supervisor::ExecutionSupervisor;

/// Create a supervisor backed by the Docker CLI with the default sandbox
fn test_supervisor() -> ExecutionSupervisor {
    let config = ExecutorConfig::new("docker-test");
    ExecutionSupervisor::new(
        &config,
        Arc::new(InMemoryLeaseService::new()),
        Arc::new(DockerCliRuntime::new(config.sandbox.clone())),
    )
}

async fn run(job_id: u64, commands: &[&str]) -> ExecutionReport {
    let steps = commands
        .iter()
        .enumerate()
        .map(|(i, cmd)| Step::new(format!("step-{i}"), *cmd))
        .collect();
    test_supervisor()
        .execute(&JobRunRequest::new(job_id, steps), CancellationToken::new())
        .await
}

#[tokio::test]
#[ignore = "requires a docker daemon"]
async fn test_execute_simple_command() {
    let report = run(1, &["echo hello"]).await;

    assert_eq!(report.job_id, 1);
    assert_eq!(report.terminal_state, TerminalState::Succeeded);
    assert_eq!(report.exit_code, Some(0));
    assert_eq!(report.stdout_lossy(), "hello\n");
}

#[tokio::test]
#[ignore = "requires a docker daemon"]
async fn test_execute_large_output() {
    let report = run(2, &["seq 1 1000"]).await;

    assert_eq!(report.terminal_state, TerminalState::Succeeded);
    assert_eq!(report.stdout_lossy().lines().count(), 1000);
}

#[tokio::test]
#[ignore = "requires a docker daemon"]
async fn test_execute_command_failure() {
    let report = run(3, &["echo 'error message' >&2 && exit 1"]).await;

    assert_eq!(report.terminal_state, TerminalState::Failed);
    assert_eq!(report.cause, Some(FailureCause::NonZeroExit(1)));
    assert!(report.stderr_lossy().contains("error message"));
}

#[tokio::test]
#[ignore = "requires a docker daemon"]
async fn test_failing_step_stops_the_job() {
    let report = run(4, &["echo first", "false", "echo never"]).await;

    assert_eq!(report.terminal_state, TerminalState::Failed);
    let stdout = report.stdout_lossy();
    assert!(stdout.contains("first"));
    assert!(!stdout.contains("never"));
}

#[tokio::test]
#[ignore = "requires a docker daemon"]
async fn test_network_is_disabled() {
    let report = run(5, &["wget -q -T 2 -O- http://example.com"]).await;

    assert_eq!(report.terminal_state, TerminalState::Failed);
}

#[tokio::test]
#[ignore = "requires a docker daemon"]
async fn test_deadline_kills_container() {
    let supervisor = test_supervisor();
    let job = JobRunRequest::new(6, vec![Step::new("sleep", "sleep 60")]).with_timeout_secs(2);

    let started = std::time::Instant::now();
    let report = supervisor.execute(&job, CancellationToken::new()).await;

    assert_eq!(report.terminal_state, TerminalState::TimedOut);
    assert!(started.elapsed().as_secs() < 30);
}

#[tokio::test]
#[ignore = "requires a docker daemon"]
async fn test_missing_image_is_runtime_error() {
    let job = JobRunRequest::new(7, vec![Step::new("noop", "true")])
        .with_image("job-executor-test/does-not-exist:never");

    let report = test_supervisor().execute(&job, CancellationToken::new()).await;

    assert_eq!(report.terminal_state, TerminalState::RuntimeError);
}
