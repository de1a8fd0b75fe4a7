
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use job_executor::config::{ExecutorConfig, LockRequeuePolicy};
use job_executor::dispatcher::Dispatcher;
use job_executor::error::{ExecutorError, Result};
use job_executor::execution::{FailureCause, TerminalState};
use job_executor::lease::LeaseService;
use job_executor::queue::InMemoryQueue;
use job_executor::sink::MemorySink;
use test_harness::{build_job, test_config, wait_until, FakeRuntime, Script, ScriptedLeases};

/// A dispatcher running in the background, with handles on all its collaborators.
struct TestExecutor {
    queue: Arc<InMemoryQueue>,
    leases: Arc<ScriptedLeases>,
    runtime: Arc<FakeRuntime>,
    sink: Arc<MemorySink>,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl TestExecutor {
    fn start(config: ExecutorConfig, runtime: FakeRuntime) -> Self {
        let queue = Arc::new(InMemoryQueue::new());
        let leases = Arc::new(ScriptedLeases::new());
        let runtime = Arc::new(runtime);
        let sink = Arc::new(MemorySink::new());

        let dispatcher = Dispatcher::from_config(
            &config,
            queue.clone(),
            leases.clone(),
            runtime.clone(),
            sink.clone(),
        )
        .expect("test config should be valid");

        let shutdown = CancellationToken::new();
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { dispatcher.run(shutdown).await })
        };

        Self {
            queue,
            leases,
            runtime,
            sink,
            shutdown,
            handle,
        }
    }

    async fn wait_for_reports(&self, n: usize, timeout: Duration) -> bool {
        let sink = self.sink.clone();
        wait_until(timeout, || {
            let sink = sink.clone();
            async move { sink.len().await >= n }
        })
        .await
    }

    async fn wait_for_running(&self, n: usize, timeout: Duration) -> bool {
        let runtime = self.runtime.clone();
        wait_until(timeout, || {
            let runtime = runtime.clone();
            async move { runtime.running() == n }
        })
        .await
    }

    async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("Dispatcher should stop")
            .expect("Dispatcher task should not panic")
    }
}

#[tokio::test]
async fn test_runs_all_jobs_and_acks() {
    let executor = TestExecutor::start(
        test_config(),
        FakeRuntime::new(Script::runs_for(Duration::from_millis(50)).with_stdout("ok\n")),
    );
    for job_id in 1..=6 {
        executor.queue.publish_request(&build_job(job_id)).await.unwrap();
    }

    assert!(executor.wait_for_reports(6, Duration::from_secs(5)).await);

    let reports = executor.sink.reports().await;
    assert!(reports.iter().all(|r| r.terminal_state == TerminalState::Succeeded));
    assert!(reports.iter().all(|r| r.stdout_lossy() == "ok\n"));
    assert!(executor.runtime.max_running() <= 2, "Pool size is 2");
    assert!(executor.runtime.each_removed_once());

    let queue = executor.queue.clone();
    assert!(
        wait_until(Duration::from_secs(1), || {
            let queue = queue.clone();
            async move { queue.in_flight().await == 0 }
        })
        .await
    );
    assert!(queue.is_empty().await);
    assert!(executor.stop().await.is_ok());
}

#[tokio::test]
async fn test_full_pool_stops_pulling_from_queue() {
    let config = test_config().with_workers(1);
    let executor = TestExecutor::start(
        config,
        FakeRuntime::new(Script::runs_for(Duration::from_millis(200))),
    );
    for job_id in 1..=3 {
        executor.queue.publish_request(&build_job(job_id)).await.unwrap();
    }

    assert!(executor.wait_for_running(1, Duration::from_secs(2)).await);
    assert_eq!(
        executor.queue.len().await,
        2,
        "Messages stay in the queue while the pool is full"
    );

    assert!(executor.wait_for_reports(3, Duration::from_secs(5)).await);
    assert_eq!(executor.runtime.max_running(), 1);
    assert!(executor.stop().await.is_ok());
}

#[tokio::test]
async fn test_duplicate_deliveries_never_run_concurrently() {
    let executor = TestExecutor::start(
        test_config(),
        FakeRuntime::new(Script::runs_for(Duration::from_millis(200))),
    );
    executor.queue.publish_request(&build_job(42)).await.unwrap();
    executor.queue.publish_request(&build_job(42)).await.unwrap();

    // The contended copy is requeued until the holder releases, then runs.
    assert!(executor.wait_for_reports(2, Duration::from_secs(5)).await);

    let reports = executor.sink.reports_for(42).await;
    assert!(reports.iter().all(|r| r.terminal_state == TerminalState::Succeeded));
    assert_eq!(executor.runtime.max_running_for(42), 1);
    assert_eq!(executor.runtime.created().len(), 2);
    assert!(executor.stop().await.is_ok());
}

#[tokio::test]
async fn test_failed_job_is_reported_and_not_redelivered() {
    let executor = TestExecutor::start(
        test_config(),
        FakeRuntime::default().with_job_script(3, Script::exits(3)),
    );
    executor.queue.publish_request(&build_job(3)).await.unwrap();
    executor.queue.publish_request(&build_job(4)).await.unwrap();

    assert!(executor.wait_for_reports(2, Duration::from_secs(5)).await);

    let failed = executor.sink.reports_for(3).await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].terminal_state, TerminalState::Failed);
    assert_eq!(failed[0].cause, Some(FailureCause::NonZeroExit(3)));
    assert_eq!(
        executor.sink.reports_for(4).await[0].terminal_state,
        TerminalState::Succeeded
    );

    let queue = executor.queue.clone();
    assert!(
        wait_until(Duration::from_secs(1), || {
            let queue = queue.clone();
            async move { queue.dead_letters().await.len() == 1 }
        })
        .await
    );
    assert!(executor.queue.is_empty().await);
    assert!(executor.stop().await.is_ok());
}

#[tokio::test]
async fn test_lock_requeue_budget_drops_message() {
    let mut config = test_config();
    config.dispatcher.lock_requeue = LockRequeuePolicy {
        max_requeues: Some(2),
        delay: Duration::from_millis(10),
    };
    let executor = TestExecutor::start(config, FakeRuntime::default());

    // Another executor holds the job for the whole test.
    executor
        .leases
        .acquire("job-9", "other-executor", Duration::from_secs(3600))
        .await
        .unwrap();
    executor.queue.publish_request(&build_job(9)).await.unwrap();

    let queue = executor.queue.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            let queue = queue.clone();
            async move { queue.dead_letters().await.len() == 1 }
        })
        .await,
        "Message should be dropped after its requeue budget"
    );

    assert!(executor.sink.is_empty().await, "Lock contention is not reported");
    assert_eq!(executor.runtime.create_calls(), 0);
    assert!(executor.queue.is_empty().await);
    assert!(executor.stop().await.is_ok());
}

#[tokio::test]
async fn test_undecodable_message_does_not_stop_dispatch() {
    let executor = TestExecutor::start(test_config(), FakeRuntime::default());
    executor.queue.publish(b"\x00\x01garbage".to_vec()).await.unwrap();
    executor.queue.publish_request(&build_job(5)).await.unwrap();

    assert!(executor.wait_for_reports(1, Duration::from_secs(5)).await);
    assert_eq!(executor.sink.reports_for(5).await.len(), 1);
    assert_eq!(executor.queue.dead_letters().await.len(), 1);
    assert!(executor.stop().await.is_ok());
}

#[tokio::test]
async fn test_shutdown_cancels_and_requeues_in_flight_jobs() {
    let executor = TestExecutor::start(
        test_config(),
        FakeRuntime::new(Script::runs_for(Duration::from_secs(60))),
    );
    executor.queue.publish_request(&build_job(6)).await.unwrap();
    assert!(executor.wait_for_running(1, Duration::from_secs(2)).await);

    let queue = executor.queue.clone();
    let sink = executor.sink.clone();
    let runtime = executor.runtime.clone();
    let leases = executor.leases.clone();
    assert!(executor.stop().await.is_ok());

    let reports = sink.reports_for(6).await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].terminal_state, TerminalState::Failed);
    assert_eq!(reports[0].cause, Some(FailureCause::Cancelled));

    assert_eq!(runtime.killed(), runtime.created());
    assert!(runtime.each_removed_once());
    assert_eq!(leases.releases(), 1);
    assert!(leases.inner.holder("job-6").await.is_none());

    // Another executor can pick the job up again.
    assert_eq!(queue.len().await, 1);
    assert_eq!(queue.in_flight().await, 0);
}

#[tokio::test]
async fn test_stuck_cleanup_exceeds_grace_period() {
    let mut config = test_config();
    config.dispatcher.grace = Duration::from_millis(100);
    let executor = TestExecutor::start(
        config,
        FakeRuntime::new(Script {
            run_for: Duration::from_secs(60),
            remove_delay: Duration::from_secs(60),
            ..Default::default()
        }),
    );
    executor.queue.publish_request(&build_job(7)).await.unwrap();
    assert!(executor.wait_for_running(1, Duration::from_secs(2)).await);

    let result = executor.stop().await;
    assert!(matches!(result, Err(ExecutorError::GraceExceeded(_))));
}

#[tokio::test]
async fn test_idle_dispatcher_stops_immediately() {
    let executor = TestExecutor::start(test_config(), FakeRuntime::default());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(executor.stop().await.is_ok());
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = test_config().with_workers(0);
    let result = Dispatcher::from_config(
        &config,
        Arc::new(InMemoryQueue::new()),
        Arc::new(ScriptedLeases::new()),
        Arc::new(FakeRuntime::default()),
        Arc::new(MemorySink::new()),
    );
    assert!(matches!(result, Err(ExecutorError::Config(_))));
}
