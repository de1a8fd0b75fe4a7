use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Token the dispatcher runs under, cancelled on the first SIGTERM or SIGINT.
///
/// Cancelling it stops the dispatcher from dequeuing. The dispatcher then
/// cancels in-flight executions and waits out its grace period, so a job
/// interrupted this way is requeued rather than acknowledged.
pub fn install_shutdown_handler() -> Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();

    tokio::spawn(async move {
        let received = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        tracing::info!(
            signal = received,
            "Shutdown requested, no further jobs will be dequeued and running executions will be cancelled"
        );
        trigger.cancel();
    });

    Ok(shutdown)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn sigterm_cancels_dispatcher_token() {
        let shutdown = install_shutdown_handler().unwrap();
        assert!(!shutdown.is_cancelled());

        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        tokio::time::timeout(Duration::from_secs(5), shutdown.cancelled())
            .await
            .expect("SIGTERM should cancel the shutdown token");
    }
}
