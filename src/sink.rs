use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::execution::ExecutionReport;

/// Destination for closed executions (status store, API, ...).
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn publish(&self, report: &ExecutionReport) -> Result<()>;
}

/// Keeps every report in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    reports: RwLock<Vec<ExecutionReport>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reports(&self) -> Vec<ExecutionReport> {
        self.reports.read().await.clone()
    }

    pub async fn reports_for(&self, job_id: u64) -> Vec<ExecutionReport> {
        self.reports
            .read()
            .await
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.reports.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn publish(&self, report: &ExecutionReport) -> Result<()> {
        self.reports.write().await.push(report.clone());
        Ok(())
    }
}

/// Emits each report as one structured log event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl ResultSink for TracingSink {
    async fn publish(&self, report: &ExecutionReport) -> Result<()> {
        let json = serde_json::to_string(report)?;
        tracing::info!(
            job_id = report.job_id,
            attempt_id = %report.attempt_id,
            state = %report.terminal_state,
            exit_code = ?report.exit_code,
            report = %json,
            "Execution closed"
        );
        Ok(())
    }
}
