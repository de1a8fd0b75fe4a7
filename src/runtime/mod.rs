//! Container runtime boundary.
//!
//! [`ContainerRuntime`] wraps one isolated, disposable execution unit per job
//! attempt: create, start, wait, stream logs, kill, remove. Every call has its
//! own failure domain and reports failures as `ExecutorError::Runtime`.
//!
//! [`ContainerClient`] is what the supervisor uses: it adds bounded retries
//! around `create` and `start` and leaves the rest untouched.

pub mod docker;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::error::{ExecutorError, Result};
use crate::job::JobRunRequest;
use crate::retry::RetryPolicy;

pub use docker::DockerCliRuntime;

pub const LABEL_JOB_ID: &str = "job-executor.job-id";
pub const LABEL_ATTEMPT_ID: &str = "job-executor.attempt-id";

/// What to run: a single image and a single command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    pub fn for_request(request: &JobRunRequest, sandbox: &SandboxConfig, attempt_id: Uuid) -> Self {
        let mut labels = HashMap::new();
        labels.insert(LABEL_JOB_ID.to_string(), request.job_id.to_string());
        labels.insert(LABEL_ATTEMPT_ID.to_string(), attempt_id.to_string());

        Self {
            name: format!("job-{}-{}", request.job_id, attempt_id.simple()),
            image: request
                .image
                .clone()
                .unwrap_or_else(|| sandbox.image.clone()),
            command: vec!["sh".to_string(), "-c".to_string(), request.script()],
            labels,
        }
    }
}

/// Runtime identifier of a created container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle {
    pub id: String,
}

impl std::fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i32,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Demultiplexed container output.
pub struct LogStreams {
    pub stdout: ByteStream,
    pub stderr: ByteStream,
}

impl LogStreams {
    pub fn from_bytes(stdout: Vec<u8>, stderr: Vec<u8>) -> Self {
        Self {
            stdout: Box::pin(std::io::Cursor::new(stdout)),
            stderr: Box::pin(std::io::Cursor::new(stderr)),
        }
    }

    /// Read both streams to the end.
    pub async fn drain(mut self) -> Result<ContainerLogs> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let (out, err) = tokio::join!(
            self.stdout.read_to_end(&mut stdout),
            self.stderr.read_to_end(&mut stderr)
        );
        out.map_err(|e| ExecutorError::Runtime(format!("reading stdout: {e}")))?;
        err.map_err(|e| ExecutorError::Runtime(format!("reading stderr: {e}")))?;
        Ok(ContainerLogs { stdout, stderr })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerLogs {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle>;

    async fn start(&self, handle: &ContainerHandle) -> Result<()>;

    /// Resolve once the container is no longer running.
    async fn wait(&self, handle: &ContainerHandle) -> Result<ExitStatus>;

    async fn stream_logs(&self, handle: &ContainerHandle) -> Result<LogStreams>;

    /// Stop a running container immediately.
    async fn kill(&self, handle: &ContainerHandle) -> Result<()>;

    /// Delete the container, addressed by id or by name. Removing a container
    /// that does not exist (or no longer exists) succeeds.
    async fn remove(&self, handle: &ContainerHandle) -> Result<()>;
}

/// Container runtime client used by execution supervisors.
#[derive(Clone)]
pub struct ContainerClient {
    runtime: Arc<dyn ContainerRuntime>,
    retry: RetryPolicy,
}

impl ContainerClient {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, retry: RetryPolicy) -> Self {
        Self { runtime, retry }
    }

    /// Create with retries. A failed call may still have created the
    /// container (e.g. the CLI timed out after the daemon accepted it), so
    /// whatever carries `spec.name` is removed before the next try and after
    /// the last one.
    pub async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        self.retry
            .run("container_create", || async move {
                match self.runtime.create(spec).await {
                    Ok(handle) => Ok(handle),
                    Err(e) => {
                        self.discard(&spec.name).await;
                        Err(e)
                    }
                }
            })
            .await
    }

    async fn discard(&self, name: &str) {
        let orphan = ContainerHandle {
            id: name.to_string(),
        };
        if let Err(e) = self.runtime.remove(&orphan).await {
            tracing::warn!(container = name, error = %e, "Failed to remove container left by a failed create");
        }
    }

    pub async fn start(&self, handle: &ContainerHandle) -> Result<()> {
        self.retry
            .run("container_start", || self.runtime.start(handle))
            .await
    }

    pub async fn wait(&self, handle: &ContainerHandle) -> Result<ExitStatus> {
        self.runtime.wait(handle).await
    }

    pub async fn drain_logs(&self, handle: &ContainerHandle) -> Result<ContainerLogs> {
        self.runtime.stream_logs(handle).await?.drain().await
    }

    pub async fn kill(&self, handle: &ContainerHandle) -> Result<()> {
        self.runtime.kill(handle).await
    }

    pub async fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        self.runtime.remove(handle).await
    }
}

impl std::fmt::Debug for ContainerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerClient")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
