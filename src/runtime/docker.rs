use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::SandboxConfig;
use crate::error::{ExecutorError, Result};
use crate::runtime::{
    ContainerHandle, ContainerRuntime, ContainerSpec, ExitStatus, LogStreams,
};

/// Runs job containers through the `docker` CLI with security isolation.
///
/// Every container is created with:
/// - Network isolation (disabled by default)
/// - Dropped capabilities
/// - Read-only root filesystem
/// - Memory and CPU limits
///
/// Containers are not started with `--rm`; the supervisor collects logs first
/// and removes the container itself.
#[derive(Debug, Clone)]
pub struct DockerCliRuntime {
    config: SandboxConfig,
    binary: String,
}

impl DockerCliRuntime {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            binary: "docker".to_string(),
        }
    }

    /// Use a different CLI binary (e.g. `podman`).
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Arguments for `docker create`.
    pub fn create_args(&self, spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            format!("--name={}", spec.name),
        ];

        let mut labels: Vec<_> = spec.labels.iter().collect();
        labels.sort();
        for (key, value) in labels {
            args.push(format!("--label={}={}", key, value));
        }

        // Network isolation
        if self.config.network_disabled {
            args.push("--network=none".to_string());
        }

        // Memory limit
        if let Some(ref limit) = self.config.memory_limit {
            args.push(format!("--memory={}", limit));
        }

        // CPU limit
        if let Some(ref limit) = self.config.cpu_limit {
            args.push(format!("--cpus={}", limit));
        }

        // Security: drop all capabilities, no new privileges
        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());

        // Read-only root filesystem
        args.push("--read-only".to_string());

        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }

    /// Run a docker subcommand to completion and return its trimmed stdout.
    async fn docker(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ExecutorError::Runtime(format!("failed to run {}: {}", self.binary, e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(ExecutorError::Runtime(format!(
                "{} {} failed ({}): {}",
                self.binary,
                args.first().copied().unwrap_or_default(),
                output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr
            )))
        }
    }
}

fn is_missing_container(err: &ExecutorError) -> bool {
    matches!(err, ExecutorError::Runtime(msg) if msg.contains("No such container"))
}

fn parse_exit_code(raw: &str) -> Result<ExitStatus> {
    let code = raw
        .lines()
        .last()
        .unwrap_or_default()
        .trim()
        .parse::<i32>()
        .map_err(|e| ExecutorError::Runtime(format!("unexpected docker wait output {raw:?}: {e}")))?;
    Ok(ExitStatus { code })
}

#[async_trait]
impl ContainerRuntime for DockerCliRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        let args = self.create_args(spec);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = self.docker(&args).await?;
        if id.is_empty() {
            return Err(ExecutorError::Runtime("docker create returned no container id".into()));
        }
        tracing::debug!(container_id = %id, image = %spec.image, "Container created");
        Ok(ContainerHandle { id })
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<()> {
        self.docker(&["start", &handle.id]).await.map(|_| ())
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<ExitStatus> {
        let raw = self.docker(&["wait", &handle.id]).await?;
        parse_exit_code(&raw)
    }

    async fn stream_logs(&self, handle: &ContainerHandle) -> Result<LogStreams> {
        let mut child = Command::new(&self.binary)
            .args(["logs", &handle.id])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::Runtime(format!("failed to run {} logs: {}", self.binary, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutorError::Internal("docker logs stdout not piped".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecutorError::Internal("docker logs stderr not piped".into()))?;

        // Reap the CLI process once it has written everything.
        tokio::spawn(async move {
            if let Err(e) = child.wait().await {
                tracing::debug!(error = %e, "docker logs process did not exit cleanly");
            }
        });

        Ok(LogStreams {
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
        })
    }

    async fn kill(&self, handle: &ContainerHandle) -> Result<()> {
        match self.docker(&["kill", &handle.id]).await {
            Ok(_) => Ok(()),
            // Already exited: nothing to stop.
            Err(ExecutorError::Runtime(msg)) if msg.contains("is not running") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        match self.docker(&["rm", "--force", &handle.id]).await {
            Ok(_) => Ok(()),
            Err(e) if is_missing_container(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
