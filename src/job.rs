use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ExecutorError, Result};

/// One named shell command of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(alias = "run")]
    pub command: String,
}

impl Step {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }
}

/// A request to run a job once, as delivered by the work queue.
///
/// Immutable once dequeued. The submission side has already validated it;
/// decoding only rejects payloads that cannot be executed at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRunRequest {
    pub job_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub run_once: bool,
    /// Overrides the executor's sandbox image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Overrides the executor's default job deadline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl JobRunRequest {
    pub fn new(job_id: u64, steps: Vec<Step>) -> Self {
        Self {
            job_id,
            name: None,
            steps,
            run_once: false,
            image: None,
            timeout_secs: None,
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let request: JobRunRequest = serde_json::from_slice(payload)
            .map_err(|e| ExecutorError::InvalidPayload(e.to_string()))?;
        request.validate()?;
        Ok(request)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(ExecutorError::InvalidPayload(format!(
                "job {} has no steps",
                self.job_id
            )));
        }
        if let Some(step) = self.steps.iter().find(|s| s.command.trim().is_empty()) {
            return Err(ExecutorError::InvalidPayload(format!(
                "job {} step '{}' has an empty command",
                self.job_id, step.name
            )));
        }
        Ok(())
    }

    /// Key under which executors compete for this job's lease.
    pub fn lease_key(&self) -> String {
        format!("job-{}", self.job_id)
    }

    /// All steps as a single shell script; the first failing step ends the run.
    pub fn script(&self) -> String {
        let mut script = String::from("set -e\n");
        for step in &self.steps {
            script.push_str(&step.command);
            script.push('\n');
        }
        script
    }
}

/// Load a JSON array of job requests, validating each.
pub fn load_jobs_file(path: impl AsRef<Path>) -> Result<Vec<JobRunRequest>> {
    let raw = std::fs::read(path.as_ref())?;
    let requests: Vec<JobRunRequest> = serde_json::from_slice(&raw)
        .map_err(|e| ExecutorError::InvalidPayload(e.to_string()))?;
    for request in &requests {
        request.validate()?;
    }
    Ok(requests)
}
