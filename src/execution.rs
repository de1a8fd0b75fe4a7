use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Terminal outcome of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    Succeeded,
    Failed,
    TimedOut,
    LockNotAcquired,
    RuntimeError,
}

impl std::fmt::Display for TerminalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalState::Succeeded => write!(f, "succeeded"),
            TerminalState::Failed => write!(f, "failed"),
            TerminalState::TimedOut => write!(f, "timed_out"),
            TerminalState::LockNotAcquired => write!(f, "lock_not_acquired"),
            TerminalState::RuntimeError => write!(f, "runtime_error"),
        }
    }
}

/// Supervisor state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Pending,
    LockAcquiring,
    Running,
    Finalizing,
    Terminal(TerminalState),
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionState::Pending => write!(f, "pending"),
            ExecutionState::LockAcquiring => write!(f, "lock_acquiring"),
            ExecutionState::Running => write!(f, "running"),
            ExecutionState::Finalizing => write!(f, "finalizing"),
            ExecutionState::Terminal(t) => t.fmt(f),
        }
    }
}

/// Why an attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureCause {
    NonZeroExit(i32),
    LockLost,
    DeadlineExceeded,
    Cancelled,
    LockHeld,
    LeaseUnavailable(String),
    Runtime(String),
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCause::NonZeroExit(code) => write!(f, "exit code {code}"),
            FailureCause::LockLost => write!(f, "lock lost"),
            FailureCause::DeadlineExceeded => write!(f, "deadline exceeded"),
            FailureCause::Cancelled => write!(f, "cancelled by executor shutdown"),
            FailureCause::LockHeld => write!(f, "lease held by another executor"),
            FailureCause::LeaseUnavailable(e) => write!(f, "lease service unavailable: {e}"),
            FailureCause::Runtime(e) => write!(f, "container runtime: {e}"),
        }
    }
}

/// Record emitted to the result sink when an execution closes.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub job_id: u64,
    pub attempt_id: Uuid,
    pub terminal_state: TerminalState,
    pub cause: Option<FailureCause>,
    pub exit_code: Option<i32>,
    #[serde(serialize_with = "lossy_utf8")]
    pub stdout: Vec<u8>,
    #[serde(serialize_with = "lossy_utf8")]
    pub stderr: Vec<u8>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionReport {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Lock contention is not a closed execution and is never reported.
    pub fn is_reportable(&self) -> bool {
        self.terminal_state != TerminalState::LockNotAcquired
    }
}

fn lossy_utf8<S: serde::Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&String::from_utf8_lossy(bytes))
}
