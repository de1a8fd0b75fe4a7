use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Work queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    #[error("Unknown message: {0}")]
    UnknownMessage(uuid::Uuid),

    #[error("Lease {key} is held by another owner")]
    LockHeld { key: String },

    #[error("Lease {key} expired before renewal")]
    LeaseExpired { key: String },

    #[error("Lease {key} lost: fencing token {held} superseded by {current}")]
    LeaseLost { key: String, held: u64, current: u64 },

    #[error("Lease service unavailable: {0}")]
    LeaseUnavailable(String),

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Executions still running after {0:?} grace period")]
    GraceExceeded(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExecutorError {
    /// Infrastructure errors that the owning client retries with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExecutorError::QueueUnavailable(_)
                | ExecutorError::LeaseUnavailable(_)
                | ExecutorError::Runtime(_)
        )
    }

    /// True when the lease no longer authorizes the current holder.
    pub fn is_lease_gone(&self) -> bool {
        matches!(
            self,
            ExecutorError::LeaseLost { .. } | ExecutorError::LeaseExpired { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ExecutorError::QueueUnavailable("down".into()).is_transient());
        assert!(ExecutorError::LeaseUnavailable("down".into()).is_transient());
        assert!(ExecutorError::Runtime("no image".into()).is_transient());
        assert!(!ExecutorError::LockHeld { key: "job-1".into() }.is_transient());
        assert!(!ExecutorError::InvalidPayload("bad".into()).is_transient());
    }

    #[test]
    fn lease_gone_classification() {
        let lost = ExecutorError::LeaseLost {
            key: "job-1".into(),
            held: 1,
            current: 2,
        };
        assert!(lost.is_lease_gone());
        assert!(ExecutorError::LeaseExpired { key: "job-1".into() }.is_lease_gone());
        assert!(!ExecutorError::LockHeld { key: "job-1".into() }.is_lease_gone());
        assert_eq!(
            lost.to_string(),
            "Lease job-1 lost: fencing token 1 superseded by 2"
        );
    }
}
