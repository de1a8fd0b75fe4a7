//! Distributed job executor.
//!
//! Consumes job-run requests from a work queue and runs each one inside a
//! disposable container, guarded by a lease so that a job is executed by at
//! most one worker across the fleet at any time.
//!
//! - [`queue`]: work queue boundary and decoding consumer
//! - [`lease`]: lease service boundary and coordinator client
//! - [`runtime`]: container runtime boundary, client and Docker CLI backend
//! - [`supervisor`]: one attempt end to end, with lease heartbeating
//! - [`dispatcher`]: bounded worker pool, ack/nack, graceful drain
//! - [`sink`]: where closed executions are reported

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod execution;
pub mod job;
pub mod lease;
pub mod queue;
pub mod retry;
pub mod runtime;
pub mod shutdown;
pub mod sink;
pub mod supervisor;

pub use error::{ExecutorError, Result};
