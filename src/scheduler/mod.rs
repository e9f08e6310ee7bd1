//! Cluster scheduler abstraction.
//!
//! The orchestrator, the log aggregator, and the remote executor only
//! depend on the [`Scheduler`] capability surface. [`NomadClient`] is the
//! production implementation talking to the Nomad HTTP API.

mod nomad;
mod types;

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::jobspec::Job;

pub use nomad::{FrameDecoder, NomadClient};
pub use types::{
    Allocation, Deployment, DeploymentStatus, ExecOutput, JobSummary, LogFrame, LogOrigin,
    LogRequest, LogStreamKind, LogSubscription, TaskEvent, TaskState,
};

/// Boxed future returned by scheduler operations.
pub type SchedulerFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, SchedulerError>> + Send + 'a>>;

/// Errors raised by scheduler clients.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SchedulerError {
    /// Raised when the scheduler cannot be reached at start-up.
    #[error("cannot connect to scheduler at {address}: {message}")]
    Connection {
        /// Address that was tried.
        address: String,
        /// Transport message.
        message: String,
    },
    /// Raised when a request fails in transit.
    #[error("scheduler request {operation} failed: {message}")]
    Request {
        /// Operation being performed.
        operation: String,
        /// Transport message.
        message: String,
    },
    /// Raised when the scheduler answers with an error status.
    #[error("scheduler rejected {operation} with status {status}: {body}")]
    Status {
        /// Operation being performed.
        operation: String,
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },
    /// Raised when a response cannot be decoded.
    #[error("failed to decode scheduler response for {operation}: {message}")]
    Decode {
        /// Operation being performed.
        operation: String,
        /// Decoder message.
        message: String,
    },
    /// Raised when remote execution cannot be started.
    #[error("failed to exec in allocation {alloc_id}: {message}")]
    Exec {
        /// Target allocation.
        alloc_id: String,
        /// Underlying error.
        message: String,
    },
}

/// Operations the network orchestration needs from a cluster scheduler.
pub trait Scheduler: Send + Sync {
    /// Registers (creates or updates) a job.
    fn register_job<'a>(&'a self, job: &'a Job) -> SchedulerFuture<'a, ()>;

    /// Returns the job's status, or `None` when the job is unknown.
    fn job_status<'a>(&'a self, job_id: &'a str) -> SchedulerFuture<'a, Option<String>>;

    /// Lists every job known to the scheduler.
    fn list_jobs(&self) -> SchedulerFuture<'_, Vec<JobSummary>>;

    /// Deregisters a job. Deregistering an unknown job succeeds.
    fn deregister_job<'a>(&'a self, job_id: &'a str, purge: bool) -> SchedulerFuture<'a, ()>;

    /// Latest deployment of a job, if it has one.
    fn latest_deployment<'a>(&'a self, job_id: &'a str)
    -> SchedulerFuture<'a, Option<Deployment>>;

    /// Allocations of a job.
    fn job_allocations<'a>(&'a self, job_id: &'a str) -> SchedulerFuture<'a, Vec<Allocation>>;

    /// Opens a log subscription for one task stream.
    fn follow_logs(&self, request: LogRequest) -> SchedulerFuture<'_, LogSubscription>;

    /// Runs `command` inside `task` of allocation `alloc_id`.
    fn exec<'a>(
        &'a self,
        alloc_id: &'a str,
        task: &'a str,
        command: &'a [String],
    ) -> SchedulerFuture<'a, ExecOutput>;

    /// Triggers scheduler garbage collection.
    fn garbage_collect(&self) -> SchedulerFuture<'_, ()>;
}
