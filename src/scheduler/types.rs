//! Scheduler-facing data shared by the client, orchestrator, and doubles.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::SchedulerError;

/// Nomad encodes empty collections as `null`; decode them as empty.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Entry of the scheduler's job listing.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobSummary {
    /// Job ID.
    #[serde(rename = "ID")]
    pub id: String,
    /// Job name.
    pub name: String,
    /// Scheduler status such as `pending`, `running`, or `dead`.
    pub status: String,
}

/// Status of a deployment.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    /// Still rolling out.
    Running,
    /// Paused by an operator.
    Paused,
    /// Every allocation became healthy.
    Successful,
    /// At least one allocation failed.
    Failed,
    /// Superseded or stopped.
    #[serde(alias = "cancelled")]
    Canceled,
    /// Status not known to this client.
    #[serde(other)]
    Unknown,
}

/// Latest deployment of a job.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Deployment {
    /// Deployment ID.
    #[serde(rename = "ID")]
    pub id: String,
    /// Current status.
    pub status: DeploymentStatus,
    /// Human readable explanation of the status.
    #[serde(default, deserialize_with = "null_as_default")]
    pub status_description: String,
}

/// One event in a task's history.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskEvent {
    /// Event type, e.g. `Started` or `Driver`.
    #[serde(rename = "Type")]
    pub event_type: String,
    /// Human readable message.
    #[serde(default, deserialize_with = "null_as_default")]
    pub display_message: String,
}

impl TaskEvent {
    /// Returns `true` when the task is still pulling its image or artifacts.
    #[must_use]
    pub fn is_downloading(&self) -> bool {
        self.event_type.to_ascii_lowercase().contains("download")
            || self.display_message.to_ascii_lowercase().contains("download")
    }

    /// Returns `true` for the event emitted when the task started.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.event_type == "Started"
    }
}

/// State of one task within an allocation.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskState {
    /// `pending`, `running`, or `dead`.
    pub state: String,
    /// Whether the task failed.
    #[serde(default)]
    pub failed: bool,
    /// Task history.
    #[serde(default, deserialize_with = "null_as_default")]
    pub events: Vec<TaskEvent>,
}

/// Placement of a job's task group on a client.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Allocation {
    /// Allocation ID.
    #[serde(rename = "ID")]
    pub id: String,
    /// Job the allocation belongs to.
    #[serde(rename = "JobID", default)]
    pub job_id: String,
    /// Task group name.
    #[serde(default)]
    pub task_group: String,
    /// Client-side status such as `pending`, `running`, or `failed`.
    pub client_status: String,
    /// Per-task states keyed by task name.
    #[serde(default, deserialize_with = "null_as_default")]
    pub task_states: BTreeMap<String, TaskState>,
}

impl Allocation {
    /// Returns `true` when the allocation is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.client_status == "running"
    }

    /// Returns `true` when `task` runs inside this allocation and has not
    /// failed.
    #[must_use]
    pub fn task_running(&self, task: &str) -> bool {
        self.task_states
            .get(task)
            .is_some_and(|state| state.state == "running" && !state.failed)
    }
}

/// Output stream of a task.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogStreamKind {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl LogStreamKind {
    /// Both streams, in the order they are subscribed.
    pub const ALL: [Self; 2] = [Self::Stdout, Self::Stderr];

    /// Name used in scheduler requests.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Where log reading starts.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LogOrigin {
    /// Offsets count from the beginning of the log.
    #[default]
    Start,
    /// Offsets count back from the end of the log.
    End,
}

impl LogOrigin {
    /// Name used in scheduler requests.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
        }
    }
}

/// Parameters of one log subscription.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogRequest {
    /// Allocation to read from.
    pub alloc_id: String,
    /// Task within the allocation.
    pub task: String,
    /// Stream to read.
    pub stream: LogStreamKind,
    /// Keep the subscription open for new output.
    pub follow: bool,
    /// Reference point for `offset`.
    pub origin: LogOrigin,
    /// Byte offset relative to `origin`.
    pub offset: u64,
}

/// Chunk of log output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogFrame {
    /// Offset of the chunk within the log file.
    pub offset: u64,
    /// Raw bytes.
    pub data: Bytes,
}

/// Live log subscription.
///
/// Both channels close when the subscription ends. Cancelling `cancel`
/// ends it early.
#[derive(Debug)]
pub struct LogSubscription {
    /// Decoded frames in emission order.
    pub frames: mpsc::Receiver<LogFrame>,
    /// Errors raised while streaming.
    pub errors: mpsc::Receiver<SchedulerError>,
    /// Cancels the subscription.
    pub cancel: CancellationToken,
}

/// Result of a command executed inside an allocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecOutput {
    /// Exit code.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn pending_allocation_with_null_task_states_decodes_empty() {
        let body = r#"[{
            "ID": "7c0e5c2a-5d1e-4f5c-9e43-8f0c9a1b2c3d",
            "JobID": "testnet-nodeset-validators-0-validator",
            "TaskGroup": "validator",
            "ClientStatus": "pending",
            "TaskStates": null
        }]"#;

        let allocations: Vec<Allocation> = serde_json::from_str(body).expect("decodes");

        let allocation = allocations.first().expect("one allocation");
        assert!(allocation.task_states.is_empty());
        assert!(!allocation.is_running());
    }

    #[rstest]
    fn task_without_events_decodes_empty_history() {
        let body = r#"{
            "ID": "a1",
            "ClientStatus": "pending",
            "TaskStates": {
                "app": {"State": "pending", "Failed": false, "Events": null}
            }
        }"#;

        let allocation: Allocation = serde_json::from_str(body).expect("decodes");

        let task = allocation.task_states.get("app").expect("app task");
        assert!(task.events.is_empty());
        assert!(!allocation.task_running("app"));
    }

    #[rstest]
    fn deployment_with_null_description_decodes() {
        let body = r#"{"ID": "d1", "Status": "running", "StatusDescription": null}"#;

        let deployment: Deployment = serde_json::from_str(body).expect("decodes");

        assert_eq!(deployment.status, DeploymentStatus::Running);
        assert!(deployment.status_description.is_empty());
    }
}
