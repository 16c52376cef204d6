//! Command request/response types and the handler-callback seam dispatched
//! by `POST /v1/commands/*`.
//!
//! The core never executes a command itself — pausing a worker, enqueuing a
//! message, relabeling an issue are all actions the scheduler performs,
//! often by reaching back into [`crate::labels`] or a worker's IPC channel.
//! This module only defines the narrow callback trait the HTTP layer
//! dispatches through, the same shape as `sipag-core`'s `worker::ports`
//! trait seams.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::ControlPlaneError;

/// A command that completed synchronously returns `Ok` (rendered as HTTP 200
/// `{ok:true, ...}`); one that was merely accepted for async processing
/// returns `Accepted` (rendered as HTTP 202 `{accepted:true}`).
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CommandOutcome {
    Ok(Value),
    Accepted,
}

impl CommandOutcome {
    pub fn ok_empty() -> Self {
        Self::Ok(Value::Object(Default::default()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerTarget {
    pub worker_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageEnqueueRequest {
    pub worker_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskPriorityRequest {
    pub repo: String,
    pub issue_number: u64,
    pub priority: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskStatusRequest {
    pub repo: String,
    pub issue_number: u64,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssuePriorityRequest {
    pub repo: String,
    pub issue_number: u64,
    pub priority: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssueCmdRequest {
    pub repo: String,
    pub issue_number: u64,
    pub cmd: String,
}

/// Callback seam the control plane dispatches validated command bodies
/// through. Implementations live in the composition root (`orchestrator-cli`
/// or a test double), never in this crate.
#[async_trait]
pub trait CommandHandlers: Send + Sync {
    async fn pause(&self, target: WorkerTarget) -> Result<CommandOutcome, ControlPlaneError>;
    async fn resume(&self, target: WorkerTarget) -> Result<CommandOutcome, ControlPlaneError>;
    async fn message_enqueue(&self, req: MessageEnqueueRequest) -> Result<CommandOutcome, ControlPlaneError>;

    /// Default is "absent": `message/interrupt` returns 501 when no handler
    /// is wired up, rather than 404/400.
    async fn message_interrupt(&self, _target: WorkerTarget) -> Result<CommandOutcome, ControlPlaneError> {
        Err(ControlPlaneError::NotImplemented)
    }

    async fn task_priority(&self, req: TaskPriorityRequest) -> Result<CommandOutcome, ControlPlaneError>;
    async fn task_status(&self, req: TaskStatusRequest) -> Result<CommandOutcome, ControlPlaneError>;
    async fn issue_priority(&self, req: IssuePriorityRequest) -> Result<CommandOutcome, ControlPlaneError>;
    async fn issue_cmd(&self, req: IssueCmdRequest) -> Result<CommandOutcome, ControlPlaneError>;
}
