use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::model::definition::TaskKind;
use crate::domain::model::task_instance::ExecutionStatus;
use crate::domain::utils::id::{Host, NodeCode, TaskInstanceId, WorkflowInstanceId};

/// Wire discriminant of every message, used to route requests to processors.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    TaskExecuteRequest,
    TaskExecuteAck,
    TaskExecuteResult,
    TaskExecuteResultAck,
    TaskKill,
    UpdateWorkflowHost,
    WorkerFailover,
    WorkerFailoverAck,
    AlertSendRequest,
    AlertSendResponse,
    Heartbeat,
    Pong,
    Error,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    OneWay,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskExecuteRequest {
    pub task_instance_id: TaskInstanceId,
    pub workflow_instance_id: WorkflowInstanceId,
    pub node_code: NodeCode,
    pub attempt: u32,
    pub kind: TaskKind,
    pub params: BTreeMap<String, String>,
    /// Master that receives the result.
    pub master_host: Host,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskExecuteResult {
    pub task_instance_id: TaskInstanceId,
    pub workflow_instance_id: WorkflowInstanceId,
    pub attempt: u32,
    pub status: ExecutionStatus,
    pub worker_host: Host,
    pub start_time: i64,
    pub end_time: i64,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
}

/// Worker's answer to an execute request.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Accepted,
    /// Every execution slot is taken. The master retries later without
    /// charging the dispatch retry budget.
    Overloaded,
    Rejected,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AlertMessage {
    pub level: AlertLevel,
    pub title: String,
    pub content: String,
    pub workflow_instance_id: Option<WorkflowInstanceId>,
}

/// Body of a frame.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Payload {
    TaskExecuteRequest(TaskExecuteRequest),
    TaskExecuteAck { task_instance_id: TaskInstanceId, attempt: u32, status: AckStatus, worker_host: Host, message: Option<String> },
    TaskExecuteResult(TaskExecuteResult),
    TaskExecuteResultAck { task_instance_id: TaskInstanceId, attempt: u32 },
    TaskKill { task_instance_id: TaskInstanceId, attempt: u32 },
    UpdateWorkflowHost { workflow_instance_id: WorkflowInstanceId, master_host: Host },
    WorkerFailover { worker: Host },
    WorkerFailoverAck { worker: Host, affected_tasks: u32 },
    AlertSendRequest(AlertMessage),
    AlertSendResponse { delivered: bool, message: Option<String> },
    Heartbeat,
    Pong,
    Error { message: String },
}

impl Payload {
    pub fn command_type(&self) -> CommandType {
        match self {
            Payload::TaskExecuteRequest(_) => CommandType::TaskExecuteRequest,
            Payload::TaskExecuteAck { .. } => CommandType::TaskExecuteAck,
            Payload::TaskExecuteResult(_) => CommandType::TaskExecuteResult,
            Payload::TaskExecuteResultAck { .. } => CommandType::TaskExecuteResultAck,
            Payload::TaskKill { .. } => CommandType::TaskKill,
            Payload::UpdateWorkflowHost { .. } => CommandType::UpdateWorkflowHost,
            Payload::WorkerFailover { .. } => CommandType::WorkerFailover,
            Payload::WorkerFailoverAck { .. } => CommandType::WorkerFailoverAck,
            Payload::AlertSendRequest(_) => CommandType::AlertSendRequest,
            Payload::AlertSendResponse { .. } => CommandType::AlertSendResponse,
            Payload::Heartbeat => CommandType::Heartbeat,
            Payload::Pong => CommandType::Pong,
            Payload::Error { .. } => CommandType::Error,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Payload::Error { message: message.into() }
    }
}

/// Frame wrapper. `opaque` correlates a response with its request and is
/// absent on one-way messages.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope {
    pub opaque: Option<u64>,
    pub kind: MessageKind,
    pub payload: Payload,
}

impl Envelope {
    pub fn request(opaque: u64, payload: Payload) -> Self {
        Envelope { opaque: Some(opaque), kind: MessageKind::Request, payload }
    }

    pub fn response(opaque: u64, payload: Payload) -> Self {
        Envelope { opaque: Some(opaque), kind: MessageKind::Response, payload }
    }

    pub fn one_way(payload: Payload) -> Self {
        Envelope { opaque: None, kind: MessageKind::OneWay, payload }
    }
}
