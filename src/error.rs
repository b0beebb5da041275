use thiserror::Error;

use crate::domain::model::task_instance::TaskState;
use crate::domain::model::workflow_instance::WorkflowState;
use crate::domain::utils::id::{Host, NodeCode, TaskInstanceId, WorkflowInstanceId};

#[derive(Debug, Error)]
pub enum Error {
    #[error("File not found or could not be read: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse JSON: {0}")]
    DeserializationError(#[from] serde_json::Error),

    #[error("Failed to build internal domain model: {0}")]
    ModelConstructionError(String),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Raised while mapping DTO strings onto domain enums.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConversionError {
    #[error("Unknown task type: {0}")]
    UnknownTaskKind(String),

    #[error("Unknown failure strategy: {0}")]
    UnknownFailureStrategy(String),

    #[error("Unknown edge policy: {0}")]
    UnknownEdgePolicy(String),

    #[error("Unknown timeout strategy: {0}")]
    UnknownTimeoutStrategy(String),

    #[error("Unknown priority: {0}")]
    UnknownPriority(String),

    #[error("Unknown host selector: {0}")]
    UnknownHostSelector(String),

    #[error("Unknown serializer: {0}")]
    UnknownSerializer(String),
}

#[derive(Debug, Error, Clone)]
pub enum RegistryError {
    #[error("Registry session {0} is expired or closed")]
    SessionExpired(u64),

    #[error("Registry node {0} does not exist")]
    NodeNotFound(String),

    #[error("Failed to (de)serialize registry payload at {path}: {reason}")]
    Serialization { path: String, reason: String },
}

#[derive(Debug, Error, Clone)]
pub enum RpcError {
    #[error("Connection to {0} is unavailable")]
    ConnectionUnavailable(Host),

    #[error("Request {opaque} to {host} timed out")]
    Timeout { host: Host, opaque: u64 },

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Remote {host} answered with error: {message}")]
    Remote { host: Host, message: String },

    #[error("Unexpected response from {host}: expected {expected}")]
    UnexpectedResponse { host: Host, expected: &'static str },

    #[error("Failed to bind rpc server on {addr}: {reason}")]
    Bind { addr: String, reason: String },
}

#[derive(Debug, Error, Clone)]
pub enum DispatchError {
    /// Recoverable: the caller keeps the task in DISPATCH and retries later.
    #[error("No available worker host in group '{group}'")]
    NoAvailableHost { group: String },

    #[error("Task {task} attempt {attempt} was already dispatched")]
    AlreadyDispatched { task: TaskInstanceId, attempt: u32 },

    #[error("Task {task} is in state {state:?} and cannot be dispatched")]
    NotDispatchable { task: TaskInstanceId, state: TaskState },

    #[error("Worker {host} rejected task {task}")]
    Rejected { host: Host, task: TaskInstanceId },

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("Workflow instance {0} not found in store")]
    WorkflowNotFound(WorkflowInstanceId),

    #[error("Workflow instance {0} is terminal and can no longer be modified")]
    TerminalWorkflow(WorkflowInstanceId),

    #[error("Workflow definition {code} v{version} not found in store")]
    DefinitionNotFound { code: String, version: u32 },
}

#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("Workflow instance {0} is not running on this master")]
    WorkflowNotFound(WorkflowInstanceId),

    #[error("Node {node} not found in workflow instance {workflow}")]
    NodeNotFound { workflow: WorkflowInstanceId, node: NodeCode },

    #[error("Invalid DAG: {0}")]
    InvalidDag(String),

    #[error("Workflow instance {id} is in state {state:?}, operation '{operation}' is not allowed")]
    InvalidWorkflowState { id: WorkflowInstanceId, state: WorkflowState, operation: &'static str },

    #[error("Task {task} cannot move from {from:?} via '{operation}'")]
    InvalidTransition { task: TaskInstanceId, from: TaskState, operation: &'static str },

    #[error("Dependencies of node {0} are not satisfied")]
    DependenciesNotSatisfied(NodeCode),

    #[error("Workflow runnable {0} is no longer accepting events")]
    RunnableClosed(WorkflowInstanceId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}
