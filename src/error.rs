use crate::models::{AgentId, LockOperation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience type alias for Results with CoordinationError
pub type Result<T> = std::result::Result<T, CoordinationError>;

/// Main error type for the coordination core
///
/// Every failure a component can surface maps to one variant here, each
/// with a stable code and a retryability flag so callers can distinguish
/// contract violations from transient storage trouble.
#[derive(Error, Debug, Clone)]
pub enum CoordinationError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("context not found: {0}")]
    ContextNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("lock not found: {0}")]
    LockNotFound(String),

    #[error("handoff not found: {0}")]
    HandoffNotFound(String),

    #[error("conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("task {task_id} already claimed by {claimed_by}")]
    TaskAlreadyClaimed { task_id: String, claimed_by: AgentId },

    #[error("task {task_id} is not assigned to {agent}")]
    TaskNotAssigned { task_id: String, agent: AgentId },

    #[error("invalid status transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("invalid agent for this operation: {0}")]
    InvalidAgent(String),

    #[error("capabilities list must not be empty")]
    InvalidCapabilities,

    #[error("session {0} is not active")]
    SessionNotActive(String),

    #[error("session {0} is not paused")]
    SessionNotPaused(String),

    #[error("handoff {handoff_id} is not addressed to {agent}")]
    HandoffNotForAgent { handoff_id: String, agent: AgentId },

    #[error("file already locked: {path} (held by {locked_by} until {expires_at})")]
    FileAlreadyLocked {
        path: String,
        locked_by: AgentId,
        expires_at: chrono::DateTime<chrono::Utc>,
    },

    #[error("batch file access rejected: {} conflicting request(s)", conflicts.len())]
    PartialGrant { conflicts: Vec<BatchConflict> },

    #[error("storage error during {op}: {message}")]
    Storage { op: StorageOp, message: String },

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("tool error: {0}")]
    Tool(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Storage operations that can fail transiently; each carries its own code
/// so retry loops can tell apart the failing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOp {
    Enqueue,
    Dequeue,
    UpdateTask,
    UpdateLock,
    SaveContext,
}

impl std::fmt::Display for StorageOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StorageOp::Enqueue => "enqueue",
            StorageOp::Dequeue => "dequeue",
            StorageOp::UpdateTask => "update-task",
            StorageOp::UpdateLock => "update-lock",
            StorageOp::SaveContext => "save-context",
        };
        f.write_str(name)
    }
}

/// One offending request inside a rejected batch acquisition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConflict {
    pub path: String,
    pub operation: LockOperation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<AgentId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl CoordinationError {
    /// Stable machine-readable code carried in every error envelope
    pub fn code(&self) -> &'static str {
        match self {
            CoordinationError::TaskNotFound(_) => "TASK_NOT_FOUND",
            CoordinationError::ContextNotFound(_) => "CONTEXT_NOT_FOUND",
            CoordinationError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            CoordinationError::LockNotFound(_) => "LOCK_NOT_FOUND",
            CoordinationError::HandoffNotFound(_) => "HANDOFF_NOT_FOUND",
            CoordinationError::ConflictNotFound(_) => "CONFLICT_NOT_FOUND",
            CoordinationError::TaskAlreadyClaimed { .. } => "TASK_ALREADY_CLAIMED",
            CoordinationError::TaskNotAssigned { .. } => "TASK_NOT_ASSIGNED",
            CoordinationError::InvalidTransition { .. } => "INVALID_TRANSITION",
            CoordinationError::InvalidAgent(_) => "INVALID_AGENT",
            CoordinationError::InvalidCapabilities => "INVALID_CAPABILITIES",
            CoordinationError::SessionNotActive(_) => "SESSION_NOT_ACTIVE",
            CoordinationError::SessionNotPaused(_) => "SESSION_NOT_PAUSED",
            CoordinationError::HandoffNotForAgent { .. } => "HANDOFF_NOT_FOR_AGENT",
            CoordinationError::FileAlreadyLocked { .. } => "FILE_ALREADY_LOCKED",
            CoordinationError::PartialGrant { .. } => "PARTIAL_GRANT",
            CoordinationError::Storage { op, .. } => match op {
                StorageOp::Enqueue => "ENQUEUE_ERROR",
                StorageOp::Dequeue => "DEQUEUE_ERROR",
                StorageOp::UpdateTask => "UPDATE_TASK_ERROR",
                StorageOp::UpdateLock => "UPDATE_LOCK_ERROR",
                StorageOp::SaveContext => "CONTEXT_SAVE_ERROR",
            },
            CoordinationError::UnknownTool(_) => "UNKNOWN_TOOL",
            CoordinationError::Tool(_) => "TOOL_ERROR",
            CoordinationError::InvalidInput(_) => "INVALID_INPUT",
        }
    }

    /// Whether the caller may retry the same call and expect it to succeed
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            CoordinationError::FileAlreadyLocked { .. }
                | CoordinationError::PartialGrant { .. }
                | CoordinationError::Storage { .. }
                | CoordinationError::UnknownTool(_)
                | CoordinationError::Tool(_)
        )
    }

    /// Structured payload for the envelope `details` field, where a variant
    /// carries more than its message
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            CoordinationError::FileAlreadyLocked {
                path,
                locked_by,
                expires_at,
            } => Some(serde_json::json!({
                "path": path,
                "locked_by": locked_by,
                "expires_at": expires_at,
            })),
            CoordinationError::PartialGrant { conflicts } => Some(serde_json::json!({
                "conflicts": conflicts,
            })),
            CoordinationError::TaskAlreadyClaimed {
                task_id,
                claimed_by,
            } => Some(serde_json::json!({
                "task_id": task_id,
                "claimed_by": claimed_by,
            })),
            _ => None,
        }
    }
}

/// Wire shape of an error inside the `{success,data?,error?}` envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&CoordinationError> for ErrorBody {
    fn from(err: &CoordinationError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            retryable: err.retryable(),
            details: err.details(),
        }
    }
}
