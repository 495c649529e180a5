//! Single source of truth for tasks, locks, and conversation contexts.
//!
//! Every higher component is a pure function over this operation set; all
//! mutation round-trips through a [`StateStore`] implementation. Two
//! backends ship: an in-memory map for development and tests, and a sqlite
//! file for durable deployments. Both give the same per-operation atomicity.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStateStore;
pub use sqlite::SqliteStateStore;

use crate::{
    models::{
        AgentId, ConversationContext, FileLock, LockOperation, Message, Task, TaskResult,
        TaskStatus,
    },
    Result,
};
use std::time::Duration;

/// Persistence contract consumed by the queue, lock registry, and session
/// manager.
///
/// Implementations serialize status updates per task and lock operations
/// per path, so a second claim on an already-claimed task or a second
/// exclusive acquisition on a held path fails deterministically.
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    /// Persists a task, forcing it into the queued state with no assignee
    /// or result. Returns the stored task.
    async fn enqueue_task(&self, task: Task) -> Result<Task>;

    /// Peeks the best-matching queued task for the given capability set:
    /// highest priority first, oldest `created_at` on ties. Tasks whose ids
    /// appear in `exclude` are skipped, which is how discovery collects a
    /// candidate batch without mutating anything. Never changes task state.
    async fn dequeue_task(&self, capabilities: &[String], exclude: &[String])
        -> Result<Option<Task>>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>>;

    /// Conditional status update: succeeds only when the lifecycle permits
    /// the transition from the task's current status. Transitioning to
    /// `claimed` or back to `in-progress` (handoff acceptance) records
    /// `assignee`; transitioning to `queued` or `handed-off` clears it.
    async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        assignee: Option<AgentId>,
    ) -> Result<Task>;

    /// Stores the result and derives the terminal status from
    /// `result.success`. Permitted from `claimed` or `in-progress`.
    async fn update_task_result(&self, id: &str, result: TaskResult) -> Result<Task>;

    /// All tasks for a session, ordered by `created_at` ascending.
    async fn get_session_tasks(&self, session_id: &str) -> Result<Vec<Task>>;

    /// Exclusive lock acquisition: sweeps expired locks, fails with
    /// `FILE_ALREADY_LOCKED` if a valid holder remains, otherwise inserts a
    /// fresh lock expiring after `ttl`. Atomic per path.
    async fn acquire_lock(
        &self,
        path: &str,
        owner: AgentId,
        operation: LockOperation,
        ttl: Duration,
    ) -> Result<FileLock>;

    /// Deletes the lock with this token; unknown tokens return
    /// `LOCK_NOT_FOUND`.
    async fn release_lock(&self, token: &str) -> Result<()>;

    /// Sweep-then-read of the current holder for a path.
    async fn is_locked(&self, path: &str) -> Result<Option<FileLock>>;

    /// Sweep-then-list, ordered by `acquired_at` ascending. Every returned
    /// lock is still valid.
    async fn get_all_locks(&self) -> Result<Vec<FileLock>>;

    /// Drops every lock held by `owner`; returns how many were released.
    async fn release_all_locks_for_agent(&self, owner: AgentId) -> Result<usize>;

    /// Create-or-replace; stamps `last_updated`.
    async fn save_context(&self, context: ConversationContext) -> Result<ConversationContext>;

    async fn load_context(&self, id: &str) -> Result<Option<ConversationContext>>;

    /// Atomic read-modify-write append; `CONTEXT_NOT_FOUND` if the context
    /// does not exist.
    async fn append_message(&self, id: &str, message: Message) -> Result<ConversationContext>;
}

/// Parses a bare wire tag back into its enum.
pub(crate) fn from_tag<T: serde::de::DeserializeOwned>(tag: &str) -> Option<T> {
    serde_json::from_value(serde_json::Value::String(tag.to_string())).ok()
}

/// Comparison key for queue ordering: priority rank descending, then
/// `created_at` ascending.
pub(crate) fn queue_order(a: &Task, b: &Task) -> std::cmp::Ordering {
    b.priority
        .rank()
        .cmp(&a.priority.rank())
        .then(a.created_at.cmp(&b.created_at))
}

/// Applies a lifecycle transition in place, maintaining the status
/// invariants (`queued` has no assignee or result, claims record their
/// agent). Both backends funnel status updates through here so the
/// permitted-transition table lives in one place.
pub(crate) fn apply_status_transition(
    task: &mut Task,
    next: TaskStatus,
    assignee: Option<AgentId>,
) -> Result<()> {
    use crate::CoordinationError;

    if !task.status.can_transition_to(next) {
        if next == TaskStatus::Claimed {
            if let Some(claimed_by) = task.assigned_to {
                return Err(CoordinationError::TaskAlreadyClaimed {
                    task_id: task.id.clone(),
                    claimed_by,
                });
            }
        }
        return Err(CoordinationError::InvalidTransition {
            task_id: task.id.clone(),
            from: task.status.to_string(),
            to: next.to_string(),
        });
    }

    // Terminal states carry a result; they are only reachable through the
    // result path, which derives them from `result.success`.
    if next.is_terminal() && task.result.is_none() {
        return Err(CoordinationError::InvalidTransition {
            task_id: task.id.clone(),
            from: task.status.to_string(),
            to: next.to_string(),
        });
    }

    match next {
        TaskStatus::Claimed => {
            let agent = assignee.ok_or_else(|| {
                CoordinationError::InvalidInput("claiming a task requires an agent".to_string())
            })?;
            task.assigned_to = Some(agent);
        }
        TaskStatus::InProgress => {
            // Handoff acceptance reassigns; a plain progress transition keeps
            // the current assignee.
            if assignee.is_some() {
                task.assigned_to = assignee;
            }
        }
        TaskStatus::Queued | TaskStatus::HandedOff => {
            task.assigned_to = None;
        }
        TaskStatus::Blocked | TaskStatus::Completed | TaskStatus::Failed => {}
    }

    if next == TaskStatus::Queued {
        task.result = None;
    }

    task.status = next;
    task.updated_at = chrono::Utc::now();
    Ok(())
}

/// Stores a result and derives the terminal status from `result.success`.
/// Permitted while the task is claimed or in progress.
pub(crate) fn apply_result(task: &mut Task, result: TaskResult) -> Result<()> {
    use crate::CoordinationError;

    if !matches!(task.status, TaskStatus::Claimed | TaskStatus::InProgress) {
        return Err(CoordinationError::InvalidTransition {
            task_id: task.id.clone(),
            from: task.status.to_string(),
            to: if result.success {
                TaskStatus::Completed.to_string()
            } else {
                TaskStatus::Failed.to_string()
            },
        });
    }

    task.status = if result.success {
        TaskStatus::Completed
    } else {
        TaskStatus::Failed
    };
    task.result = Some(result);
    task.updated_at = chrono::Utc::now();
    Ok(())
}
