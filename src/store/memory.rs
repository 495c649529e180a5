use super::{apply_result, apply_status_transition, queue_order, StateStore};
use crate::{
    constants::MAX_QUEUE_SIZE,
    error::StorageOp,
    models::{
        fresh_id, AgentId, ConversationContext, FileLock, LockOperation, Message, Task,
        TaskResult, TaskStatus,
    },
    CoordinationError, Result,
};
use chrono::{DateTime, Utc};
use std::{collections::HashMap, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Development and test backend: plain maps behind per-table mutexes.
///
/// Each operation takes exactly one table lock, which gives the same
/// per-entity atomicity the sqlite backend gets from its serialized
/// connection.
pub struct InMemoryStateStore {
    tasks: Mutex<TaskTable>,
    locks: Mutex<LockTable>,
    contexts: Mutex<HashMap<String, ConversationContext>>,
}

#[derive(Default)]
struct TaskTable {
    entries: HashMap<String, StoredTask>,
    next_seq: u64,
}

struct StoredTask {
    task: Task,
    /// Insertion sequence, tie-breaker when `created_at` collides
    seq: u64,
}

#[derive(Default)]
struct LockTable {
    by_path: HashMap<String, FileLock>,
    token_to_path: HashMap<String, String>,
}

impl LockTable {
    /// Drops every lock at or past its expiry instant
    fn sweep(&mut self, now: DateTime<Utc>) {
        let expired: Vec<String> = self
            .by_path
            .iter()
            .filter(|(_, lock)| lock.is_expired_at(now))
            .map(|(path, _)| path.clone())
            .collect();
        for path in expired {
            if let Some(lock) = self.by_path.remove(&path) {
                self.token_to_path.remove(&lock.lock_token);
                debug!(path = %path, owner = %lock.owner, "swept expired lock");
            }
        }
    }
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(TaskTable::default()),
            locks: Mutex::new(LockTable::default()),
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// Evicts terminal tasks last touched before `cutoff`; returns how many
    /// were removed. Called by the container's retention sweep.
    pub async fn evict_terminal_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut table = self.tasks.lock().await;
        let before = table.entries.len();
        table
            .entries
            .retain(|_, stored| !(stored.task.status.is_terminal() && stored.task.updated_at < cutoff));
        let removed = before - table.entries.len();
        if removed > 0 {
            info!("evicted {} terminal tasks from memory store", removed);
        }
        removed
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StateStore for InMemoryStateStore {
    async fn enqueue_task(&self, mut task: Task) -> Result<Task> {
        let mut table = self.tasks.lock().await;

        let queued = table
            .entries
            .values()
            .filter(|s| s.task.status == TaskStatus::Queued)
            .count();
        if queued >= MAX_QUEUE_SIZE {
            return Err(CoordinationError::Storage {
                op: StorageOp::Enqueue,
                message: format!("task queue full (max: {MAX_QUEUE_SIZE})"),
            });
        }

        let now = Utc::now();
        task.status = TaskStatus::Queued;
        task.assigned_to = None;
        task.result = None;
        task.created_at = now;
        task.updated_at = now;

        let seq = table.next_seq;
        table.next_seq += 1;
        table
            .entries
            .insert(task.id.clone(), StoredTask { task: task.clone(), seq });

        debug!(task_id = %task.id, priority = %task.priority, "task enqueued");
        Ok(task)
    }

    async fn dequeue_task(
        &self,
        capabilities: &[String],
        exclude: &[String],
    ) -> Result<Option<Task>> {
        let table = self.tasks.lock().await;
        let mut candidates: Vec<&StoredTask> = table
            .entries
            .values()
            .filter(|s| s.task.status == TaskStatus::Queued)
            .filter(|s| s.task.task_type.matches_capabilities(capabilities))
            .filter(|s| !exclude.contains(&s.task.id))
            .collect();
        candidates.sort_by(|a, b| queue_order(&a.task, &b.task).then(a.seq.cmp(&b.seq)));
        Ok(candidates.first().map(|s| s.task.clone()))
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let table = self.tasks.lock().await;
        Ok(table.entries.get(id).map(|s| s.task.clone()))
    }

    async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        assignee: Option<AgentId>,
    ) -> Result<Task> {
        let mut table = self.tasks.lock().await;
        let stored = table
            .entries
            .get_mut(id)
            .ok_or_else(|| CoordinationError::TaskNotFound(id.to_string()))?;
        apply_status_transition(&mut stored.task, status, assignee)?;
        debug!(task_id = %id, status = %status, "task status updated");
        Ok(stored.task.clone())
    }

    async fn update_task_result(&self, id: &str, result: TaskResult) -> Result<Task> {
        let mut table = self.tasks.lock().await;
        let stored = table
            .entries
            .get_mut(id)
            .ok_or_else(|| CoordinationError::TaskNotFound(id.to_string()))?;
        apply_result(&mut stored.task, result)?;
        debug!(task_id = %id, status = %stored.task.status, "task result recorded");
        Ok(stored.task.clone())
    }

    async fn get_session_tasks(&self, session_id: &str) -> Result<Vec<Task>> {
        let table = self.tasks.lock().await;
        let mut tasks: Vec<&StoredTask> = table
            .entries
            .values()
            .filter(|s| s.task.session_id == session_id)
            .collect();
        tasks.sort_by(|a, b| a.task.created_at.cmp(&b.task.created_at).then(a.seq.cmp(&b.seq)));
        Ok(tasks.into_iter().map(|s| s.task.clone()).collect())
    }

    async fn acquire_lock(
        &self,
        path: &str,
        owner: AgentId,
        operation: LockOperation,
        ttl: Duration,
    ) -> Result<FileLock> {
        let now = Utc::now();
        let mut table = self.locks.lock().await;
        table.sweep(now);

        if let Some(existing) = table.by_path.get(path) {
            return Err(CoordinationError::FileAlreadyLocked {
                path: path.to_string(),
                locked_by: existing.owner,
                expires_at: existing.expires_at,
            });
        }

        let lock = FileLock {
            path: path.to_string(),
            owner,
            lock_token: fresh_id("lock"),
            operation,
            acquired_at: now,
            expires_at: now
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(5)),
        };
        table
            .token_to_path
            .insert(lock.lock_token.clone(), path.to_string());
        table.by_path.insert(path.to_string(), lock.clone());

        debug!(path = %path, owner = %owner, operation = %operation, "lock acquired");
        Ok(lock)
    }

    async fn release_lock(&self, token: &str) -> Result<()> {
        let mut table = self.locks.lock().await;
        let path = table
            .token_to_path
            .remove(token)
            .ok_or_else(|| CoordinationError::LockNotFound(token.to_string()))?;
        table.by_path.remove(&path);
        debug!(path = %path, "lock released");
        Ok(())
    }

    async fn is_locked(&self, path: &str) -> Result<Option<FileLock>> {
        let mut table = self.locks.lock().await;
        table.sweep(Utc::now());
        Ok(table.by_path.get(path).cloned())
    }

    async fn get_all_locks(&self) -> Result<Vec<FileLock>> {
        let mut table = self.locks.lock().await;
        table.sweep(Utc::now());
        let mut locks: Vec<FileLock> = table.by_path.values().cloned().collect();
        locks.sort_by(|a, b| a.acquired_at.cmp(&b.acquired_at));
        Ok(locks)
    }

    async fn release_all_locks_for_agent(&self, owner: AgentId) -> Result<usize> {
        let mut table = self.locks.lock().await;
        let owned: Vec<String> = table
            .by_path
            .iter()
            .filter(|(_, lock)| lock.owner == owner)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &owned {
            if let Some(lock) = table.by_path.remove(path) {
                table.token_to_path.remove(&lock.lock_token);
            }
        }
        if !owned.is_empty() {
            info!(owner = %owner, count = owned.len(), "released all locks for agent");
        }
        Ok(owned.len())
    }

    async fn save_context(&self, mut context: ConversationContext) -> Result<ConversationContext> {
        context.last_updated = Utc::now();
        let mut contexts = self.contexts.lock().await;
        contexts.insert(context.id.clone(), context.clone());
        debug!(context_id = %context.id, "context saved");
        Ok(context)
    }

    async fn load_context(&self, id: &str) -> Result<Option<ConversationContext>> {
        let contexts = self.contexts.lock().await;
        Ok(contexts.get(id).cloned())
    }

    async fn append_message(&self, id: &str, message: Message) -> Result<ConversationContext> {
        let mut contexts = self.contexts.lock().await;
        let context = contexts
            .get_mut(id)
            .ok_or_else(|| CoordinationError::ContextNotFound(id.to_string()))?;
        context.last_updated = Utc::now().max(message.timestamp);
        context.messages.push(message);
        Ok(context.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageRole, Priority, TaskType};

    fn task(session: &str, task_type: TaskType, priority: Priority) -> Task {
        Task::new(session, task_type, "test task", priority)
    }

    fn dev_caps() -> Vec<String> {
        vec!["typescript-development".to_string()]
    }

    #[tokio::test]
    async fn dequeue_orders_by_priority_then_age() {
        let store = InMemoryStateStore::new();
        let a = store
            .enqueue_task(task("s1", TaskType::ImplementFeature, Priority::Low))
            .await
            .unwrap();
        let b = store
            .enqueue_task(task("s1", TaskType::ImplementFeature, Priority::High))
            .await
            .unwrap();
        let c = store
            .enqueue_task(task("s1", TaskType::ImplementFeature, Priority::Medium))
            .await
            .unwrap();
        let d = store
            .enqueue_task(task("s1", TaskType::ImplementFeature, Priority::High))
            .await
            .unwrap();

        let caps = dev_caps();
        let mut seen = Vec::new();
        let mut exclude = Vec::new();
        while let Some(next) = store.dequeue_task(&caps, &exclude).await.unwrap() {
            exclude.push(next.id.clone());
            seen.push(next.id);
        }
        assert_eq!(seen, vec![b.id, d.id, c.id, a.id]);
    }

    #[tokio::test]
    async fn dequeue_is_a_pure_peek() {
        let store = InMemoryStateStore::new();
        let t = store
            .enqueue_task(task("s1", TaskType::WriteTests, Priority::Medium))
            .await
            .unwrap();
        let caps = vec!["testing".to_string()];
        let first = store.dequeue_task(&caps, &[]).await.unwrap().unwrap();
        let second = store.dequeue_task(&caps, &[]).await.unwrap().unwrap();
        assert_eq!(first.id, t.id);
        assert_eq!(second.id, t.id);
        assert_eq!(
            store.get_task(&t.id).await.unwrap().unwrap().status,
            TaskStatus::Queued
        );
    }

    #[tokio::test]
    async fn dequeue_with_no_matching_capabilities_returns_none() {
        let store = InMemoryStateStore::new();
        store
            .enqueue_task(task("s1", TaskType::UpdateDocs, Priority::High))
            .await
            .unwrap();
        assert!(store.dequeue_task(&[], &[]).await.unwrap().is_none());
        assert!(store
            .dequeue_task(&["testing".to_string()], &[])
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn second_claim_fails_with_already_claimed() {
        let store = InMemoryStateStore::new();
        let t = store
            .enqueue_task(task("s1", TaskType::FixBug, Priority::High))
            .await
            .unwrap();

        let claimed = store
            .update_task_status(&t.id, TaskStatus::Claimed, Some(AgentId::Executor))
            .await
            .unwrap();
        assert_eq!(claimed.assigned_to, Some(AgentId::Executor));

        let err = store
            .update_task_status(&t.id, TaskStatus::Claimed, Some(AgentId::Planner))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoordinationError::TaskAlreadyClaimed { claimed_by: AgentId::Executor, .. }
        ));
    }

    #[tokio::test]
    async fn result_derives_terminal_status() {
        let store = InMemoryStateStore::new();
        let t = store
            .enqueue_task(task("s1", TaskType::FixBug, Priority::High))
            .await
            .unwrap();
        store
            .update_task_status(&t.id, TaskStatus::Claimed, Some(AgentId::Executor))
            .await
            .unwrap();

        let failed = store
            .update_task_result(
                &t.id,
                TaskResult {
                    success: false,
                    output: "could not reproduce".to_string(),
                    files_modified: vec![],
                    error: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed.result.is_some());

        // Terminal tasks reject further results
        let err = store
            .update_task_result(
                &t.id,
                TaskResult {
                    success: true,
                    output: String::new(),
                    files_modified: vec![],
                    error: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn lock_expiry_frees_the_path() {
        let store = InMemoryStateStore::new();
        store
            .acquire_lock(
                "/src/app.ts",
                AgentId::Planner,
                LockOperation::Write,
                Duration::from_millis(100),
            )
            .await
            .unwrap();

        let err = store
            .acquire_lock(
                "/src/app.ts",
                AgentId::Executor,
                LockOperation::Write,
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::FileAlreadyLocked { locked_by: AgentId::Planner, .. }));

        tokio::time::sleep(Duration::from_millis(150)).await;

        let lock = store
            .acquire_lock(
                "/src/app.ts",
                AgentId::Executor,
                LockOperation::Write,
                Duration::from_millis(100),
            )
            .await
            .unwrap();
        assert_eq!(lock.owner, AgentId::Executor);
    }

    #[tokio::test]
    async fn release_makes_path_acquirable_and_unknown_token_errors() {
        let store = InMemoryStateStore::new();
        let lock = store
            .acquire_lock(
                "/a",
                AgentId::Planner,
                LockOperation::Write,
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        store.release_lock(&lock.lock_token).await.unwrap();
        assert!(store.is_locked("/a").await.unwrap().is_none());

        let err = store.release_lock(&lock.lock_token).await.unwrap_err();
        assert!(matches!(err, CoordinationError::LockNotFound(_)));
    }

    #[tokio::test]
    async fn release_all_for_agent_counts() {
        let store = InMemoryStateStore::new();
        for path in ["/a", "/b", "/c"] {
            store
                .acquire_lock(path, AgentId::Executor, LockOperation::Write, Duration::from_secs(60))
                .await
                .unwrap();
        }
        store
            .acquire_lock("/d", AgentId::Planner, LockOperation::Write, Duration::from_secs(60))
            .await
            .unwrap();

        let released = store
            .release_all_locks_for_agent(AgentId::Executor)
            .await
            .unwrap();
        assert_eq!(released, 3);
        assert_eq!(store.get_all_locks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn context_append_preserves_order() {
        let store = InMemoryStateStore::new();
        store
            .save_context(ConversationContext::new("context_1"))
            .await
            .unwrap();

        store
            .append_message("context_1", Message::new(MessageRole::Planner, "first"))
            .await
            .unwrap();
        store
            .append_message("context_1", Message::new(MessageRole::Executor, "second"))
            .await
            .unwrap();

        let loaded = store.load_context("context_1").await.unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[0].content, "first");
        assert_eq!(loaded.messages[1].content, "second");
        assert!(loaded
            .messages
            .iter()
            .all(|m| m.timestamp <= loaded.last_updated));

        let err = store
            .append_message("context_missing", Message::new(MessageRole::System, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::ContextNotFound(_)));
    }

    #[tokio::test]
    async fn terminal_eviction_spares_active_tasks() {
        let store = InMemoryStateStore::new();
        let done = store
            .enqueue_task(task("s1", TaskType::FixBug, Priority::Low))
            .await
            .unwrap();
        store
            .update_task_status(&done.id, TaskStatus::Claimed, Some(AgentId::Executor))
            .await
            .unwrap();
        store
            .update_task_result(
                &done.id,
                TaskResult {
                    success: true,
                    output: "done".to_string(),
                    files_modified: vec![],
                    error: None,
                },
            )
            .await
            .unwrap();
        store
            .enqueue_task(task("s1", TaskType::FixBug, Priority::Low))
            .await
            .unwrap();

        let removed = store.evict_terminal_before(Utc::now()).await;
        assert_eq!(removed, 1);
        assert_eq!(store.get_session_tasks("s1").await.unwrap().len(), 1);
    }
}
