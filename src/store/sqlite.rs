use super::{apply_result, apply_status_transition, from_tag, StateStore};
use crate::{
    constants::MAX_QUEUE_SIZE,
    error::StorageOp,
    models::{
        fresh_id, AgentId, ConversationContext, FileLock, LockOperation, Message, Priority, Task,
        TaskContext, TaskResult, TaskStatus, TaskType,
    },
    CoordinationError, Result,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::{path::Path, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Durable backend: a single sqlite connection in WAL mode behind an async
/// mutex. The mutex serializes every statement, so each trait operation is
/// atomic without explicit row locking.
pub struct SqliteStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStateStore {
    /// Opens (or creates) the database file and initializes the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(open_err)?;
        conn.busy_timeout(std::time::Duration::from_secs(10))
            .map_err(open_err)?;
        // WAL mode returns a row; query_row ignores it
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .map_err(open_err)?;
        conn.execute("PRAGMA synchronous = NORMAL", [])
            .map_err(open_err)?;
        init_schema(&conn).map_err(open_err)?;

        info!(path = %path.as_ref().display(), "sqlite state store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Closes the connection, flushing the WAL. Further calls on clones of
    /// this store will fail; the container calls this exactly once at
    /// shutdown.
    pub async fn close(&self) {
        let conn = self.conn.lock().await;
        // The checkpoint pragma returns a status row; ignore it
        if let Err(e) = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(())) {
            tracing::warn!("wal checkpoint on close failed: {e}");
        }
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tasks (
            id          TEXT PRIMARY KEY,
            session_id  TEXT NOT NULL,
            type        TEXT NOT NULL,
            description TEXT NOT NULL,
            status      TEXT NOT NULL,
            priority    TEXT NOT NULL,
            assigned_to TEXT,
            context     TEXT NOT NULL,
            result      TEXT,
            created_at  INTEGER NOT NULL,
            updated_at  INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
        CREATE INDEX IF NOT EXISTS idx_tasks_session ON tasks(session_id);
        CREATE INDEX IF NOT EXISTS idx_tasks_status_type ON tasks(status, type);

        CREATE TABLE IF NOT EXISTS file_locks (
            path        TEXT PRIMARY KEY,
            owner       TEXT NOT NULL,
            lock_token  TEXT NOT NULL UNIQUE,
            operation   TEXT NOT NULL,
            acquired_at INTEGER NOT NULL,
            expires_at  INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_locks_expires ON file_locks(expires_at);

        CREATE TABLE IF NOT EXISTS contexts (
            id           TEXT PRIMARY KEY,
            messages     TEXT NOT NULL,
            shared_state TEXT NOT NULL,
            last_updated INTEGER NOT NULL
        );",
    )
}

fn open_err(e: rusqlite::Error) -> CoordinationError {
    CoordinationError::Storage {
        op: StorageOp::UpdateTask,
        message: format!("sqlite open failed: {e}"),
    }
}

fn storage_err(op: StorageOp) -> impl FnOnce(rusqlite::Error) -> CoordinationError {
    move |e| CoordinationError::Storage {
        op,
        message: e.to_string(),
    }
}

fn decode_err(op: StorageOp, what: &str) -> CoordinationError {
    CoordinationError::Storage {
        op,
        message: format!("corrupt {what} column"),
    }
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

/// Raw task row, decoded outside the rusqlite row callback so JSON errors
/// map onto storage errors instead of panics.
struct TaskRow {
    id: String,
    session_id: String,
    task_type: String,
    description: String,
    status: String,
    priority: String,
    assigned_to: Option<String>,
    context: String,
    result: Option<String>,
    created_at: i64,
    updated_at: i64,
}

const TASK_COLUMNS: &str =
    "id, session_id, type, description, status, priority, assigned_to, context, result, \
     created_at, updated_at";

fn read_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        task_type: row.get(2)?,
        description: row.get(3)?,
        status: row.get(4)?,
        priority: row.get(5)?,
        assigned_to: row.get(6)?,
        context: row.get(7)?,
        result: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

impl TaskRow {
    fn into_task(self, op: StorageOp) -> Result<Task> {
        let task_type: TaskType = from_tag(&self.task_type).unwrap_or(TaskType::Unknown);
        let status: TaskStatus =
            from_tag(&self.status).ok_or_else(|| decode_err(op, "status"))?;
        let priority: Priority =
            from_tag(&self.priority).ok_or_else(|| decode_err(op, "priority"))?;
        let assigned_to = match self.assigned_to {
            Some(tag) => Some(from_tag::<AgentId>(&tag).ok_or_else(|| decode_err(op, "assigned_to"))?),
            None => None,
        };
        let context: TaskContext =
            serde_json::from_str(&self.context).map_err(|_| decode_err(op, "context"))?;
        let result: Option<TaskResult> = match self.result {
            Some(json) => {
                Some(serde_json::from_str(&json).map_err(|_| decode_err(op, "result"))?)
            }
            None => None,
        };
        Ok(Task {
            id: self.id,
            session_id: self.session_id,
            task_type,
            description: self.description,
            priority,
            status,
            assigned_to,
            context,
            result,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        })
    }
}

fn write_task(conn: &Connection, task: &Task) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO tasks \
         (id, session_id, type, description, status, priority, assigned_to, context, result, \
          created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            task.id,
            task.session_id,
            task.task_type.to_string(),
            task.description,
            task.status.to_string(),
            task.priority.to_string(),
            task.assigned_to.map(|a| a.as_str().to_string()),
            serde_json::to_string(&task.context).unwrap_or_else(|_| "{}".to_string()),
            task.result
                .as_ref()
                .and_then(|r| serde_json::to_string(r).ok()),
            millis(task.created_at),
            millis(task.updated_at),
        ],
    )?;
    Ok(())
}

fn read_lock_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, String, i64, i64)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn lock_from_row(
    (path, owner, token, operation, acquired_at, expires_at): (String, String, String, String, i64, i64),
) -> Result<FileLock> {
    let op = StorageOp::UpdateLock;
    Ok(FileLock {
        path,
        owner: from_tag(&owner).ok_or_else(|| decode_err(op, "owner"))?,
        lock_token: token,
        operation: from_tag(&operation).ok_or_else(|| decode_err(op, "operation"))?,
        acquired_at: from_millis(acquired_at),
        expires_at: from_millis(expires_at),
    })
}

const LOCK_COLUMNS: &str = "path, owner, lock_token, operation, acquired_at, expires_at";

fn sweep_locks(conn: &Connection, now: DateTime<Utc>) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM file_locks WHERE expires_at <= ?1",
        params![millis(now)],
    )
}

#[async_trait::async_trait]
impl StateStore for SqliteStateStore {
    async fn enqueue_task(&self, mut task: Task) -> Result<Task> {
        let conn = self.conn.lock().await;

        let queued: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM tasks WHERE status = 'queued'",
                [],
                |row| row.get(0),
            )
            .map_err(storage_err(StorageOp::Enqueue))?;
        if queued as usize >= MAX_QUEUE_SIZE {
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

        write_task(&conn, &task).map_err(storage_err(StorageOp::Enqueue))?;
        debug!(task_id = %task.id, "task enqueued (sqlite)");
        Ok(task)
    }

    async fn dequeue_task(
        &self,
        capabilities: &[String],
        exclude: &[String],
    ) -> Result<Option<Task>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'queued' \
                 ORDER BY CASE priority \
                     WHEN 'urgent' THEN 4 WHEN 'high' THEN 3 WHEN 'medium' THEN 2 ELSE 1 END DESC, \
                 created_at ASC, rowid ASC"
            ))
            .map_err(storage_err(StorageOp::Dequeue))?;
        let rows = stmt
            .query_map([], read_task_row)
            .map_err(storage_err(StorageOp::Dequeue))?;

        for row in rows {
            let task = row
                .map_err(storage_err(StorageOp::Dequeue))?
                .into_task(StorageOp::Dequeue)?;
            if exclude.contains(&task.id) {
                continue;
            }
            if task.task_type.matches_capabilities(capabilities) {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
                read_task_row,
            )
            .optional()
            .map_err(storage_err(StorageOp::Dequeue))?;
        row.map(|r| r.into_task(StorageOp::Dequeue)).transpose()
    }

    async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        assignee: Option<AgentId>,
    ) -> Result<Task> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
                read_task_row,
            )
            .optional()
            .map_err(storage_err(StorageOp::UpdateTask))?
            .ok_or_else(|| CoordinationError::TaskNotFound(id.to_string()))?;

        let previous_status = row.status.clone();
        let mut task = row.into_task(StorageOp::UpdateTask)?;
        apply_status_transition(&mut task, status, assignee)?;

        // Conditional write: the WHERE clause re-checks the status we read,
        // so an interleaved writer loses deterministically.
        let updated = conn
            .execute(
                "UPDATE tasks SET status = ?1, assigned_to = ?2, result = ?3, updated_at = ?4 \
                 WHERE id = ?5 AND status = ?6",
                params![
                    task.status.to_string(),
                    task.assigned_to.map(|a| a.as_str().to_string()),
                    task.result
                        .as_ref()
                        .and_then(|r| serde_json::to_string(r).ok()),
                    millis(task.updated_at),
                    id,
                    previous_status,
                ],
            )
            .map_err(storage_err(StorageOp::UpdateTask))?;
        if updated == 0 {
            return Err(CoordinationError::Storage {
                op: StorageOp::UpdateTask,
                message: format!("concurrent update lost for task {id}"),
            });
        }
        debug!(task_id = %id, status = %status, "task status updated (sqlite)");
        Ok(task)
    }

    async fn update_task_result(&self, id: &str, result: TaskResult) -> Result<Task> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
                read_task_row,
            )
            .optional()
            .map_err(storage_err(StorageOp::UpdateTask))?
            .ok_or_else(|| CoordinationError::TaskNotFound(id.to_string()))?;

        let previous_status = row.status.clone();
        let mut task = row.into_task(StorageOp::UpdateTask)?;
        apply_result(&mut task, result)?;

        let updated = conn
            .execute(
                "UPDATE tasks SET status = ?1, result = ?2, updated_at = ?3 \
                 WHERE id = ?4 AND status = ?5",
                params![
                    task.status.to_string(),
                    task.result
                        .as_ref()
                        .and_then(|r| serde_json::to_string(r).ok()),
                    millis(task.updated_at),
                    id,
                    previous_status,
                ],
            )
            .map_err(storage_err(StorageOp::UpdateTask))?;
        if updated == 0 {
            return Err(CoordinationError::Storage {
                op: StorageOp::UpdateTask,
                message: format!("concurrent update lost for task {id}"),
            });
        }
        Ok(task)
    }

    async fn get_session_tasks(&self, session_id: &str) -> Result<Vec<Task>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE session_id = ?1 \
                 ORDER BY created_at ASC, rowid ASC"
            ))
            .map_err(storage_err(StorageOp::Dequeue))?;
        let rows = stmt
            .query_map(params![session_id], read_task_row)
            .map_err(storage_err(StorageOp::Dequeue))?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(
                row.map_err(storage_err(StorageOp::Dequeue))?
                    .into_task(StorageOp::Dequeue)?,
            );
        }
        Ok(tasks)
    }

    async fn acquire_lock(
        &self,
        path: &str,
        owner: AgentId,
        operation: LockOperation,
        ttl: Duration,
    ) -> Result<FileLock> {
        let now = Utc::now();
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(storage_err(StorageOp::UpdateLock))?;

        sweep_locks(&tx, now).map_err(storage_err(StorageOp::UpdateLock))?;

        let existing = tx
            .query_row(
                &format!("SELECT {LOCK_COLUMNS} FROM file_locks WHERE path = ?1"),
                params![path],
                read_lock_row,
            )
            .optional()
            .map_err(storage_err(StorageOp::UpdateLock))?;
        if let Some(row) = existing {
            let lock = lock_from_row(row)?;
            return Err(CoordinationError::FileAlreadyLocked {
                path: path.to_string(),
                locked_by: lock.owner,
                expires_at: lock.expires_at,
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
        tx.execute(
            "INSERT INTO file_locks (path, owner, lock_token, operation, acquired_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                lock.path,
                lock.owner.as_str(),
                lock.lock_token,
                lock.operation.to_string(),
                millis(lock.acquired_at),
                millis(lock.expires_at),
            ],
        )
        .map_err(storage_err(StorageOp::UpdateLock))?;
        tx.commit().map_err(storage_err(StorageOp::UpdateLock))?;

        debug!(path = %path, owner = %owner, "lock acquired (sqlite)");
        Ok(lock)
    }

    async fn release_lock(&self, token: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let deleted = conn
            .execute(
                "DELETE FROM file_locks WHERE lock_token = ?1",
                params![token],
            )
            .map_err(storage_err(StorageOp::UpdateLock))?;
        if deleted == 0 {
            return Err(CoordinationError::LockNotFound(token.to_string()));
        }
        Ok(())
    }

    async fn is_locked(&self, path: &str) -> Result<Option<FileLock>> {
        let conn = self.conn.lock().await;
        sweep_locks(&conn, Utc::now()).map_err(storage_err(StorageOp::UpdateLock))?;
        let row = conn
            .query_row(
                &format!("SELECT {LOCK_COLUMNS} FROM file_locks WHERE path = ?1"),
                params![path],
                read_lock_row,
            )
            .optional()
            .map_err(storage_err(StorageOp::UpdateLock))?;
        row.map(lock_from_row).transpose()
    }

    async fn get_all_locks(&self) -> Result<Vec<FileLock>> {
        let conn = self.conn.lock().await;
        sweep_locks(&conn, Utc::now()).map_err(storage_err(StorageOp::UpdateLock))?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {LOCK_COLUMNS} FROM file_locks ORDER BY acquired_at ASC"
            ))
            .map_err(storage_err(StorageOp::UpdateLock))?;
        let rows = stmt
            .query_map([], read_lock_row)
            .map_err(storage_err(StorageOp::UpdateLock))?;
        let mut locks = Vec::new();
        for row in rows {
            locks.push(lock_from_row(
                row.map_err(storage_err(StorageOp::UpdateLock))?,
            )?);
        }
        Ok(locks)
    }

    async fn release_all_locks_for_agent(&self, owner: AgentId) -> Result<usize> {
        let conn = self.conn.lock().await;
        let deleted = conn
            .execute(
                "DELETE FROM file_locks WHERE owner = ?1",
                params![owner.as_str()],
            )
            .map_err(storage_err(StorageOp::UpdateLock))?;
        Ok(deleted)
    }

    async fn save_context(&self, mut context: ConversationContext) -> Result<ConversationContext> {
        context.last_updated = Utc::now();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO contexts (id, messages, shared_state, last_updated) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                context.id,
                serde_json::to_string(&context.messages).unwrap_or_else(|_| "[]".to_string()),
                serde_json::to_string(&context.shared_state).unwrap_or_else(|_| "{}".to_string()),
                millis(context.last_updated),
            ],
        )
        .map_err(storage_err(StorageOp::SaveContext))?;
        Ok(context)
    }

    async fn load_context(&self, id: &str) -> Result<Option<ConversationContext>> {
        let conn = self.conn.lock().await;
        let row: Option<(String, String, i64)> = conn
            .query_row(
                "SELECT messages, shared_state, last_updated FROM contexts WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(storage_err(StorageOp::SaveContext))?;
        match row {
            Some((messages, shared_state, last_updated)) => Ok(Some(ConversationContext {
                id: id.to_string(),
                messages: serde_json::from_str(&messages)
                    .map_err(|_| decode_err(StorageOp::SaveContext, "messages"))?,
                shared_state: serde_json::from_str(&shared_state)
                    .map_err(|_| decode_err(StorageOp::SaveContext, "shared_state"))?,
                last_updated: from_millis(last_updated),
            })),
            None => Ok(None),
        }
    }

    async fn append_message(&self, id: &str, message: Message) -> Result<ConversationContext> {
        let conn = self.conn.lock().await;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT messages, shared_state FROM contexts WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(storage_err(StorageOp::SaveContext))?;
        let (messages_json, shared_state_json) =
            row.ok_or_else(|| CoordinationError::ContextNotFound(id.to_string()))?;

        let mut messages: Vec<Message> = serde_json::from_str(&messages_json)
            .map_err(|_| decode_err(StorageOp::SaveContext, "messages"))?;
        let last_updated = Utc::now().max(message.timestamp);
        messages.push(message);

        conn.execute(
            "UPDATE contexts SET messages = ?1, last_updated = ?2 WHERE id = ?3",
            params![
                serde_json::to_string(&messages).unwrap_or_else(|_| "[]".to_string()),
                millis(last_updated),
                id,
            ],
        )
        .map_err(storage_err(StorageOp::SaveContext))?;

        Ok(ConversationContext {
            id: id.to_string(),
            messages,
            shared_state: serde_json::from_str(&shared_state_json)
                .map_err(|_| decode_err(StorageOp::SaveContext, "shared_state"))?,
            last_updated,
        })
    }
}
