//! Session lifecycle and the operator-facing view of a collaboration.
//!
//! A session groups tasks under a shared conversation context, seeds the
//! initial work for its mode, and owns the event channel subscribers
//! observe. Sessions live in memory; their tasks and context round-trip
//! through the state store like everything else.

pub mod events;

pub use events::{EventBus, EventStream};

use crate::{
    locks::LockRegistry,
    models::{
        fresh_id, AgentId, CollaborationEvent, CollaborationSession, ConflictResolution,
        ConversationContext, FileConflict, FileLock, Message, MessageRole, Priority, SessionMode,
        SessionStatus, Task, TaskContext, TaskType,
    },
    store::StateStore,
    CoordinationError, Result,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, str::FromStr, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Input for starting a collaboration
#[derive(Debug, Clone, Deserialize)]
pub struct StartCollaboration {
    pub task: String,
    pub mode: SessionMode,
    /// `"auto"` (or absent) selects a lead by heuristic; otherwise an agent
    /// name used verbatim
    #[serde(default)]
    pub preferred_lead: Option<String>,
    #[serde(default)]
    pub context_id: Option<String>,
    /// Enqueues a small representative task set for operator smoke-testing
    #[serde(default)]
    pub seed_demo_tasks: bool,
}

/// Aggregated view returned by `get_collaboration_status`
#[derive(Debug, Clone, Serialize)]
pub struct CollaborationStatus {
    pub session: CollaborationSession,
    pub active_tasks: Vec<Task>,
    pub completed_tasks: Vec<Task>,
    /// All current lock holders; the registry is server-wide
    pub locks: Vec<FileLock>,
    pub pending_conflicts: Vec<FileConflict>,
    pub progress: ProgressSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressSummary {
    pub total: usize,
    pub completed: usize,
    pub percent: u32,
}

impl ProgressSummary {
    fn from_counts(total: usize, completed: usize) -> Self {
        let percent = if total == 0 {
            0
        } else {
            ((completed as f64 / total as f64) * 100.0).round() as u32
        };
        Self {
            total,
            completed,
            percent,
        }
    }
}

pub struct SessionManager {
    store: Arc<dyn StateStore>,
    locks: Arc<LockRegistry>,
    events: Arc<EventBus>,
    sessions: RwLock<HashMap<String, CollaborationSession>>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn StateStore>, locks: Arc<LockRegistry>, events: Arc<EventBus>) -> Self {
        Self {
            store,
            locks,
            events,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Opens a session: allocates or reuses its conversation context, picks
    /// the lead agent, seeds the mode's initial tasks, and opens the event
    /// channel.
    pub async fn start_collaboration(
        &self,
        request: StartCollaboration,
    ) -> Result<CollaborationSession> {
        let session_id = fresh_id("session");

        let context_id = match request.context_id {
            Some(ref id) => id.clone(),
            None => fresh_id("context"),
        };
        if self.store.load_context(&context_id).await?.is_none() {
            let mut context = ConversationContext::new(context_id.clone());
            context.messages.push(Message::new(
                MessageRole::System,
                format!(
                    "Collaboration session started: {} (mode: {})",
                    request.task,
                    mode_name(request.mode)
                ),
            ));
            self.store.save_context(context).await?;
        }

        let lead_agent = self.select_lead(&request)?;

        let now = Utc::now();
        let session = CollaborationSession {
            id: session_id.clone(),
            task: request.task.clone(),
            mode: request.mode,
            lead_agent: Some(lead_agent),
            participants: vec![AgentId::Planner, AgentId::Executor],
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
            context_id,
        };

        self.seed_initial_tasks(&session).await?;
        if request.seed_demo_tasks {
            self.seed_demo_tasks(&session_id).await?;
        }

        self.sessions
            .write()
            .await
            .insert(session_id.clone(), session.clone());
        self.events.open_channel(&session_id).await;
        self.events
            .publish(CollaborationEvent::SessionResumed {
                session_id: session_id.clone(),
                timestamp: Utc::now(),
            })
            .await;

        info!(session_id = %session_id, mode = %mode_name(session.mode), lead = %lead_agent, "collaboration started");
        Ok(session)
    }

    fn select_lead(&self, request: &StartCollaboration) -> Result<AgentId> {
        match request.preferred_lead.as_deref() {
            None | Some("auto") => Ok(match request.mode {
                SessionMode::OrchestratorWorker => AgentId::Planner,
                _ => {
                    let task = request.task.to_lowercase();
                    if task.contains("ui") || task.contains("component") {
                        AgentId::Executor
                    } else {
                        AgentId::Planner
                    }
                }
            }),
            Some(name) => AgentId::from_str(name)
                .map_err(|_| CoordinationError::InvalidInput(format!("unknown lead agent: {name}"))),
        }
    }

    async fn seed_initial_tasks(&self, session: &CollaborationSession) -> Result<()> {
        match session.mode {
            SessionMode::OrchestratorWorker => {
                let task = Task::new(
                    &session.id,
                    TaskType::ImplementFeature,
                    session.task.clone(),
                    Priority::High,
                )
                .with_constraint("act as orchestrator")
                .with_constraint("break the task down into sub-tasks")
                .with_constraint("assign implementation work to the executor");
                self.store.enqueue_task(task).await?;
            }
            SessionMode::PeerToPeer => {
                let contract = Task::new(
                    &session.id,
                    TaskType::DefineContract,
                    format!("Define the interface contract for: {}", session.task),
                    Priority::High,
                );
                let implementation = Task::new(
                    &session.id,
                    TaskType::ImplementFeature,
                    format!("Implement against the agreed contract: {}", session.task),
                    Priority::High,
                );
                self.store.enqueue_task(contract).await?;
                self.store.enqueue_task(implementation).await?;
            }
            SessionMode::Parallel => {
                let task = Task::new(
                    &session.id,
                    TaskType::ImplementFeature,
                    format!("[parallel] {}", session.task),
                    Priority::High,
                )
                .with_constraint("coordinate file access through the lock registry");
                self.store.enqueue_task(task).await?;
            }
        }
        Ok(())
    }

    async fn seed_demo_tasks(&self, session_id: &str) -> Result<()> {
        let demos = [
            (TaskType::WriteTests, "Cover the queue ordering with tests", Priority::Medium),
            (TaskType::UpdateDocs, "Document the lock expiry behavior", Priority::Low),
            (TaskType::ReviewCode, "Review the pending changes", Priority::Medium),
        ];
        for (task_type, description, priority) in demos {
            self.store
                .enqueue_task(Task::new(session_id, task_type, description, priority).with_context(
                    TaskContext {
                        requirements: vec!["demo seed".to_string()],
                        ..TaskContext::default()
                    },
                ))
                .await?;
        }
        debug!(session_id = %session_id, "demo tasks seeded");
        Ok(())
    }

    pub async fn get_session(&self, id: &str) -> Result<CollaborationSession> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CoordinationError::SessionNotFound(id.to_string()))
    }

    /// The single active session's id, used as a default by tools that take
    /// no explicit session. Errors unless exactly one session is active.
    pub async fn single_active_session(&self) -> Result<String> {
        let sessions = self.sessions.read().await;
        let mut active = sessions
            .values()
            .filter(|s| s.status == SessionStatus::Active);
        match (active.next(), active.next()) {
            (Some(session), None) => Ok(session.id.clone()),
            (None, _) => Err(CoordinationError::InvalidInput(
                "no active session".to_string(),
            )),
            (Some(_), Some(_)) => Err(CoordinationError::InvalidInput(
                "multiple active sessions; specify sessionId".to_string(),
            )),
        }
    }

    pub async fn pause(&self, id: &str) -> Result<CollaborationSession> {
        let session = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| CoordinationError::SessionNotFound(id.to_string()))?;
            if session.status != SessionStatus::Active {
                return Err(CoordinationError::SessionNotActive(id.to_string()));
            }
            session.status = SessionStatus::Paused;
            session.updated_at = Utc::now();
            session.clone()
        };
        self.events
            .publish(CollaborationEvent::SessionPaused {
                session_id: id.to_string(),
                timestamp: Utc::now(),
            })
            .await;
        info!(session_id = %id, "session paused");
        Ok(session)
    }

    pub async fn resume(&self, id: &str) -> Result<CollaborationSession> {
        let session = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| CoordinationError::SessionNotFound(id.to_string()))?;
            if session.status != SessionStatus::Paused {
                return Err(CoordinationError::SessionNotPaused(id.to_string()));
            }
            session.status = SessionStatus::Active;
            session.updated_at = Utc::now();
            session.clone()
        };
        self.events
            .publish(CollaborationEvent::SessionResumed {
                session_id: id.to_string(),
                timestamp: Utc::now(),
            })
            .await;
        info!(session_id = %id, "session resumed");
        Ok(session)
    }

    /// Cancels a session. Terminates every event subscription; running
    /// agent tasks are not cancelled and their results are still accepted.
    pub async fn cancel(&self, id: &str) -> Result<CollaborationSession> {
        let session = self
            .finish_session(id, SessionStatus::Cancelled)
            .await?;
        info!(session_id = %id, "session cancelled");
        Ok(session)
    }

    /// Marks a session completed and ends its event streams.
    pub async fn complete(&self, id: &str) -> Result<CollaborationSession> {
        let session = self
            .finish_session(id, SessionStatus::Completed)
            .await?;
        info!(session_id = %id, "session completed");
        Ok(session)
    }

    async fn finish_session(&self, id: &str, terminal: SessionStatus) -> Result<CollaborationSession> {
        let session = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| CoordinationError::SessionNotFound(id.to_string()))?;
            if session.status.is_terminal() {
                return Err(CoordinationError::SessionNotActive(id.to_string()));
            }
            session.status = terminal;
            session.updated_at = Utc::now();
            session.clone()
        };
        self.events.close_channel(id).await;
        Ok(session)
    }

    /// Aggregated status: the session record, its tasks split into active
    /// and finished, every current lock holder, unresolved conflicts
    /// touching the session's participants, and a progress summary.
    pub async fn get_collaboration_status(&self, id: &str) -> Result<CollaborationStatus> {
        let session = self.get_session(id).await?;
        let tasks = self.store.get_session_tasks(id).await?;

        let (finished, active): (Vec<Task>, Vec<Task>) =
            tasks.into_iter().partition(|t| t.status.is_terminal());
        let completed_count = finished
            .iter()
            .filter(|t| t.status == crate::models::TaskStatus::Completed)
            .count();
        let total = finished.len() + active.len();

        let locks = self.store.get_all_locks().await?;
        let pending_conflicts: Vec<FileConflict> = self
            .locks
            .unresolved_conflicts()
            .await
            .into_iter()
            .filter(|c| c.agents.iter().any(|a| session.participants.contains(a)))
            .collect();

        Ok(CollaborationStatus {
            progress: ProgressSummary::from_counts(total, completed_count),
            session,
            active_tasks: active,
            completed_tasks: finished,
            locks,
            pending_conflicts,
        })
    }

    /// A lazy, finite event sequence for one session. Sessions already in a
    /// terminal state yield an immediately-ended stream.
    pub async fn subscribe_to_updates(&self, id: &str) -> Result<EventStream> {
        let session = self.get_session(id).await?;
        match self.events.subscribe(id).await {
            Some(stream) => Ok(stream),
            None if session.status.is_terminal() => Ok(EventStream::ended()),
            None => Err(CoordinationError::SessionNotFound(id.to_string())),
        }
    }

    /// Resolves a recorded conflict and notifies every active session whose
    /// participants were involved.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: ConflictResolution,
    ) -> Result<FileConflict> {
        let conflict = self.locks.resolve_conflict(conflict_id, resolution).await?;

        let interested: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| s.status == SessionStatus::Active)
                .filter(|s| conflict.agents.iter().any(|a| s.participants.contains(a)))
                .map(|s| s.id.clone())
                .collect()
        };
        for session_id in interested {
            self.events
                .publish(CollaborationEvent::ConflictDetected {
                    session_id,
                    conflict: conflict.clone(),
                    timestamp: Utc::now(),
                })
                .await;
        }
        Ok(conflict)
    }

    /// Session counts by status, for the metrics endpoint.
    pub async fn session_counts(&self) -> HashMap<&'static str, usize> {
        let sessions = self.sessions.read().await;
        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        for session in sessions.values() {
            let key = match session.status {
                SessionStatus::Active => "active",
                SessionStatus::Paused => "paused",
                SessionStatus::Cancelled => "cancelled",
                SessionStatus::Completed => "completed",
            };
            *counts.entry(key).or_default() += 1;
        }
        counts
    }
}

fn mode_name(mode: SessionMode) -> &'static str {
    match mode {
        SessionMode::OrchestratorWorker => "orchestrator-worker",
        SessionMode::PeerToPeer => "peer-to-peer",
        SessionMode::Parallel => "parallel",
    }
}
