//! Agent-facing task lifecycle: discover, claim, execute, complete, plus
//! handoffs and capability registration.
//!
//! Discovery is a side-effect-free peek; claiming is a conditional update
//! inside the state store, so two agents racing for one task resolve to
//! exactly one winner. Handoff and registration records are queue-local
//! state; the tasks themselves always live in the store.

use crate::{
    constants::AVAILABLE_TASK_BATCH,
    models::{
        fresh_id, AgentId, AgentRegistration, CollaborationEvent, Handoff, HandoffStatus, Task,
        TaskProgress, TaskResult, TaskStatus,
    },
    session::EventBus,
    store::StateStore,
    CoordinationError, Result,
};
use chrono::Utc;
use serde::Deserialize;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Input for `request_handoff`
#[derive(Debug, Clone, Deserialize)]
pub struct HandoffRequest {
    pub task_id: String,
    pub to_agent: AgentId,
    pub reason: String,
    pub current_state: String,
    #[serde(default)]
    pub next_steps: Vec<String>,
}

pub struct TaskQueue {
    store: Arc<dyn StateStore>,
    events: Arc<EventBus>,
    handoffs: Mutex<HashMap<String, Handoff>>,
    registrations: Mutex<HashMap<AgentId, AgentRegistration>>,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn StateStore>, events: Arc<EventBus>) -> Self {
        Self {
            store,
            events,
            handoffs: Mutex::new(HashMap::new()),
            registrations: Mutex::new(HashMap::new()),
        }
    }

    /// Adds a task to the queue.
    pub async fn enqueue(&self, task: Task) -> Result<Task> {
        self.store.enqueue_task(task).await
    }

    /// Up to a batch of candidate tasks matching the capability set,
    /// priority+FIFO ordered. Pure peek: nothing is reserved, and
    /// concurrent pollers may see the same candidates.
    pub async fn get_available_tasks(&self, capabilities: &[String]) -> Result<Vec<Task>> {
        let mut candidates = Vec::with_capacity(AVAILABLE_TASK_BATCH);
        let mut exclude: Vec<String> = Vec::new();
        while candidates.len() < AVAILABLE_TASK_BATCH {
            match self.store.dequeue_task(capabilities, &exclude).await? {
                Some(task) => {
                    exclude.push(task.id.clone());
                    candidates.push(task);
                }
                None => break,
            }
        }
        Ok(candidates)
    }

    /// Atomically claims a queued task for an agent. Exactly one of any
    /// set of concurrent claims succeeds; the rest get
    /// `TASK_ALREADY_CLAIMED`.
    pub async fn claim_task(&self, task_id: &str, agent: AgentId) -> Result<Task> {
        let task = self
            .store
            .update_task_status(task_id, TaskStatus::Claimed, Some(agent))
            .await?;
        self.events
            .publish(CollaborationEvent::TaskClaimed {
                session_id: task.session_id.clone(),
                task_id: task.id.clone(),
                agent,
                timestamp: Utc::now(),
            })
            .await;
        info!(task_id = %task_id, agent = %agent, "task claimed");
        Ok(task)
    }

    /// Records execution progress. The first report advances the task from
    /// claimed to in-progress; later reports only refresh `updated_at`
    /// bookkeeping and are otherwise no-ops.
    pub async fn report_progress(
        &self,
        task_id: &str,
        agent: AgentId,
        progress: &TaskProgress,
    ) -> Result<Task> {
        if progress.percent_complete > 100 {
            return Err(CoordinationError::InvalidInput(format!(
                "percent_complete out of range: {}",
                progress.percent_complete
            )));
        }
        let task = self.assigned_task(task_id, agent).await?;
        debug!(
            task_id = %task_id,
            percent = progress.percent_complete,
            step = %progress.current_step,
            "progress reported"
        );
        match task.status {
            TaskStatus::Claimed => {
                self.store
                    .update_task_status(task_id, TaskStatus::InProgress, None)
                    .await
            }
            _ => Ok(task),
        }
    }

    /// Completes a task with its result; the terminal status follows
    /// `result.success`. Only the assigned agent may complete.
    pub async fn complete_task(
        &self,
        task_id: &str,
        agent: AgentId,
        result: TaskResult,
    ) -> Result<Task> {
        self.assigned_task(task_id, agent).await?;
        let task = self.store.update_task_result(task_id, result).await?;
        self.events
            .publish(CollaborationEvent::TaskCompleted {
                session_id: task.session_id.clone(),
                task_id: task.id.clone(),
                success: task.status == TaskStatus::Completed,
                timestamp: Utc::now(),
            })
            .await;
        info!(task_id = %task_id, status = %task.status, "task completed");
        Ok(task)
    }

    /// Hands a claimed or in-progress task off to another agent. The task
    /// reverts to an unassigned handed-off state until the target accepts.
    pub async fn request_handoff(&self, request: HandoffRequest, from: AgentId) -> Result<Handoff> {
        self.assigned_task(&request.task_id, from).await?;
        self.store
            .update_task_status(&request.task_id, TaskStatus::HandedOff, None)
            .await?;

        let handoff = Handoff {
            id: fresh_id("handoff"),
            task_id: request.task_id,
            from,
            to: request.to_agent,
            reason: request.reason,
            current_state: request.current_state,
            next_steps: request.next_steps,
            requested_at: Utc::now(),
            status: HandoffStatus::Pending,
        };
        self.handoffs
            .lock()
            .await
            .insert(handoff.id.clone(), handoff.clone());
        info!(handoff_id = %handoff.id, from = %from, to = %handoff.to, "handoff requested");
        Ok(handoff)
    }

    /// Accepts a pending handoff: reassigns the task to the target agent
    /// and puts it straight into in-progress. The target does not need to
    /// be registered.
    pub async fn accept_handoff(&self, handoff_id: &str, agent: AgentId) -> Result<Task> {
        let handoff = {
            let handoffs = self.handoffs.lock().await;
            handoffs
                .get(handoff_id)
                .cloned()
                .ok_or_else(|| CoordinationError::HandoffNotFound(handoff_id.to_string()))?
        };
        if handoff.to != agent {
            return Err(CoordinationError::HandoffNotForAgent {
                handoff_id: handoff_id.to_string(),
                agent,
            });
        }

        let task = self
            .store
            .update_task_status(&handoff.task_id, TaskStatus::InProgress, Some(agent))
            .await?;

        let mut handoffs = self.handoffs.lock().await;
        if let Some(entry) = handoffs.get_mut(handoff_id) {
            entry.status = HandoffStatus::Accepted;
        }
        info!(handoff_id = %handoff_id, agent = %agent, "handoff accepted");
        Ok(task)
    }

    pub async fn get_handoff(&self, handoff_id: &str) -> Result<Handoff> {
        let handoffs = self.handoffs.lock().await;
        handoffs
            .get(handoff_id)
            .cloned()
            .ok_or_else(|| CoordinationError::HandoffNotFound(handoff_id.to_string()))
    }

    /// Registers (or re-registers) an agent with its capability set.
    /// Idempotent: the same agent keeps its token across re-registrations,
    /// with `last_seen`, capabilities, and version refreshed.
    pub async fn register_agent(
        &self,
        agent: AgentId,
        capabilities: Vec<String>,
        version: String,
    ) -> Result<AgentRegistration> {
        if capabilities.is_empty() {
            return Err(CoordinationError::InvalidCapabilities);
        }

        let mut registrations = self.registrations.lock().await;
        let now = Utc::now();
        let registration = match registrations.get_mut(&agent) {
            Some(existing) => {
                existing.capabilities = capabilities;
                existing.version = version;
                existing.last_seen = now;
                existing.clone()
            }
            None => {
                let registration = AgentRegistration {
                    token: fresh_id("reg"),
                    agent,
                    capabilities,
                    version,
                    registered_at: now,
                    last_seen: now,
                };
                registrations.insert(agent, registration.clone());
                registration
            }
        };
        debug!(agent = %agent, token = %registration.token, "agent registered");
        Ok(registration)
    }

    pub async fn registered_agent_count(&self) -> usize {
        self.registrations.lock().await.len()
    }

    /// Number of currently queued tasks, for the metrics endpoint.
    pub async fn queued_depth(&self) -> Result<usize> {
        // Every task type requires at least one capability from the fixed
        // vocabulary, so peeking with the full vocabulary sees the whole
        // queue.
        let all_caps: Vec<String> = [
            "typescript-development",
            "svelte-development",
            "testing",
            "refactoring",
            "debugging",
            "code-review",
            "documentation",
            "contract-definition",
            "mock-implementation",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let mut exclude = Vec::new();
        while let Some(task) = self.store.dequeue_task(&all_caps, &exclude).await? {
            exclude.push(task.id);
        }
        Ok(exclude.len())
    }

    async fn assigned_task(&self, task_id: &str, agent: AgentId) -> Result<Task> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| CoordinationError::TaskNotFound(task_id.to_string()))?;
        if task.assigned_to != Some(agent) {
            return Err(CoordinationError::TaskNotAssigned {
                task_id: task_id.to_string(),
                agent,
            });
        }
        Ok(task)
    }
}
