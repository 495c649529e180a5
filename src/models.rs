use crate::error::ErrorBody;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, str::FromStr};
use uuid::Uuid;

/// Generates an opaque identifier with the given prefix, e.g. `task_4f1a…`.
/// The random part is a 128-bit UUID, so ids are unique for the server's
/// lifetime without coordination.
pub fn fresh_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

/// The closed set of agent identities the server coordinates
///
/// The wire names come from the collaborating processes: the planner runs
/// inside Claude Code, the executor is reached through GitHub Copilot's tool
/// protocol, and the human operator is `user`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AgentId {
    #[serde(rename = "claude-code")]
    Planner,
    #[serde(rename = "github-copilot")]
    Executor,
    #[serde(rename = "user")]
    User,
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AgentId {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentId::Planner => "claude-code",
            AgentId::Executor => "github-copilot",
            AgentId::User => "user",
        }
    }
}

impl FromStr for AgentId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude-code" | "planner" => Ok(AgentId::Planner),
            "github-copilot" | "executor" => Ok(AgentId::Executor),
            "user" => Ok(AgentId::User),
            _ => Err(format!("unknown agent: {s}")),
        }
    }
}

/// Work categories a task can belong to
///
/// Unrecognized categories deserialize to `Unknown` and fall back to the
/// default capability requirement.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    ImplementFeature,
    WriteTests,
    RefactorCode,
    FixBug,
    ReviewCode,
    UpdateDocs,
    DefineContract,
    ImplementMock,
    Unknown,
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "implement-feature" => Ok(TaskType::ImplementFeature),
            "write-tests" => Ok(TaskType::WriteTests),
            "refactor-code" => Ok(TaskType::RefactorCode),
            "fix-bug" => Ok(TaskType::FixBug),
            "review-code" => Ok(TaskType::ReviewCode),
            "update-docs" => Ok(TaskType::UpdateDocs),
            "define-contract" => Ok(TaskType::DefineContract),
            "implement-mock" => Ok(TaskType::ImplementMock),
            _ => Err(format!("unknown task type: {s}")),
        }
    }
}

impl<'de> Deserialize<'de> for TaskType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let tag = String::deserialize(deserializer)?;
        Ok(tag.parse().unwrap_or(TaskType::Unknown))
    }
}

impl TaskType {
    /// Capabilities an agent must declare (at least one of) to be offered
    /// tasks of this type
    pub fn required_capabilities(&self) -> &'static [&'static str] {
        match self {
            TaskType::ImplementFeature => &["typescript-development", "svelte-development"],
            TaskType::WriteTests => &["testing"],
            TaskType::RefactorCode => &["refactoring", "typescript-development"],
            TaskType::FixBug => &["debugging", "typescript-development"],
            TaskType::ReviewCode => &["code-review"],
            TaskType::UpdateDocs => &["documentation"],
            TaskType::DefineContract => &["contract-definition"],
            TaskType::ImplementMock => &["mock-implementation", "typescript-development"],
            TaskType::Unknown => &["typescript-development"],
        }
    }

    /// True iff the capability set overlaps this type's requirements
    pub fn matches_capabilities(&self, capabilities: &[String]) -> bool {
        self.required_capabilities()
            .iter()
            .any(|required| capabilities.iter().any(|c| c == required))
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskType::ImplementFeature => "implement-feature",
            TaskType::WriteTests => "write-tests",
            TaskType::RefactorCode => "refactor-code",
            TaskType::FixBug => "fix-bug",
            TaskType::ReviewCode => "review-code",
            TaskType::UpdateDocs => "update-docs",
            TaskType::DefineContract => "define-contract",
            TaskType::ImplementMock => "implement-mock",
            TaskType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Task priority levels; `urgent` ranks above `high`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    /// Total ordering rank: higher runs first
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Low => 1,
            Priority::Medium => 2,
            Priority::High => 3,
            Priority::Urgent => 4,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        };
        f.write_str(name)
    }
}

/// Current position of a task in its lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Queued,
    Claimed,
    InProgress,
    HandedOff,
    Blocked,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether a task may still produce work (anything non-terminal)
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Permitted lifecycle transitions. Status updates that are not listed
    /// here are rejected by the state store.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, Claimed)
                | (Claimed, InProgress)
                | (Claimed, HandedOff)
                | (Claimed, Blocked)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, HandedOff)
                | (InProgress, Blocked)
                | (HandedOff, InProgress)
                | (Blocked, Queued)
                | (Blocked, InProgress)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Claimed => "claimed",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::HandedOff => "handed-off",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Structured working context attached to a task
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskContext {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    /// Digest of prior conversation relevant to the task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_messages: Option<String>,
}

/// Outcome reported by the agent that executed a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub output: String,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskErrorInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskErrorInfo {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

/// Transient execution progress; only its side effect on task status and
/// `updated_at` survives a crash
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgress {
    pub percent_complete: u8,
    pub current_step: String,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_seconds: Option<u64>,
}

/// The fundamental unit of work mediated by the server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub session_id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub description: String,
    pub priority: Priority,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<AgentId>,
    #[serde(default)]
    pub context: TaskContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Creates a queued task with a fresh id and current timestamps
    pub fn new(
        session_id: impl Into<String>,
        task_type: TaskType,
        description: impl Into<String>,
        priority: Priority,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: fresh_id("task"),
            session_id: session_id.into(),
            task_type,
            description: description.into(),
            priority,
            status: TaskStatus::Queued,
            assigned_to: None,
            context: TaskContext::default(),
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_context(mut self, context: TaskContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.context.constraints.push(constraint.into());
        self
    }
}

/// File-lock operation kinds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LockOperation {
    Read,
    Write,
    Delete,
}

impl LockOperation {
    /// Write and delete both require exclusive access to the path
    pub fn is_exclusive(&self) -> bool {
        matches!(self, LockOperation::Write | LockOperation::Delete)
    }
}

impl fmt::Display for LockOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockOperation::Read => "read",
            LockOperation::Write => "write",
            LockOperation::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// An advisory lock on a file path. The server never touches the file
/// itself; holders are trusted to honor the lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLock {
    pub path: String,
    pub owner: AgentId,
    pub lock_token: String,
    pub operation: LockOperation,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl FileLock {
    /// A lock exactly at its expiry instant counts as expired
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// What an agent holds after a successful `request_file_access`
///
/// Read grants carry no token (reads are tracked registry-side only);
/// write/delete grants carry the token needed to release the store lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAccessGrant {
    pub path: String,
    pub operation: LockOperation,
    pub agent: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Conversation message roles
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Planner,
    Executor,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: None,
        }
    }
}

/// Durable shared conversation state for a session
///
/// `messages` is append-only; `shared_state` is a free-form key/value map
/// the agents use to pass structured notes between turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
    pub id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub shared_state: HashMap<String, serde_json::Value>,
    pub last_updated: DateTime<Utc>,
}

impl ConversationContext {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            messages: Vec::new(),
            shared_state: HashMap::new(),
            last_updated: Utc::now(),
        }
    }
}

/// How the agents divide work within a session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SessionMode {
    OrchestratorWorker,
    PeerToPeer,
    Parallel,
}

/// Session lifecycle states; `cancelled` and `completed` are terminal
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Paused,
    Cancelled,
    Completed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Cancelled | SessionStatus::Completed)
    }
}

/// A user-scoped grouping of tasks with a shared conversation context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationSession {
    pub id: String,
    pub task: String,
    pub mode: SessionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_agent: Option<AgentId>,
    pub participants: Vec<AgentId>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub context_id: String,
}

/// Kinds of file contention the lock registry records
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
    SimultaneousWrite,
    EditDeleted,
    StaleEdit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    AcceptA,
    AcceptB,
    Merge,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub strategy: ResolutionStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_content: Option<String>,
    pub resolved_by: AgentId,
    pub resolved_at: DateTime<Utc>,
}

/// A recorded contention event on a path, surfaced to the operator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConflict {
    pub id: String,
    pub path: String,
    pub agents: Vec<AgentId>,
    pub conflict_type: ConflictType,
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ConflictResolution>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HandoffStatus {
    Pending,
    Accepted,
}

/// A mediated transfer of a claimed task between agents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handoff {
    pub id: String,
    pub task_id: String,
    pub from: AgentId,
    pub to: AgentId,
    pub reason: String,
    pub current_state: String,
    #[serde(default)]
    pub next_steps: Vec<String>,
    pub requested_at: DateTime<Utc>,
    pub status: HandoffStatus,
}

/// An agent's declared capabilities, refreshed on re-registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub token: String,
    pub agent: AgentId,
    pub capabilities: Vec<String>,
    pub version: String,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Events streamed to session subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CollaborationEvent {
    TaskClaimed {
        session_id: String,
        task_id: String,
        agent: AgentId,
        timestamp: DateTime<Utc>,
    },
    TaskCompleted {
        session_id: String,
        task_id: String,
        success: bool,
        timestamp: DateTime<Utc>,
    },
    SessionPaused {
        session_id: String,
        timestamp: DateTime<Utc>,
    },
    SessionResumed {
        session_id: String,
        timestamp: DateTime<Utc>,
    },
    ConflictDetected {
        session_id: String,
        conflict: FileConflict,
        timestamp: DateTime<Utc>,
    },
}

impl CollaborationEvent {
    pub fn session_id(&self) -> &str {
        match self {
            CollaborationEvent::TaskClaimed { session_id, .. }
            | CollaborationEvent::TaskCompleted { session_id, .. }
            | CollaborationEvent::SessionPaused { session_id, .. }
            | CollaborationEvent::SessionResumed { session_id, .. }
            | CollaborationEvent::ConflictDetected { session_id, .. } => session_id,
        }
    }
}

/// The `{success, data?, error?}` return shape used by every core operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(err: &crate::CoordinationError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorBody::from(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ids_are_prefixed_and_unique() {
        let a = fresh_id("task");
        let b = fresh_id("task");
        assert!(a.starts_with("task_"));
        assert_ne!(a, b);
    }

    #[test]
    fn agent_wire_names() {
        assert_eq!(
            serde_json::to_string(&AgentId::Planner).unwrap(),
            "\"claude-code\""
        );
        assert_eq!(
            serde_json::to_string(&AgentId::Executor).unwrap(),
            "\"github-copilot\""
        );
        assert_eq!("planner".parse::<AgentId>().unwrap(), AgentId::Planner);
        assert_eq!(
            "github-copilot".parse::<AgentId>().unwrap(),
            AgentId::Executor
        );
        assert!("gpt-5".parse::<AgentId>().is_err());
    }

    #[test]
    fn task_status_wire_tags_are_kebab_case() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"in-progress\""
        );
        assert_eq!(
            serde_json::to_string(&TaskStatus::HandedOff).unwrap(),
            "\"handed-off\""
        );
    }

    #[test]
    fn priority_ranking_puts_urgent_above_high() {
        assert!(Priority::Urgent.rank() > Priority::High.rank());
        assert!(Priority::High.rank() > Priority::Medium.rank());
        assert!(Priority::Medium.rank() > Priority::Low.rank());
    }

    #[test]
    fn unknown_task_type_gets_default_capability() {
        let parsed: TaskType = serde_json::from_str("\"paint-shed\"").unwrap();
        assert_eq!(parsed, TaskType::Unknown);
        assert_eq!(
            parsed.required_capabilities(),
            &["typescript-development"]
        );
    }

    #[test]
    fn capability_matching_is_set_intersection() {
        let caps = vec!["testing".to_string(), "code-review".to_string()];
        assert!(TaskType::WriteTests.matches_capabilities(&caps));
        assert!(TaskType::ReviewCode.matches_capabilities(&caps));
        assert!(!TaskType::UpdateDocs.matches_capabilities(&caps));
        assert!(!TaskType::WriteTests.matches_capabilities(&[]));
    }

    #[test]
    fn lifecycle_permits_only_listed_transitions() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Claimed));
        assert!(TaskStatus::Claimed.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::HandedOff.can_transition_to(TaskStatus::InProgress));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Queued));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::InProgress));
    }

    #[test]
    fn lock_expiry_boundary_is_inclusive() {
        let now = Utc::now();
        let lock = FileLock {
            path: "/src/app.ts".to_string(),
            owner: AgentId::Planner,
            lock_token: fresh_id("lock"),
            operation: LockOperation::Write,
            acquired_at: now - chrono::Duration::minutes(5),
            expires_at: now,
        };
        assert!(lock.is_expired_at(now));
        assert!(!lock.is_expired_at(now - chrono::Duration::milliseconds(1)));
    }

    #[test]
    fn event_serialization_carries_kebab_case_type_tag() {
        let event = CollaborationEvent::TaskClaimed {
            session_id: "session_1".to_string(),
            task_id: "task_1".to_string(),
            agent: AgentId::Executor,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task-claimed");
        assert_eq!(json["agent"], "github-copilot");
    }

    #[test]
    fn envelope_round_trip() {
        let env = Envelope::ok(42u32);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["data"], 42);
        assert!(json.get("error").is_none());

        let err = crate::CoordinationError::TaskNotFound("task_x".to_string());
        let env: Envelope<u32> = Envelope::err(&err);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "TASK_NOT_FOUND");
        assert_eq!(json["error"]["retryable"], false);
    }
}
