//! Executor-facing tool surface.
//!
//! A closed set of six named tools, dispatched over an exhaustive enum.
//! Every response is a single text content item whose body is the JSON
//! `{success, data?, error?}` envelope; transport framing is the adapter's
//! concern. All tools except `getCollaborationStatus` are bound to the
//! executor identity and reject other callers.

use crate::{
    locks::LockRegistry,
    models::{AgentId, Envelope, LockOperation, TaskErrorInfo, TaskResult},
    queue::TaskQueue,
    session::SessionManager,
    CoordinationError, Result,
};
use serde::{Deserialize, Serialize};
use std::{str::FromStr, sync::Arc};
use tracing::debug;

/// The closed tool vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolName {
    CheckForTasks,
    ClaimTask,
    SubmitTaskResult,
    RequestFileAccess,
    ReleaseFileAccess,
    GetCollaborationStatus,
}

impl ToolName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::CheckForTasks => "checkForTasks",
            ToolName::ClaimTask => "claimTask",
            ToolName::SubmitTaskResult => "submitTaskResult",
            ToolName::RequestFileAccess => "requestFileAccess",
            ToolName::ReleaseFileAccess => "releaseFileAccess",
            ToolName::GetCollaborationStatus => "getCollaborationStatus",
        }
    }

    pub const ALL: [ToolName; 6] = [
        ToolName::CheckForTasks,
        ToolName::ClaimTask,
        ToolName::SubmitTaskResult,
        ToolName::RequestFileAccess,
        ToolName::ReleaseFileAccess,
        ToolName::GetCollaborationStatus,
    ];
}

impl FromStr for ToolName {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ToolName::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or(())
    }
}

/// An inbound tool invocation: `{name, arguments}`
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default = "default_arguments")]
    pub arguments: serde_json::Value,
}

fn default_arguments() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub content_type: &'static str,
    pub text: String,
}

/// The response shape handed to the transport adapter
#[derive(Debug, Clone, Serialize)]
pub struct ToolResponse {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError")]
    pub is_error: bool,
}

/// Static description of one tool for `list_tools`
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    #[serde(rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckForTasksInput {
    agent_id: AgentId,
    capabilities: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaimTaskInput {
    task_id: String,
    agent_id: AgentId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitTaskResultInput {
    task_id: String,
    agent_id: AgentId,
    success: bool,
    output: String,
    #[serde(default)]
    files_modified: Vec<String>,
    #[serde(default)]
    error: Option<TaskErrorInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestFileAccessInput {
    path: String,
    operation: LockOperation,
    agent_id: AgentId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReleaseFileAccessInput {
    lock_token: String,
    #[allow(dead_code)]
    agent_id: AgentId,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetCollaborationStatusInput {
    #[serde(default)]
    session_id: Option<String>,
}

pub struct ToolDispatcher {
    queue: Arc<TaskQueue>,
    locks: Arc<LockRegistry>,
    sessions: Arc<SessionManager>,
}

impl ToolDispatcher {
    pub fn new(
        queue: Arc<TaskQueue>,
        locks: Arc<LockRegistry>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            queue,
            locks,
            sessions,
        }
    }

    /// Dispatches one call and wraps the outcome into the tool response.
    /// Never returns an error at this boundary: failures become error
    /// envelopes with `isError` set.
    pub async fn dispatch(&self, call: ToolCall) -> ToolResponse {
        let name = match call.name.parse::<ToolName>() {
            Ok(name) => name,
            Err(()) => {
                return error_response(&CoordinationError::UnknownTool(call.name));
            }
        };
        debug!(tool = name.as_str(), "tool call dispatched");
        match self.execute(name, call.arguments).await {
            Ok(data) => success_response(data),
            Err(err) => error_response(&err),
        }
    }

    async fn execute(&self, name: ToolName, arguments: serde_json::Value) -> Result<serde_json::Value> {
        match name {
            ToolName::CheckForTasks => {
                let input: CheckForTasksInput = parse_arguments(name, arguments)?;
                executor_guard(name, input.agent_id)?;
                let tasks = self.queue.get_available_tasks(&input.capabilities).await?;
                let count = tasks.len();
                Ok(serde_json::json!({
                    "tasks": tasks,
                    "count": count,
                }))
            }
            ToolName::ClaimTask => {
                let input: ClaimTaskInput = parse_arguments(name, arguments)?;
                executor_guard(name, input.agent_id)?;
                let task = self.queue.claim_task(&input.task_id, input.agent_id).await?;
                Ok(serde_json::to_value(task).map_err(to_tool_error)?)
            }
            ToolName::SubmitTaskResult => {
                let input: SubmitTaskResultInput = parse_arguments(name, arguments)?;
                executor_guard(name, input.agent_id)?;
                let result = TaskResult {
                    success: input.success,
                    output: input.output,
                    files_modified: input.files_modified,
                    error: input.error,
                };
                let task = self
                    .queue
                    .complete_task(&input.task_id, input.agent_id, result)
                    .await?;
                Ok(serde_json::to_value(task).map_err(to_tool_error)?)
            }
            ToolName::RequestFileAccess => {
                let input: RequestFileAccessInput = parse_arguments(name, arguments)?;
                executor_guard(name, input.agent_id)?;
                let grant = self
                    .locks
                    .request_file_access(&input.path, input.operation, input.agent_id)
                    .await?;
                Ok(serde_json::to_value(grant).map_err(to_tool_error)?)
            }
            ToolName::ReleaseFileAccess => {
                let input: ReleaseFileAccessInput = parse_arguments(name, arguments)?;
                executor_guard(name, input.agent_id)?;
                self.locks.release_token(&input.lock_token).await?;
                Ok(serde_json::json!({ "released": true }))
            }
            ToolName::GetCollaborationStatus => {
                let input: GetCollaborationStatusInput = parse_arguments(name, arguments)?;
                let session_id = match input.session_id {
                    Some(id) => id,
                    None => self.sessions.single_active_session().await?,
                };
                let status = self.sessions.get_collaboration_status(&session_id).await?;
                Ok(serde_json::to_value(status).map_err(to_tool_error)?)
            }
        }
    }

    /// The static schema table served to `list_tools`.
    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        tool_definitions()
    }
}

fn parse_arguments<T: serde::de::DeserializeOwned>(
    name: ToolName,
    arguments: serde_json::Value,
) -> Result<T> {
    serde_json::from_value(arguments)
        .map_err(|e| CoordinationError::Tool(format!("invalid arguments for {}: {e}", name.as_str())))
}

fn to_tool_error(e: serde_json::Error) -> CoordinationError {
    CoordinationError::Tool(e.to_string())
}

/// Every tool except `getCollaborationStatus` is bound to the executor;
/// other identities are rejected to prevent cross-agent impersonation.
fn executor_guard(name: ToolName, agent: AgentId) -> Result<()> {
    if name != ToolName::GetCollaborationStatus && agent != AgentId::Executor {
        return Err(CoordinationError::InvalidAgent(format!(
            "{} is bound to {}",
            name.as_str(),
            AgentId::Executor
        )));
    }
    Ok(())
}

fn success_response(data: serde_json::Value) -> ToolResponse {
    let envelope = Envelope::ok(data);
    ToolResponse {
        content: vec![ToolContent {
            content_type: "text",
            text: serde_json::to_string(&envelope).unwrap_or_else(|_| "{}".to_string()),
        }],
        is_error: false,
    }
}

fn error_response(err: &CoordinationError) -> ToolResponse {
    let envelope: Envelope<serde_json::Value> = Envelope::err(err);
    ToolResponse {
        content: vec![ToolContent {
            content_type: "text",
            text: serde_json::to_string(&envelope).unwrap_or_else(|_| "{}".to_string()),
        }],
        is_error: true,
    }
}

fn tool_definitions() -> Vec<ToolDefinition> {
    use serde_json::json;
    vec![
        ToolDefinition {
            name: "checkForTasks",
            description: "Poll for queued tasks matching the agent's capabilities",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "agentId": { "type": "string" },
                    "capabilities": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["agentId", "capabilities"]
            }),
        },
        ToolDefinition {
            name: "claimTask",
            description: "Claim a queued task for execution",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "taskId": { "type": "string" },
                    "agentId": { "type": "string" }
                },
                "required": ["taskId", "agentId"]
            }),
        },
        ToolDefinition {
            name: "submitTaskResult",
            description: "Submit the result of a claimed task",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "taskId": { "type": "string" },
                    "agentId": { "type": "string" },
                    "success": { "type": "boolean" },
                    "output": { "type": "string" },
                    "filesModified": { "type": "array", "items": { "type": "string" } },
                    "error": {
                        "type": "object",
                        "properties": {
                            "code": { "type": "string" },
                            "message": { "type": "string" },
                            "retryable": { "type": "boolean" }
                        },
                        "required": ["code", "message", "retryable"]
                    }
                },
                "required": ["taskId", "agentId", "success", "output"]
            }),
        },
        ToolDefinition {
            name: "requestFileAccess",
            description: "Acquire advisory access to a file path",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "operation": { "type": "string", "enum": ["read", "write", "delete"] },
                    "agentId": { "type": "string" }
                },
                "required": ["path", "operation", "agentId"]
            }),
        },
        ToolDefinition {
            name: "releaseFileAccess",
            description: "Release a previously acquired file lock",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "lockToken": { "type": "string" },
                    "agentId": { "type": "string" }
                },
                "required": ["lockToken", "agentId"]
            }),
        },
        ToolDefinition {
            name: "getCollaborationStatus",
            description: "Aggregate status of a collaboration session",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "sessionId": { "type": "string" }
                },
                "required": []
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Priority, SessionMode, Task, TaskType};
    use crate::session::{EventBus, StartCollaboration};
    use crate::store::InMemoryStateStore;
    use serde_json::json;
    use std::time::Duration;

    fn dispatcher() -> (ToolDispatcher, Arc<TaskQueue>, Arc<SessionManager>) {
        let store: Arc<InMemoryStateStore> = Arc::new(InMemoryStateStore::new());
        let events = Arc::new(EventBus::new());
        let locks = Arc::new(LockRegistry::new(
            store.clone(),
            Duration::from_secs(300),
            Duration::from_secs(3600),
        ));
        let queue = Arc::new(TaskQueue::new(store.clone(), events.clone()));
        let sessions = Arc::new(SessionManager::new(store, locks.clone(), events));
        (
            ToolDispatcher::new(queue.clone(), locks, sessions.clone()),
            queue,
            sessions,
        )
    }

    fn envelope_of(response: &ToolResponse) -> serde_json::Value {
        serde_json::from_str(&response.content[0].text).unwrap()
    }

    #[tokio::test]
    async fn unknown_tool_name_errors() {
        let (dispatcher, _, _) = dispatcher();
        let response = dispatcher
            .dispatch(ToolCall {
                name: "launchMissiles".to_string(),
                arguments: json!({}),
            })
            .await;
        assert!(response.is_error);
        let envelope = envelope_of(&response);
        assert_eq!(envelope["success"], false);
        assert_eq!(envelope["error"]["code"], "UNKNOWN_TOOL");
        assert_eq!(envelope["error"]["retryable"], true);
    }

    #[tokio::test]
    async fn executor_guard_rejects_the_planner() {
        let (dispatcher, _, _) = dispatcher();
        let response = dispatcher
            .dispatch(ToolCall {
                name: "checkForTasks".to_string(),
                arguments: json!({
                    "agentId": "claude-code",
                    "capabilities": ["typescript-development"]
                }),
            })
            .await;
        assert!(response.is_error);
        assert_eq!(envelope_of(&response)["error"]["code"], "INVALID_AGENT");
    }

    #[tokio::test]
    async fn check_claim_submit_flow() {
        let (dispatcher, queue, _) = dispatcher();
        queue
            .enqueue(Task::new(
                "session_1",
                TaskType::ImplementFeature,
                "build it",
                Priority::High,
            ))
            .await
            .unwrap();

        let response = dispatcher
            .dispatch(ToolCall {
                name: "checkForTasks".to_string(),
                arguments: json!({
                    "agentId": "github-copilot",
                    "capabilities": ["typescript-development"]
                }),
            })
            .await;
        assert!(!response.is_error);
        let envelope = envelope_of(&response);
        assert_eq!(envelope["data"]["count"], 1);
        let task_id = envelope["data"]["tasks"][0]["id"].as_str().unwrap().to_string();

        let response = dispatcher
            .dispatch(ToolCall {
                name: "claimTask".to_string(),
                arguments: json!({ "taskId": task_id, "agentId": "github-copilot" }),
            })
            .await;
        assert!(!response.is_error);
        assert_eq!(envelope_of(&response)["data"]["status"], "claimed");

        let response = dispatcher
            .dispatch(ToolCall {
                name: "submitTaskResult".to_string(),
                arguments: json!({
                    "taskId": task_id,
                    "agentId": "github-copilot",
                    "success": true,
                    "output": "done",
                    "filesModified": ["/src/a.ts"]
                }),
            })
            .await;
        assert!(!response.is_error);
        assert_eq!(envelope_of(&response)["data"]["status"], "completed");
    }

    #[tokio::test]
    async fn file_access_request_and_release() {
        let (dispatcher, _, _) = dispatcher();
        let response = dispatcher
            .dispatch(ToolCall {
                name: "requestFileAccess".to_string(),
                arguments: json!({
                    "path": "/src/app.ts",
                    "operation": "write",
                    "agentId": "github-copilot"
                }),
            })
            .await;
        assert!(!response.is_error);
        let envelope = envelope_of(&response);
        let token = envelope["data"]["lock_token"].as_str().unwrap().to_string();

        let response = dispatcher
            .dispatch(ToolCall {
                name: "releaseFileAccess".to_string(),
                arguments: json!({ "lockToken": token, "agentId": "github-copilot" }),
            })
            .await;
        assert!(!response.is_error);
        assert_eq!(envelope_of(&response)["data"]["released"], true);
    }

    #[tokio::test]
    async fn status_defaults_to_the_single_active_session() {
        let (dispatcher, _, sessions) = dispatcher();

        // No active session yet
        let response = dispatcher
            .dispatch(ToolCall {
                name: "getCollaborationStatus".to_string(),
                arguments: json!({}),
            })
            .await;
        assert!(response.is_error);

        let session = sessions
            .start_collaboration(StartCollaboration {
                task: "Build X".to_string(),
                mode: SessionMode::OrchestratorWorker,
                preferred_lead: None,
                context_id: None,
                seed_demo_tasks: false,
            })
            .await
            .unwrap();

        let response = dispatcher
            .dispatch(ToolCall {
                name: "getCollaborationStatus".to_string(),
                arguments: json!({}),
            })
            .await;
        assert!(!response.is_error);
        let envelope = envelope_of(&response);
        assert_eq!(envelope["data"]["session"]["id"], session.id.as_str());
        assert_eq!(envelope["data"]["progress"]["percent"], 0);
    }

    #[tokio::test]
    async fn malformed_arguments_surface_a_tool_error() {
        let (dispatcher, _, _) = dispatcher();
        let response = dispatcher
            .dispatch(ToolCall {
                name: "claimTask".to_string(),
                arguments: json!({ "agentId": "github-copilot" }),
            })
            .await;
        assert!(response.is_error);
        assert_eq!(envelope_of(&response)["error"]["code"], "TOOL_ERROR");
    }

    #[test]
    fn exactly_six_tools_are_listed() {
        let definitions = tool_definitions();
        assert_eq!(definitions.len(), 6);
        for definition in &definitions {
            assert_eq!(definition.input_schema["type"], "object");
            assert!(definition.input_schema.get("properties").is_some());
            assert!(definition.input_schema.get("required").is_some());
            assert!(definition.name.parse::<ToolName>().is_ok());
        }
    }
}
