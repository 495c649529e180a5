//! Cross-component scenarios exercising the full coordination flow.

use super::test_helpers::{success_result, wired_core, wired_core_with_lock_ttl};
use crate::{
    locks::FileAccessRequest,
    models::{
        AgentId, CollaborationEvent, ConversationContext, LockOperation, Message, MessageRole,
        Priority, SessionMode, Task, TaskStatus, TaskType,
    },
    session::StartCollaboration,
    store::StateStore,
    CoordinationError,
};
use std::time::Duration;
use tokio_stream::StreamExt;

fn start(task: &str, mode: SessionMode) -> StartCollaboration {
    StartCollaboration {
        task: task.to_string(),
        mode,
        preferred_lead: None,
        context_id: None,
        seed_demo_tasks: false,
    }
}

#[tokio::test]
async fn claim_race_produces_exactly_one_winner() {
    let core = wired_core();
    let task = core
        .queue
        .enqueue(Task::new(
            "session_race",
            TaskType::ImplementFeature,
            "contended work",
            Priority::High,
        ))
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        core.queue.claim_task(&task.id, AgentId::Executor),
        core.queue.claim_task(&task.id, AgentId::Executor),
    );

    let mut successes = 0;
    for outcome in [&a, &b] {
        match outcome {
            Ok(claimed) => {
                successes += 1;
                assert_eq!(claimed.status, TaskStatus::Claimed);
            }
            Err(err) => {
                assert!(matches!(err, CoordinationError::TaskAlreadyClaimed { .. }));
            }
        }
    }
    assert_eq!(successes, 1);
}

#[tokio::test]
async fn priority_fifo_drains_in_order() {
    let core = wired_core();
    let caps = vec!["typescript-development".to_string()];

    let a = core
        .queue
        .enqueue(Task::new("s", TaskType::ImplementFeature, "A", Priority::Low))
        .await
        .unwrap();
    let b = core
        .queue
        .enqueue(Task::new("s", TaskType::ImplementFeature, "B", Priority::High))
        .await
        .unwrap();
    let c = core
        .queue
        .enqueue(Task::new("s", TaskType::ImplementFeature, "C", Priority::Medium))
        .await
        .unwrap();
    let d = core
        .queue
        .enqueue(Task::new("s", TaskType::ImplementFeature, "D", Priority::High))
        .await
        .unwrap();

    let mut claimed_order = Vec::new();
    for _ in 0..4 {
        let available = core.queue.get_available_tasks(&caps).await.unwrap();
        let next = available.first().expect("queue should not be empty yet");
        core.queue
            .claim_task(&next.id, AgentId::Executor)
            .await
            .unwrap();
        claimed_order.push(next.id.clone());
    }

    assert_eq!(claimed_order, vec![b.id, d.id, c.id, a.id]);
    assert!(core.queue.get_available_tasks(&caps).await.unwrap().is_empty());
}

#[tokio::test]
async fn lock_expiry_timeline() {
    let core = wired_core_with_lock_ttl(Duration::from_millis(100));

    // t=0: the planner takes the write lock
    core.locks
        .request_file_access("/shared/config.ts", LockOperation::Write, AgentId::Planner)
        .await
        .unwrap();

    // t=50ms: still held
    tokio::time::sleep(Duration::from_millis(50)).await;
    let err = core
        .locks
        .request_file_access("/shared/config.ts", LockOperation::Write, AgentId::Executor)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoordinationError::FileAlreadyLocked { locked_by: AgentId::Planner, .. }
    ));

    // t=150ms: expired and acquirable
    tokio::time::sleep(Duration::from_millis(100)).await;
    let grant = core
        .locks
        .request_file_access("/shared/config.ts", LockOperation::Write, AgentId::Executor)
        .await
        .unwrap();
    assert_eq!(grant.agent, AgentId::Executor);
}

#[tokio::test]
async fn batch_rollback_leaves_no_partial_state() {
    let core = wired_core();

    // /b is write-held by the planner before the batch arrives
    core.locks
        .request_file_access("/b", LockOperation::Write, AgentId::Planner)
        .await
        .unwrap();

    let batch: Vec<FileAccessRequest> = ["/a", "/b", "/c"]
        .iter()
        .map(|path| FileAccessRequest {
            path: path.to_string(),
            operation: LockOperation::Write,
            agent: AgentId::Executor,
        })
        .collect();

    let err = core.locks.request_batch_file_access(&batch).await.unwrap_err();
    match err {
        CoordinationError::PartialGrant { conflicts } => {
            assert_eq!(conflicts.len(), 1);
            assert_eq!(conflicts[0].path, "/b");
        }
        other => panic!("expected PartialGrant, got {other:?}"),
    }

    assert!(core.store.is_locked("/a").await.unwrap().is_none());
    assert!(core.store.is_locked("/c").await.unwrap().is_none());
    assert!(core.store.is_locked("/b").await.unwrap().is_some());
}

#[tokio::test]
async fn session_lifecycle_streams_events_until_cancel() {
    let core = wired_core();
    let session = core
        .sessions
        .start_collaboration(start("Build X", SessionMode::OrchestratorWorker))
        .await
        .unwrap();

    let tasks = core.store.get_session_tasks(&session.id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Queued);

    let mut stream = core.sessions.subscribe_to_updates(&session.id).await.unwrap();

    core.queue
        .claim_task(&tasks[0].id, AgentId::Planner)
        .await
        .unwrap();
    match stream.next().await.unwrap() {
        CollaborationEvent::TaskClaimed { task_id, agent, .. } => {
            assert_eq!(task_id, tasks[0].id);
            assert_eq!(agent, AgentId::Planner);
        }
        other => panic!("expected task-claimed, got {other:?}"),
    }

    core.queue
        .complete_task(&tasks[0].id, AgentId::Planner, success_result("done"))
        .await
        .unwrap();
    match stream.next().await.unwrap() {
        CollaborationEvent::TaskCompleted { success, .. } => assert!(success),
        other => panic!("expected task-completed, got {other:?}"),
    }

    core.sessions.pause(&session.id).await.unwrap();
    match stream.next().await.unwrap() {
        CollaborationEvent::SessionPaused { session_id, .. } => {
            assert_eq!(session_id, session.id);
        }
        other => panic!("expected session-paused, got {other:?}"),
    }

    core.sessions.cancel(&session.id).await.unwrap();
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn context_append_preserves_message_order() {
    let core = wired_core();
    core.store
        .save_context(ConversationContext::new("context_seq"))
        .await
        .unwrap();

    let m1 = Message::new(MessageRole::Planner, "first");
    let m2 = Message::new(MessageRole::Executor, "second");
    core.store.append_message("context_seq", m1).await.unwrap();
    core.store.append_message("context_seq", m2).await.unwrap();

    let context = core.store.load_context("context_seq").await.unwrap().unwrap();
    assert_eq!(context.messages.len(), 2);
    assert_eq!(context.messages[0].content, "first");
    assert_eq!(context.messages[1].content, "second");
}

#[tokio::test]
async fn completion_after_cancel_is_still_accepted() {
    let core = wired_core();
    let session = core
        .sessions
        .start_collaboration(start("Build X", SessionMode::OrchestratorWorker))
        .await
        .unwrap();
    let tasks = core.store.get_session_tasks(&session.id).await.unwrap();
    core.queue
        .claim_task(&tasks[0].id, AgentId::Planner)
        .await
        .unwrap();

    core.sessions.cancel(&session.id).await.unwrap();

    // Cancel does not preempt running work; the result lands normally
    let done = core
        .queue
        .complete_task(&tasks[0].id, AgentId::Planner, success_result("late result"))
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
}

#[tokio::test]
async fn handoff_moves_work_between_agents_end_to_end() {
    let core = wired_core();
    let session = core
        .sessions
        .start_collaboration(start("Build the sync engine", SessionMode::PeerToPeer))
        .await
        .unwrap();

    let tasks = core.store.get_session_tasks(&session.id).await.unwrap();
    let contract = tasks
        .iter()
        .find(|t| t.task_type == TaskType::DefineContract)
        .unwrap();

    core.queue
        .claim_task(&contract.id, AgentId::Planner)
        .await
        .unwrap();
    let handoff = core
        .queue
        .request_handoff(
            crate::queue::HandoffRequest {
                task_id: contract.id.clone(),
                to_agent: AgentId::Executor,
                reason: "executor should finalize the stubs".to_string(),
                current_state: "contract drafted".to_string(),
                next_steps: vec!["generate stubs".to_string()],
            },
            AgentId::Planner,
        )
        .await
        .unwrap();

    let accepted = core
        .queue
        .accept_handoff(&handoff.id, AgentId::Executor)
        .await
        .unwrap();
    assert_eq!(accepted.status, TaskStatus::InProgress);
    assert_eq!(accepted.assigned_to, Some(AgentId::Executor));

    let done = core
        .queue
        .complete_task(&contract.id, AgentId::Executor, success_result("stubs out"))
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
}

#[tokio::test]
async fn executor_full_loop_through_the_tool_surface() {
    let core = wired_core();
    let session = core
        .sessions
        .start_collaboration(start("Ship the importer", SessionMode::Parallel))
        .await
        .unwrap();

    let call = |name: &str, arguments: serde_json::Value| crate::tools::ToolCall {
        name: name.to_string(),
        arguments,
    };
    let envelope = |response: &crate::tools::ToolResponse| -> serde_json::Value {
        serde_json::from_str(&response.content[0].text).unwrap()
    };

    let response = core
        .tools
        .dispatch(call(
            "checkForTasks",
            serde_json::json!({
                "agentId": "github-copilot",
                "capabilities": ["typescript-development"]
            }),
        ))
        .await;
    assert!(!response.is_error);
    let body = envelope(&response);
    let task_id = body["data"]["tasks"][0]["id"].as_str().unwrap().to_string();

    let response = core
        .tools
        .dispatch(call(
            "claimTask",
            serde_json::json!({ "taskId": task_id, "agentId": "github-copilot" }),
        ))
        .await;
    assert!(!response.is_error);

    let response = core
        .tools
        .dispatch(call(
            "requestFileAccess",
            serde_json::json!({
                "path": "/src/importer.ts",
                "operation": "write",
                "agentId": "github-copilot"
            }),
        ))
        .await;
    assert!(!response.is_error);
    let token = envelope(&response)["data"]["lock_token"]
        .as_str()
        .unwrap()
        .to_string();

    let response = core
        .tools
        .dispatch(call(
            "submitTaskResult",
            serde_json::json!({
                "taskId": task_id,
                "agentId": "github-copilot",
                "success": true,
                "output": "importer shipped",
                "filesModified": ["/src/importer.ts"]
            }),
        ))
        .await;
    assert!(!response.is_error);

    let response = core
        .tools
        .dispatch(call(
            "releaseFileAccess",
            serde_json::json!({ "lockToken": token, "agentId": "github-copilot" }),
        ))
        .await;
    assert!(!response.is_error);

    let response = core
        .tools
        .dispatch(call(
            "getCollaborationStatus",
            serde_json::json!({ "sessionId": session.id }),
        ))
        .await;
    assert!(!response.is_error);
    let body = envelope(&response);
    assert_eq!(body["data"]["progress"]["completed"], 1);
    assert_eq!(body["data"]["progress"]["percent"], 100);
    assert_eq!(body["data"]["locks"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn all_listed_locks_are_valid() {
    let core = wired_core_with_lock_ttl(Duration::from_millis(60));
    core.locks
        .request_file_access("/a", LockOperation::Write, AgentId::Planner)
        .await
        .unwrap();
    core.locks
        .request_file_access("/b", LockOperation::Write, AgentId::Executor)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    // Sweep-then-list: expired locks never surface
    assert!(core.store.get_all_locks().await.unwrap().is_empty());
}

#[tokio::test]
async fn release_all_frees_an_agents_paths_for_others() {
    let core = wired_core();
    for path in ["/x", "/y"] {
        core.locks
            .request_file_access(path, LockOperation::Write, AgentId::Executor)
            .await
            .unwrap();
    }

    let released = core
        .locks
        .release_all_for_agent(AgentId::Executor)
        .await
        .unwrap();
    assert_eq!(released, 2);

    core.locks
        .request_file_access("/x", LockOperation::Write, AgentId::Planner)
        .await
        .unwrap();
}
