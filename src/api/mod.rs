//! Operator-facing HTTP surface and the thin transport adapters.
//!
//! Every operation endpoint returns the `{success,data?,error?}` envelope;
//! the envelope body is authoritative and the HTTP status follows it:
//! 200 on success, 400 for caller-side failures (invalid input,
//! contention, not-found on a write), 404 for not-found on a read, 500
//! for transient storage trouble. The WebSocket endpoint and the tool-call
//! routes are framing adapters over the same core operations.

use crate::{
    container::Container,
    models::{
        AgentId, ConflictResolution, ConversationContext, Envelope, Message, MessageRole,
        ResolutionStrategy, TaskErrorInfo, TaskProgress, TaskResult,
    },
    queue::HandoffRequest,
    rate_limit::{rate_limit_middleware, ApiRateLimiter},
    session::StartCollaboration,
    tools::ToolCall,
    CoordinationError, Result,
};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    middleware,
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::{collections::HashMap, sync::Arc};
use tokio_stream::StreamExt;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

#[cfg(test)]
mod tests;

const SERVICE_NAME: &str = "ensemble-core";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

const ROUTE_HEALTH: &str = "/health";
const ROUTE_STATUS: &str = "/status";
const ROUTE_METRICS: &str = "/metrics";
const ROUTE_SESSION_START: &str = "/api/session/start";
const ROUTE_SESSION_PAUSE: &str = "/api/session/{id}/pause";
const ROUTE_SESSION_RESUME: &str = "/api/session/{id}/resume";
const ROUTE_SESSION_CANCEL: &str = "/api/session/{id}/cancel";
const ROUTE_SESSION_STATUS: &str = "/api/session/{id}/status";
const ROUTE_TASK_CLAIM: &str = "/api/task/{id}/claim";
const ROUTE_TASK_PROGRESS: &str = "/api/task/{id}/progress";
const ROUTE_TASK_COMPLETE: &str = "/api/task/{id}/complete";
const ROUTE_TASK_AVAILABLE: &str = "/api/task/available";
const ROUTE_AGENT_REGISTER: &str = "/api/agent/register";
const ROUTE_HANDOFF: &str = "/api/handoff";
const ROUTE_HANDOFF_ACCEPT: &str = "/api/handoff/{id}/accept";
const ROUTE_CONTEXT: &str = "/api/context/{id}";
const ROUTE_CONFLICT_RESOLVE: &str = "/api/conflict/{id}/resolve";
const ROUTE_EVENTS_WS: &str = "/ws";
const ROUTE_TOOLS_CALL: &str = "/tools/call";
const ROUTE_TOOLS_LIST: &str = "/tools/list";

#[derive(Clone)]
pub struct ApiServer {
    container: Arc<Container>,
    rate_limiter: Arc<ApiRateLimiter>,
}

impl ApiServer {
    pub fn new(container: Arc<Container>) -> Self {
        let rate_limiter = Arc::new(ApiRateLimiter::new(&container.config.rate_limit));
        Self {
            container,
            rate_limiter,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let app = self.build_router();
        let addr = format!(
            "{}:{}",
            self.container.config.server.host, self.container.config.server.port
        );
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| CoordinationError::Tool(format!("failed to bind {addr}: {e}")))?;

        info!("coordination server listening on {addr}");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .await
        .map_err(|e| CoordinationError::Tool(format!("server error: {e}")))?;
        Ok(())
    }

    pub fn build_router(&self) -> Router {
        let cors_layer = CorsLayer::new()
            .allow_origin(
                self.container
                    .config
                    .server
                    .allowed_origins
                    .iter()
                    .filter_map(|origin| origin.parse().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::PUT,
            ])
            .allow_headers([
                axum::http::header::CONTENT_TYPE,
                axum::http::HeaderName::from_static("x-agent-id"),
            ]);

        let mut router = Router::new()
            .route(ROUTE_HEALTH, get(health))
            .route(ROUTE_STATUS, get(readiness))
            .route(ROUTE_METRICS, get(metrics))
            .route(ROUTE_SESSION_START, post(start_session))
            .route(ROUTE_SESSION_PAUSE, post(pause_session))
            .route(ROUTE_SESSION_RESUME, post(resume_session))
            .route(ROUTE_SESSION_CANCEL, post(cancel_session))
            .route(ROUTE_SESSION_STATUS, get(session_status))
            .route(ROUTE_TASK_CLAIM, post(claim_task))
            .route(ROUTE_TASK_PROGRESS, post(report_progress))
            .route(ROUTE_TASK_COMPLETE, post(complete_task))
            .route(ROUTE_TASK_AVAILABLE, get(available_tasks))
            .route(ROUTE_AGENT_REGISTER, post(register_agent))
            .route(ROUTE_HANDOFF, post(request_handoff))
            .route(ROUTE_HANDOFF_ACCEPT, post(accept_handoff))
            .route(ROUTE_CONTEXT, get(get_context).put(put_context))
            .route(ROUTE_CONFLICT_RESOLVE, post(resolve_conflict));

        if self.container.config.server.enable_websocket {
            router = router.route(ROUTE_EVENTS_WS, get(ws_events));
        }
        if self.container.config.server.enable_tool_dispatcher {
            router = router
                .route(ROUTE_TOOLS_CALL, post(call_tool))
                .route(ROUTE_TOOLS_LIST, get(list_tools));
        }

        router
            .layer(
                ServiceBuilder::new()
                    .layer(middleware::from_fn_with_state(
                        self.rate_limiter.clone(),
                        rate_limit_middleware,
                    ))
                    .layer(TraceLayer::new_for_http())
                    .layer(cors_layer),
            )
            .with_state(self.container.clone())
    }
}

/// Write-path failure mapping: the envelope body is authoritative, the
/// status code mirrors its kind.
fn respond<T: serde::Serialize>(
    container: &Container,
    result: Result<T>,
) -> (StatusCode, Json<serde_json::Value>) {
    respond_inner(container, result, false)
}

/// Read-path variant: not-found maps to 404 instead of 400.
fn respond_read<T: serde::Serialize>(
    container: &Container,
    result: Result<T>,
) -> (StatusCode, Json<serde_json::Value>) {
    respond_inner(container, result, true)
}

fn respond_inner<T: serde::Serialize>(
    container: &Container,
    result: Result<T>,
    read: bool,
) -> (StatusCode, Json<serde_json::Value>) {
    match result {
        Ok(data) => {
            container.monitor.record_request(false);
            let body = serde_json::to_value(Envelope::ok(data))
                .unwrap_or(serde_json::Value::Null);
            (StatusCode::OK, Json(body))
        }
        Err(err) => {
            container.monitor.record_request(true);
            let status = if matches!(err, CoordinationError::Storage { .. }) {
                StatusCode::INTERNAL_SERVER_ERROR
            } else if read && is_not_found(&err) {
                StatusCode::NOT_FOUND
            } else {
                StatusCode::BAD_REQUEST
            };
            let body = serde_json::to_value(Envelope::<()>::err(&err))
                .unwrap_or(serde_json::Value::Null);
            (status, Json(body))
        }
    }
}

fn is_not_found(err: &CoordinationError) -> bool {
    matches!(
        err,
        CoordinationError::TaskNotFound(_)
            | CoordinationError::ContextNotFound(_)
            | CoordinationError::SessionNotFound(_)
            | CoordinationError::LockNotFound(_)
            | CoordinationError::HandoffNotFound(_)
            | CoordinationError::ConflictNotFound(_)
    )
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
    }))
}

async fn readiness(State(container): State<Arc<Container>>) -> (StatusCode, Json<serde_json::Value>) {
    let ready = container.ready().await;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(serde_json::json!({ "ready": ready })))
}

async fn metrics(State(container): State<Arc<Container>>) -> Json<serde_json::Value> {
    let snapshot = container.metrics().await;
    Json(serde_json::to_value(snapshot).unwrap_or(serde_json::Value::Null))
}

async fn start_session(
    State(container): State<Arc<Container>>,
    Json(request): Json<StartCollaboration>,
) -> (StatusCode, Json<serde_json::Value>) {
    let result = container.sessions.start_collaboration(request).await;
    respond(&container, result)
}

async fn pause_session(
    State(container): State<Arc<Container>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    let result = container.sessions.pause(&id).await;
    respond(&container, result)
}

async fn resume_session(
    State(container): State<Arc<Container>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    let result = container.sessions.resume(&id).await;
    respond(&container, result)
}

async fn cancel_session(
    State(container): State<Arc<Container>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    let result = container.sessions.cancel(&id).await;
    respond(&container, result)
}

async fn session_status(
    State(container): State<Arc<Container>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    let result = container.sessions.get_collaboration_status(&id).await;
    respond_read(&container, result)
}

#[derive(Debug, Deserialize)]
struct AgentBody {
    agent: AgentId,
}

async fn claim_task(
    State(container): State<Arc<Container>>,
    Path(id): Path<String>,
    Json(body): Json<AgentBody>,
) -> (StatusCode, Json<serde_json::Value>) {
    let result = container.queue.claim_task(&id, body.agent).await;
    respond(&container, result)
}

#[derive(Debug, Deserialize)]
struct ProgressBody {
    agent: AgentId,
    #[serde(flatten)]
    progress: TaskProgress,
}

async fn report_progress(
    State(container): State<Arc<Container>>,
    Path(id): Path<String>,
    Json(body): Json<ProgressBody>,
) -> (StatusCode, Json<serde_json::Value>) {
    let result = container
        .queue
        .report_progress(&id, body.agent, &body.progress)
        .await;
    respond(&container, result)
}

#[derive(Debug, Deserialize)]
struct CompleteBody {
    agent: AgentId,
    success: bool,
    output: String,
    #[serde(default)]
    files_modified: Vec<String>,
    #[serde(default)]
    error: Option<TaskErrorInfo>,
}

async fn complete_task(
    State(container): State<Arc<Container>>,
    Path(id): Path<String>,
    Json(body): Json<CompleteBody>,
) -> (StatusCode, Json<serde_json::Value>) {
    let result = container
        .queue
        .complete_task(
            &id,
            body.agent,
            TaskResult {
                success: body.success,
                output: body.output,
                files_modified: body.files_modified,
                error: body.error,
            },
        )
        .await;
    respond(&container, result)
}

#[derive(Debug, Deserialize)]
struct AvailableQuery {
    #[serde(default)]
    capabilities: String,
}

async fn available_tasks(
    State(container): State<Arc<Container>>,
    Query(query): Query<AvailableQuery>,
) -> (StatusCode, Json<serde_json::Value>) {
    let capabilities: Vec<String> = query
        .capabilities
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let result = container.queue.get_available_tasks(&capabilities).await;
    respond_read(&container, result)
}

#[derive(Debug, Deserialize)]
struct RegisterBody {
    agent: AgentId,
    capabilities: Vec<String>,
    #[serde(default = "default_version")]
    version: String,
}

fn default_version() -> String {
    "unversioned".to_string()
}

async fn register_agent(
    State(container): State<Arc<Container>>,
    Json(body): Json<RegisterBody>,
) -> (StatusCode, Json<serde_json::Value>) {
    let result = container
        .queue
        .register_agent(body.agent, body.capabilities, body.version)
        .await;
    respond(&container, result)
}

#[derive(Debug, Deserialize)]
struct HandoffBody {
    from: AgentId,
    #[serde(flatten)]
    request: HandoffRequest,
}

async fn request_handoff(
    State(container): State<Arc<Container>>,
    Json(body): Json<HandoffBody>,
) -> (StatusCode, Json<serde_json::Value>) {
    let result = container.queue.request_handoff(body.request, body.from).await;
    respond(&container, result)
}

async fn accept_handoff(
    State(container): State<Arc<Container>>,
    Path(id): Path<String>,
    Json(body): Json<AgentBody>,
) -> (StatusCode, Json<serde_json::Value>) {
    let result = container.queue.accept_handoff(&id, body.agent).await;
    respond(&container, result)
}

async fn get_context(
    State(container): State<Arc<Container>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    let result = container.store.load_context(&id).await.and_then(|context| {
        context.ok_or_else(|| CoordinationError::ContextNotFound(id.clone()))
    });
    respond_read(&container, result)
}

#[derive(Debug, Deserialize)]
struct AppendMessageBody {
    role: MessageRole,
    content: String,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

/// Replace-or-append body: `append` routes to `append_message`, otherwise
/// the supplied messages and shared state replace the stored context.
#[derive(Debug, Deserialize)]
struct PutContextBody {
    #[serde(default)]
    append: Option<AppendMessageBody>,
    #[serde(default)]
    messages: Option<Vec<Message>>,
    #[serde(default)]
    shared_state: Option<HashMap<String, serde_json::Value>>,
}

async fn put_context(
    State(container): State<Arc<Container>>,
    Path(id): Path<String>,
    Json(body): Json<PutContextBody>,
) -> (StatusCode, Json<serde_json::Value>) {
    let result = if let Some(append) = body.append {
        let mut message = Message::new(append.role, append.content);
        message.metadata = append.metadata;
        container.store.append_message(&id, message).await
    } else {
        let existing = match container.store.load_context(&id).await {
            Ok(existing) => existing,
            Err(err) => return respond::<ConversationContext>(&container, Err(err)),
        };
        let mut context = existing.unwrap_or_else(|| ConversationContext::new(id.clone()));
        if let Some(messages) = body.messages {
            context.messages = messages;
        }
        if let Some(shared_state) = body.shared_state {
            context.shared_state = shared_state;
        }
        container.store.save_context(context).await
    };
    respond(&container, result)
}

#[derive(Debug, Deserialize)]
struct ResolveBody {
    strategy: ResolutionStrategy,
    #[serde(default)]
    final_content: Option<String>,
    resolved_by: AgentId,
}

async fn resolve_conflict(
    State(container): State<Arc<Container>>,
    Path(id): Path<String>,
    Json(body): Json<ResolveBody>,
) -> (StatusCode, Json<serde_json::Value>) {
    let resolution = ConflictResolution {
        strategy: body.strategy,
        final_content: body.final_content,
        resolved_by: body.resolved_by,
        resolved_at: Utc::now(),
    };
    let result = container.sessions.resolve_conflict(&id, resolution).await;
    respond(&container, result)
}

async fn call_tool(
    State(container): State<Arc<Container>>,
    Json(call): Json<ToolCall>,
) -> Json<serde_json::Value> {
    let response = container.tools.dispatch(call).await;
    container.monitor.record_request(response.is_error);
    Json(serde_json::to_value(response).unwrap_or(serde_json::Value::Null))
}

async fn list_tools(State(container): State<Arc<Container>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "tools": container.tools.list_tools() }))
}

#[derive(Debug, Deserialize)]
struct SubscribeMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "sessionId")]
    session_id: String,
}

async fn ws_events(
    ws: WebSocketUpgrade,
    State(container): State<Arc<Container>>,
) -> Response {
    ws.on_upgrade(move |socket| ws_stream(socket, container))
}

/// Event-stream framing: the client opens with
/// `{"type":"subscribe","sessionId":…}` and then receives one JSON event
/// per message until the session terminates or it disconnects.
async fn ws_stream(mut socket: WebSocket, container: Arc<Container>) {
    let subscribe = match socket.recv().await {
        Some(Ok(WsMessage::Text(text))) => {
            match serde_json::from_str::<SubscribeMessage>(&text) {
                Ok(message) if message.kind == "subscribe" => message,
                _ => {
                    let err = CoordinationError::InvalidInput(
                        "expected a subscribe message".to_string(),
                    );
                    send_ws_error(&mut socket, &err).await;
                    return;
                }
            }
        }
        _ => return,
    };

    let mut stream = match container
        .sessions
        .subscribe_to_updates(&subscribe.session_id)
        .await
    {
        Ok(stream) => stream,
        Err(err) => {
            send_ws_error(&mut socket, &err).await;
            return;
        }
    };

    debug!(session_id = %subscribe.session_id, "websocket subscriber attached");
    while let Some(event) = stream.next().await {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to serialize event: {e}");
                continue;
            }
        };
        if socket.send(WsMessage::Text(payload.into())).await.is_err() {
            // Subscriber went away; dropping the stream cancels the
            // subscription.
            return;
        }
    }
    let _ = socket.send(WsMessage::Close(None)).await;
}

async fn send_ws_error(socket: &mut WebSocket, err: &CoordinationError) {
    let envelope: Envelope<()> = Envelope::err(err);
    if let Ok(payload) = serde_json::to_string(&envelope) {
        let _ = socket.send(WsMessage::Text(payload.into())).await;
    }
    let _ = socket.send(WsMessage::Close(None)).await;
}
