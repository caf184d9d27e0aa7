//! HTTP transport for the task lifecycle engine (§6). This module is the
//! thinnest possible JSON skin over `MissionControl` — every handler below
//! validates its input, calls into exactly one of the core components, and
//! serializes whatever `Task`/`Comment`/`Deliverable`/`ActivityEntry` that
//! component handed back. No lifecycle decision is made here.
//!
//! Layering follows the teacher's `ApiServer`: rate limit -> auth -> trace ->
//! CORS -> routes, built once in `build_router` and served with
//! `axum::serve`.

use crate::app::MissionControl;
use crate::auth::{auth_middleware, create_auth_state};
use crate::config::{ApiConfig, Config};
use crate::dispatcher::{DispatchOutcome, DispatchRequest};
use crate::gateway::circuit_breaker;
use crate::models::{
    AuthorType, Comment, Deliverable, DeliverableType, Priority, Task, TaskPatch, TaskStatus,
};
use crate::rate_limit::{rate_limit_middleware, RateLimitConfig};
use crate::state_machine::TransitionOptions;
use crate::store::{Store, TaskFilter, TaskWrite};
use crate::validation;
use crate::{Result, SpiralError};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::sse::{Event as SseEvent, Sse},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

const SERVICE_NAME: &str = "mission-control";
const SERVICE_VERSION: &str = "0.1.0";

const ROUTE_HEALTH: &str = "/health";
const ROUTE_SYSTEM_HEALTH: &str = "/system/health";
const ROUTE_TASKS: &str = "/tasks";
const ROUTE_TASKS_DISPATCH: &str = "/tasks/dispatch";
const ROUTE_TASKS_CHECK_COMPLETION: &str = "/tasks/check-completion";
const ROUTE_TASKS_RECONCILE: &str = "/tasks/reconcile";
const ROUTE_TASKS_COMMENTS: &str = "/tasks/comments";
const ROUTE_TASK_PLANNING: &str = "/tasks/{task_id}/planning";
const ROUTE_TASK_PLANNING_POLL: &str = "/tasks/{task_id}/planning/poll";
const ROUTE_TASK_PLANNING_ANSWER: &str = "/tasks/{task_id}/planning/answer";
const ROUTE_TASK_PLANNING_APPROVE: &str = "/tasks/{task_id}/planning/approve";
const ROUTE_TASK_ORCHESTRATE: &str = "/tasks/{task_id}/orchestrate";
const ROUTE_TASK_DELIVERABLES: &str = "/tasks/{task_id}/deliverables";
const ROUTE_TASK_DELIVERABLE_BY_ID: &str = "/tasks/{task_id}/deliverables/{deliverable_id}";
const ROUTE_EVENTS_STREAM: &str = "/events/stream";

#[derive(Clone)]
pub struct ApiServer {
    config: ApiConfig,
    app: MissionControl,
}

impl ApiServer {
    pub fn new(config: Config, app: MissionControl) -> Result<Self> {
        Ok(Self {
            config: config.api,
            app,
        })
    }

    pub async fn run(&self) -> Result<()> {
        let app = self.build_router();

        let listener = tokio::net::TcpListener::bind(format!("{}:{}", self.config.host, self.config.port))
            .await
            .map_err(|e| SpiralError::Internal(e.into()))?;

        info!("API server listening on {}:{}", self.config.host, self.config.port);

        axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
            .await
            .map_err(|e| SpiralError::Internal(e.into()))?;

        Ok(())
    }

    /// Order matters: rate limit -> auth -> trace -> CORS -> routes, same as
    /// the teacher's layering.
    pub fn build_router(&self) -> Router {
        let auth_state = create_auth_state(self.config.clone());
        let rate_limiter = RateLimitConfig::new();

        let cors_layer = CorsLayer::new()
            .allow_origin(
                self.config
                    .allowed_origins
                    .iter()
                    .filter_map(|origin| origin.parse().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::PATCH,
                axum::http::Method::DELETE,
            ])
            .allow_headers([
                axum::http::header::CONTENT_TYPE,
                axum::http::header::AUTHORIZATION,
                axum::http::HeaderName::from_static("x-api-key"),
            ])
            .max_age(std::time::Duration::from_secs(3600));

        Router::new()
            .route(ROUTE_HEALTH, get(health_check))
            .route(ROUTE_SYSTEM_HEALTH, get(system_health))
            .route(ROUTE_TASKS, get(list_tasks).post(create_task).patch(patch_task).delete(delete_task))
            .route(ROUTE_TASKS_DISPATCH, post(dispatch_task))
            .route(ROUTE_TASKS_CHECK_COMPLETION, get(check_completion))
            .route(ROUTE_TASKS_RECONCILE, post(force_reconcile))
            .route(ROUTE_TASKS_COMMENTS, get(list_comments).post(add_comment))
            .route(
                ROUTE_TASK_PLANNING,
                post(start_planning).get(get_planning).delete(cancel_planning),
            )
            .route(ROUTE_TASK_PLANNING_POLL, get(poll_planning))
            .route(ROUTE_TASK_PLANNING_ANSWER, post(answer_planning))
            .route(ROUTE_TASK_PLANNING_APPROVE, post(approve_planning))
            .route(ROUTE_TASK_ORCHESTRATE, post(trigger_orchestrate))
            .route(
                ROUTE_TASK_DELIVERABLES,
                get(list_deliverables).post(add_deliverable),
            )
            .route(ROUTE_TASK_DELIVERABLE_BY_ID, delete(delete_deliverable))
            .route(ROUTE_EVENTS_STREAM, get(events_stream))
            .layer(
                ServiceBuilder::new()
                    .layer(middleware::from_fn_with_state(rate_limiter, rate_limit_middleware))
                    .layer(middleware::from_fn_with_state(auth_state, auth_middleware))
                    .layer(TraceLayer::new_for_http())
                    .layer(cors_layer),
            )
            .with_state(self.app.clone())
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    service: &'static str,
    version: &'static str,
    status: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        service: SERVICE_NAME,
        version: SERVICE_VERSION,
        status: "ok",
    })
}

/// System health status, same three levels the teacher's `SystemMonitor`
/// reports, minus the OS resource tiers this domain has no analogue for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
struct SystemHealthResponse {
    status: HealthStatus,
    task_count: usize,
    active_task_count: usize,
    active_monitor_count: usize,
    circuit_breaker: Option<circuit_breaker::CircuitBreakerMetrics>,
}

async fn system_health(State(app): State<MissionControl>) -> Result<Json<SystemHealthResponse>> {
    let tasks = app.store.list_tasks(TaskFilter::default()).await?;
    let active_task_count = tasks.iter().filter(|t| t.status.is_active()).count();
    let active_monitor_count = app.monitors.get_active_monitors().await.len();
    let circuit_breaker = app.gateway.circuit_breaker_metrics().await;

    let status = match circuit_breaker.as_ref().map(|m| m.state) {
        Some(circuit_breaker::CircuitState::Open) => HealthStatus::Unhealthy,
        Some(circuit_breaker::CircuitState::HalfOpen) => HealthStatus::Degraded,
        _ => HealthStatus::Healthy,
    };

    Ok(Json(SystemHealthResponse {
        status,
        task_count: tasks.len(),
        active_task_count,
        active_monitor_count,
        circuit_breaker,
    }))
}

// ---------------------------------------------------------------------
// Tasks: create / list / patch / delete
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    title: String,
    description: Option<String>,
    priority: Option<Priority>,
    assigned_agent_id: Option<String>,
}

async fn create_task(
    State(app): State<MissionControl>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<Json<Task>> {
    let title = validation::validator().validate_title(&req.title)?;
    let description = req
        .description
        .as_deref()
        .map(|d| validation::validator().validate_content(d))
        .transpose()?;

    let mut task = Task::new(title, description, req.priority.unwrap_or_default());
    task.assigned_agent_id = req.assigned_agent_id;
    let task = app.store.create_task(task).await?;

    app.events.publish(crate::events::Event::new(
        crate::events::EventKind::TaskCreated,
        serde_json::json!({ "taskId": task.id }),
    ));

    Ok(Json(task))
}

/// `mission_id` is accepted per spec.md:242's `GET /tasks?status=&mission_id=&agent=`
/// but is not a filterable dimension: §3's Data Model defines no Mission entity
/// (missions appear only as a table name in the persisted-state layout, §6), and
/// no endpoint ever assigns a task to one. Accepted-but-inert rather than
/// rejected, so existing UI query strings don't 400; see DESIGN.md's Open
/// Question decisions for the rationale.
#[derive(Debug, Deserialize)]
struct ListTasksQuery {
    status: Option<TaskStatus>,
    agent: Option<String>,
    mission_id: Option<String>,
}

async fn list_tasks(
    State(app): State<MissionControl>,
    Query(params): Query<ListTasksQuery>,
) -> Result<Json<Vec<Task>>> {
    if params.mission_id.is_some() {
        tracing::debug!("mission_id query param accepted but not filterable; no Mission entity in the data model");
    }
    let tasks = app
        .store
        .list_tasks(TaskFilter {
            status: params.status,
            agent: params.agent,
        })
        .await?;
    Ok(Json(tasks))
}

#[derive(Debug, Deserialize)]
struct PatchTaskRequest {
    id: String,
    title: Option<String>,
    #[serde(default, deserialize_with = "deserialize_some")]
    description: Option<Option<String>>,
    priority: Option<Priority>,
    status: Option<TaskStatus>,
    assigned_agent_id: Option<String>,
    sort_order: Option<i64>,
}

/// Distinguishes "field omitted" from "field explicitly set to null" for
/// `Option<Option<T>>` request fields, the same ambiguity `TaskPatch` itself
/// resolves by wrapping nullable fields twice.
fn deserialize_some<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

/// `PATCH /tasks`: ordinary field updates go straight to the store; a
/// `status` field is routed through the state machine so it gets its
/// guard check and paired activity entry (§4.4) rather than bypassing C4.
async fn patch_task(
    State(app): State<MissionControl>,
    Json(req): Json<PatchTaskRequest>,
) -> Result<Json<Task>> {
    let title = req.title.map(|t| validation::validator().validate_title(&t)).transpose()?;
    let description = match req.description {
        Some(Some(d)) => Some(Some(validation::validator().validate_content(&d)?)),
        Some(None) => Some(None),
        None => None,
    };

    let patch = TaskPatch {
        title,
        description,
        priority: req.priority,
        assigned_agent_id: req.assigned_agent_id.map(Some),
        sort_order: req.sort_order,
        ..Default::default()
    };

    if let Some(status) = req.status {
        let result = app
            .state_machine
            .transition(
                &req.id,
                status,
                TransitionOptions::new("api", "PATCH /tasks").with_patch(patch),
            )
            .await?;
        if result.blocked == Some(crate::state_machine::Blocked::TaskNotFound) {
            return Err(SpiralError::NotFound(format!("task {}", req.id)));
        }
        if !result.ok {
            return Err(SpiralError::Conflict("invalid status transition".into()));
        }
        return Ok(Json(result.task.expect("ok transition carries a task")));
    }

    let task_id = req.id.clone();
    let committed = app
        .store
        .transaction(
            &task_id,
            Box::new(move |_current: &Task| {
                Ok(TaskWrite {
                    patch,
                    new_status: None,
                    activity: None,
                })
            }),
        )
        .await?
        .ok_or_else(|| SpiralError::NotFound(format!("task {task_id}")))?;

    app.events.publish(crate::events::Event::new(
        crate::events::EventKind::TaskUpdated,
        serde_json::json!({ "taskId": committed.id }),
    ));

    Ok(Json(committed))
}

#[derive(Debug, Deserialize)]
struct DeleteTaskQuery {
    id: String,
}

async fn delete_task(
    State(app): State<MissionControl>,
    Query(params): Query<DeleteTaskQuery>,
) -> Result<StatusCode> {
    app.store.delete_task(&params.id).await?;
    app.events.publish(crate::events::Event::new(
        crate::events::EventKind::TaskDeleted,
        serde_json::json!({ "taskId": params.id }),
    ));
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DispatchTaskRequest {
    #[serde(alias = "taskId")]
    task_id: String,
    #[serde(alias = "agentId")]
    agent_id: String,
    feedback: Option<String>,
    model: Option<String>,
    provider: Option<String>,
}

#[derive(Debug, Serialize)]
struct DispatchedResponse {
    status: &'static str,
    task: Task,
}

#[derive(Debug, Serialize)]
struct DedupedResponse {
    deduped: bool,
    reason: Option<&'static str>,
    #[serde(rename = "dispatchId")]
    dispatch_id: Option<String>,
}

/// `POST /tasks/dispatch` (§4.6, §6). `202` on a freshly sent dispatch,
/// `200 {deduped:true}` on a dedupe or a lost concurrent-claim race (both
/// are idempotent successes from the caller's point of view), `502` when
/// the gateway rejected the send.
async fn dispatch_task(
    State(app): State<MissionControl>,
    Json(req): Json<DispatchTaskRequest>,
) -> Result<axum::response::Response> {
    let outcome = app
        .dispatcher
        .dispatch(DispatchRequest {
            task_id: req.task_id,
            agent_id: req.agent_id,
            feedback: req.feedback,
            model: req.model,
            provider: req.provider,
        })
        .await?;

    Ok(match outcome {
        DispatchOutcome::Dispatched(task) => {
            (StatusCode::ACCEPTED, Json(DispatchedResponse { status: "dispatched", task })).into_response()
        }
        DispatchOutcome::Deduped { reason, dispatch_id } => (
            StatusCode::OK,
            Json(DedupedResponse {
                deduped: true,
                reason: Some(reason.as_str()),
                dispatch_id,
            }),
        )
            .into_response(),
        DispatchOutcome::ConcurrentRace { dispatch_id } => (
            StatusCode::OK,
            Json(DedupedResponse {
                deduped: true,
                reason: None,
                dispatch_id,
            }),
        )
            .into_response(),
    })
}

// ---------------------------------------------------------------------
// Completion sweep / reconciliation
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct CheckCompletionResponse {
    checked: usize,
    completed: Vec<String>,
}

/// `GET /tasks/check-completion` (§6): runs the Reconciler, then polls each
/// active task's session once, applying the Completion Gate (§4.9's "before
/// the external completion-check endpoint").
async fn check_completion(State(app): State<MissionControl>) -> Result<Json<CheckCompletionResponse>> {
    app.reconciler.reconcile().await?;

    let assigned = app
        .store
        .list_tasks(TaskFilter { status: Some(TaskStatus::Assigned), agent: None })
        .await?;
    let in_progress = app
        .store
        .list_tasks(TaskFilter { status: Some(TaskStatus::InProgress), agent: None })
        .await?;
    let testing = app
        .store
        .list_tasks(TaskFilter { status: Some(TaskStatus::Testing), agent: None })
        .await?;

    let mut checked = 0;
    let mut completed = Vec::new();
    for task in assigned.into_iter().chain(in_progress).chain(testing) {
        checked += 1;
        if app.monitors.check_once(&task.id).await.unwrap_or(false) {
            completed.push(task.id);
        }
    }

    Ok(Json(CheckCompletionResponse { checked, completed }))
}

#[derive(Debug, Serialize)]
struct ReconcileResponse {
    checked: usize,
    reconciled: Vec<String>,
}

async fn force_reconcile(State(app): State<MissionControl>) -> Result<Json<ReconcileResponse>> {
    let report = app.reconciler.reconcile().await?;
    Ok(Json(ReconcileResponse {
        checked: report.checked,
        reconciled: report.reconciled,
    }))
}

// ---------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------

async fn start_planning(
    State(app): State<MissionControl>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>> {
    Ok(Json(app.planning.start(&task_id).await?))
}

async fn get_planning(
    State(app): State<MissionControl>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>> {
    let task = app
        .store
        .get_task(&task_id)
        .await?
        .ok_or_else(|| SpiralError::NotFound(format!("task {task_id}")))?;
    Ok(Json(task))
}

async fn poll_planning(
    State(app): State<MissionControl>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>> {
    Ok(Json(app.planning.poll(&task_id).await?))
}

#[derive(Debug, Deserialize)]
struct AnswerPlanningRequest {
    answer: String,
    #[serde(rename = "otherText")]
    other_text: Option<String>,
}

async fn answer_planning(
    State(app): State<MissionControl>,
    Path(task_id): Path<String>,
    Json(req): Json<AnswerPlanningRequest>,
) -> Result<Json<Task>> {
    Ok(Json(
        app.planning.answer(&task_id, &req.answer, req.other_text.as_deref()).await?,
    ))
}

async fn approve_planning(
    State(app): State<MissionControl>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>> {
    Ok(Json(app.planning.approve(&task_id).await?))
}

async fn cancel_planning(
    State(app): State<MissionControl>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>> {
    Ok(Json(app.planning.cancel(&task_id).await?))
}

// ---------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct OrchestrateRequest {
    phase: String,
}

async fn trigger_orchestrate(
    State(app): State<MissionControl>,
    Path(task_id): Path<String>,
    Json(req): Json<OrchestrateRequest>,
) -> Result<StatusCode> {
    let settings = app.store.get_workflow_settings().await?;
    if settings.orchestrator_agent_id.is_none() {
        return Err(SpiralError::InvalidRequest("orchestrator is not configured".into()));
    }

    match req.phase.as_str() {
        "after_planning" => app.orchestrator.after_planning(&task_id).await?,
        "after_completion" => app.orchestrator.after_completion(&task_id).await?,
        "after_testing" => app.orchestrator.after_testing(&task_id).await?,
        other => return Err(SpiralError::InvalidRequest(format!("unknown phase: {other}"))),
    }

    Ok(StatusCode::ACCEPTED)
}

// ---------------------------------------------------------------------
// Deliverables
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AddDeliverableRequest {
    deliverable_type: DeliverableType,
    title: String,
    path: Option<String>,
    description: Option<String>,
}

async fn list_deliverables(
    State(app): State<MissionControl>,
    Path(task_id): Path<String>,
) -> Result<Json<Vec<Deliverable>>> {
    Ok(Json(app.store.list_deliverables(&task_id).await?))
}

async fn add_deliverable(
    State(app): State<MissionControl>,
    Path(task_id): Path<String>,
    Json(req): Json<AddDeliverableRequest>,
) -> Result<Json<Deliverable>> {
    let title = validation::validator().validate_title(&req.title)?;
    let description = req
        .description
        .as_deref()
        .map(|d| validation::validator().validate_content(d))
        .transpose()?;

    let deliverable = Deliverable::new(task_id.clone(), req.deliverable_type, title, req.path, description);
    let deliverable = app.store.add_deliverable(deliverable).await?;

    app.events.publish(crate::events::Event::new(
        crate::events::EventKind::DeliverableAdded,
        serde_json::json!({ "taskId": task_id, "deliverableId": deliverable.id }),
    ));

    Ok(Json(deliverable))
}

async fn delete_deliverable(
    State(app): State<MissionControl>,
    Path((task_id, deliverable_id)): Path<(String, String)>,
) -> Result<StatusCode> {
    app.store.delete_deliverable(&task_id, &deliverable_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------
// Comments
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AddCommentRequest {
    #[serde(alias = "taskId")]
    task_id: String,
    content: String,
}

async fn add_comment(
    State(app): State<MissionControl>,
    Json(req): Json<AddCommentRequest>,
) -> Result<Json<Comment>> {
    let content = validation::validator().validate_content(&req.content)?;
    let comment = Comment::new(req.task_id, AuthorType::User, None, content);
    Ok(Json(app.store.add_comment(comment).await?))
}

#[derive(Debug, Deserialize)]
struct ListCommentsQuery {
    #[serde(alias = "taskId")]
    task_id: String,
}

async fn list_comments(
    State(app): State<MissionControl>,
    Query(params): Query<ListCommentsQuery>,
) -> Result<Json<Vec<Comment>>> {
    Ok(Json(app.store.list_comments(&params.task_id).await?))
}

// ---------------------------------------------------------------------
// Event stream
// ---------------------------------------------------------------------

/// `GET /events/stream` (§6): SSE fan-out of the Event Bus (C2). Each
/// subscriber gets its own `broadcast::Receiver`; a subscriber that falls
/// behind sees gaps rather than stalling publication (§4.2's lossy policy) —
/// `Lagged` errors are simply skipped over here rather than closing the
/// stream, since SSE reconnects are cheap and a dropped event is already
/// unrecoverable by the time the client would notice.
async fn events_stream(
    State(app): State<MissionControl>,
) -> Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>> {
    let stream = BroadcastStream::new(app.events.subscribe()).filter_map(|item| async move {
        let event = item.ok()?;
        let data = serde_json::to_string(&event).unwrap_or_default();
        Some(Ok(SseEvent::default().event(format!("{:?}", event.kind)).data(data)))
    });
    Sse::new(stream)
}

#[cfg(test)]
mod tests;
