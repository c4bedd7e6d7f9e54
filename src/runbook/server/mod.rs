// SPDX-License-Identifier: MIT

//! HTTP API for the editor, run invocation and approval resume

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::runbook::catalog::ActionCatalog;
use crate::runbook::error::RunbookError;
use crate::runbook::run::{ResumeAction, RunCoordinator, RunSummary};
use crate::runbook::store::Store;
use crate::runbook::workflow::graph::types::{new_id, Graph};
use crate::runbook::workflow::graph::{linearize, reconstruct, validate, validate_macro_refs};
use crate::runbook::workflow::types::{
    normalize_steps, ChainStep, ParamDef, Trigger, WorkflowDef, WorkflowSummary,
};

/// Shared server dependencies
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub catalog: Arc<dyn ActionCatalog>,
    pub coordinator: Arc<RunCoordinator>,
}

type ApiError = (StatusCode, Json<Value>);
type ApiResult = Result<Json<Value>, ApiError>;

pub async fn serve(port: u16, state: AppState) -> Result<(), RunbookError> {
    let app = router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    log::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/actions", get(list_actions))
        .route("/api/actions/{name}", get(get_action))
        .route("/api/workflows", get(list_workflows).post(create_workflow))
        .route(
            "/api/workflows/{id}",
            get(get_workflow).put(update_workflow).delete(delete_workflow),
        )
        .route("/api/workflows/{id}/duplicate", post(duplicate_workflow))
        .route("/api/workflows/{id}/validate", post(validate_workflow))
        .route("/api/workflows/{id}/run", post(run_workflow))
        .route("/api/workflows/{id}/run/stream", post(stream_run))
        .route("/api/runs", get(list_runs))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/resume", post(resume_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_error(err: RunbookError) -> ApiError {
    let status = match &err {
        RunbookError::WorkflowNotFound(_) | RunbookError::RunNotFound(_) => StatusCode::NOT_FOUND,
        RunbookError::Conflict(_) => StatusCode::CONFLICT,
        RunbookError::MissingParameter(_) | RunbookError::InvalidParameter { .. } => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": err.to_string()})))
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_actions(State(state): State<AppState>) -> Json<Value> {
    let specs: Vec<Value> = state
        .catalog
        .names()
        .into_iter()
        .filter_map(|name| state.catalog.get(&name))
        .map(|spec| json!(spec))
        .collect();
    Json(json!(specs))
}

async fn get_action(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    match state.catalog.get(&name) {
        Some(spec) => Ok(Json(json!(spec))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("Action '{}' not found", name)})),
        )),
    }
}

async fn list_workflows(State(state): State<AppState>) -> ApiResult {
    let summaries: Vec<WorkflowSummary> = state.store.list_workflows().map_err(api_error)?;
    Ok(Json(json!(summaries)))
}

/// Save payload: either an authoring graph (validated and linearized
/// server-side) or a hand-authored step list.
#[derive(Deserialize)]
struct SaveWorkflowRequest {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    trigger: Trigger,
    #[serde(default)]
    graph: Option<Graph>,
    #[serde(default)]
    steps: Option<Vec<ChainStep>>,
    #[serde(default)]
    parameters: Vec<ParamDef>,
}

fn build_definition(
    id: String,
    created_at: Option<String>,
    body: SaveWorkflowRequest,
    state: &AppState,
) -> Result<WorkflowDef, ApiError> {
    let graph = match (&body.graph, &body.steps) {
        (Some(graph), _) => graph.clone(),
        (None, Some(steps)) => {
            let mut steps = steps.clone();
            normalize_steps(&mut steps);
            reconstruct(&steps, None)
        }
        (None, None) => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Either a graph or a step list is required"})),
            ))
        }
    };

    let mut issues = validate(&body.name, &graph, Some(state.catalog.as_ref()));
    let (steps, layout) = linearize(&graph);
    issues.extend(validate_macro_refs(&steps, |workflow_id| {
        state
            .store
            .load_workflow(workflow_id)
            .ok()
            .flatten()
            .map(|def| def.steps)
    }));
    if !issues.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Workflow failed validation", "issues": issues})),
        ));
    }

    let now = chrono::Utc::now().to_rfc3339();
    Ok(WorkflowDef {
        id,
        name: body.name,
        description: body.description,
        tags: body.tags,
        trigger: body.trigger,
        steps,
        parameters: body.parameters,
        layout: Some(layout),
        created_at: created_at.or_else(|| Some(now.clone())),
        updated_at: Some(now),
    })
}

async fn create_workflow(
    State(state): State<AppState>,
    Json(body): Json<SaveWorkflowRequest>,
) -> ApiResult {
    let def = build_definition(new_id("wf"), None, body, &state)?;
    state.store.save_workflow(&def).map_err(api_error)?;
    log::info!("created workflow '{}' ({})", def.name, def.id);
    Ok(Json(json!(def)))
}

async fn get_workflow(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    match state.store.load_workflow(&id).map_err(api_error)? {
        Some(def) => Ok(Json(json!(def))),
        None => Err(api_error(RunbookError::WorkflowNotFound(id))),
    }
}

async fn update_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SaveWorkflowRequest>,
) -> ApiResult {
    let existing = state
        .store
        .load_workflow(&id)
        .map_err(api_error)?
        .ok_or_else(|| api_error(RunbookError::WorkflowNotFound(id.clone())))?;
    let def = build_definition(id, existing.created_at, body, &state)?;
    state.store.save_workflow(&def).map_err(api_error)?;
    Ok(Json(json!(def)))
}

async fn delete_workflow(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    if state.store.delete_workflow(&id).map_err(api_error)? {
        Ok(Json(json!({"deleted": id})))
    } else {
        Err(api_error(RunbookError::WorkflowNotFound(id)))
    }
}

async fn duplicate_workflow(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let mut def = state
        .store
        .load_workflow(&id)
        .map_err(api_error)?
        .ok_or_else(|| api_error(RunbookError::WorkflowNotFound(id.clone())))?;
    def.id = new_id("wf");
    def.name = format!("{} (Copy)", def.name);
    let now = chrono::Utc::now().to_rfc3339();
    def.created_at = Some(now.clone());
    def.updated_at = Some(now);
    state.store.save_workflow(&def).map_err(api_error)?;
    Ok(Json(json!(def)))
}

#[derive(Deserialize)]
struct ValidateRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    graph: Option<Graph>,
}

/// Validate a graph without saving. Falls back to the stored
/// workflow's reconstructed graph when none is supplied.
async fn validate_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ValidateRequest>,
) -> ApiResult {
    let (name, graph) = match body.graph {
        Some(graph) => (body.name.unwrap_or_default(), graph),
        None => {
            let def = state
                .store
                .load_workflow(&id)
                .map_err(api_error)?
                .ok_or_else(|| api_error(RunbookError::WorkflowNotFound(id.clone())))?;
            let graph = reconstruct(&def.steps, def.layout.as_ref());
            (def.name, graph)
        }
    };
    let issues = validate(&name, &graph, Some(state.catalog.as_ref()));
    Ok(Json(json!({"valid": issues.is_empty(), "issues": issues})))
}

#[derive(Deserialize)]
struct RunRequest {
    #[serde(default)]
    parameters: Map<String, Value>,
    /// Flattened values made resolvable by bare name
    #[serde(default)]
    context: Map<String, Value>,
}

async fn run_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RunRequest>,
) -> ApiResult {
    let run = state
        .coordinator
        .start(&id, body.parameters, body.context, None)
        .await
        .map_err(api_error)?;
    Ok(Json(json!(run)))
}

async fn stream_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RunRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel(100);

    tokio::spawn(async move {
        log::info!("starting streaming run for workflow {}", id);
        if let Err(e) = state
            .coordinator
            .start(&id, body.parameters, body.context, Some(tx.clone()))
            .await
        {
            log::error!("streaming run failed: {}", e);
            let _ = tx
                .send(crate::runbook::run::RunEvent::Error {
                    message: e.to_string(),
                })
                .await;
        }
    });

    let stream =
        ReceiverStream::new(rx).map(|event| Ok(Event::default().json_data(event).unwrap()));

    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new().interval(std::time::Duration::from_secs(1)),
    )
}

#[derive(Deserialize)]
struct ListRunsQuery {
    #[serde(default)]
    workflow_id: Option<String>,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> ApiResult {
    let runs: Vec<RunSummary> = state
        .store
        .list_runs(query.workflow_id.as_deref(), query.limit)
        .map_err(api_error)?;
    Ok(Json(json!(runs)))
}

async fn get_run(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    match state.store.load_run(&id).map_err(api_error)? {
        Some(run) => Ok(Json(json!(run))),
        None => Err(api_error(RunbookError::RunNotFound(id))),
    }
}

#[derive(Deserialize)]
struct ResumeRequest {
    action: ResumeAction,
    #[serde(default)]
    reason: Option<String>,
}

async fn resume_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ResumeRequest>,
) -> ApiResult {
    let run = state
        .coordinator
        .resume(&id, body.action, body.reason, None)
        .await
        .map_err(api_error)?;
    Ok(Json(json!(run)))
}

#[derive(Deserialize, Default)]
struct CancelRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<CancelRequest>>,
) -> ApiResult {
    let reason = body.and_then(|Json(b)| b.reason);
    let run = state
        .coordinator
        .cancel(&id, reason, None)
        .await
        .map_err(api_error)?;
    Ok(Json(json!(run)))
}
