//! REST endpoints - thin translations onto the Manager

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use tandem_core::{Input, ManagerHandle, Task};

use crate::error::AppError;
use crate::AppState;

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub name: String,
    #[serde(default)]
    pub workdir: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub uuid: String,
    pub name: String,
    pub workdir: String,
    pub state: String,
    pub group_id: String,
    pub annotation: Option<String>,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        Self {
            uuid: task.uuid,
            name: task.name,
            workdir: task.workdir,
            state: task.state.to_string(),
            group_id: task.group_id,
            annotation: task.annotation,
        }
    }
}

pub async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<Json<TaskResponse>, AppError> {
    let workdir = request
        .workdir
        .unwrap_or_else(|| state.working_dir.display().to_string());
    let task = state.manager.init_task(&request.name, None, &workdir)?;
    Ok(Json(task.into()))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>, AppError> {
    let task = state
        .manager
        .store()
        .load_task(&id)?
        .ok_or_else(|| AppError::not_found(format!("unknown task: {id}")))?;
    Ok(Json(task.into()))
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub agent: String,
    pub content: String,
}

pub async fn enqueue_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<EnqueueRequest>,
) -> Result<StatusCode, AppError> {
    if request.content.trim().is_empty() {
        return Err(AppError::bad_request("content must not be empty"));
    }
    state
        .manager
        .handle(Input::user(request.content), &id, &request.agent)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
pub struct TerminateRequest {
    pub agent: String,
}

pub async fn terminate_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<TerminateRequest>,
) -> Result<StatusCode, AppError> {
    let executor = state
        .manager
        .executor_for(&id, &request.agent)
        .ok_or_else(|| AppError::not_found(format!("no executor for task {id}")))?;
    executor.terminate();
    Ok(StatusCode::OK)
}

pub async fn mcp_status(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let statuses = state.manager.mcp().statuses().await;
    let body: Vec<_> = statuses
        .into_iter()
        .map(|(name, status)| json!({ "name": name, "status": status.to_string() }))
        .collect();
    Ok(Json(json!({ "servers": body })))
}
