//! Workflow routes — §6 `/v1/workflows/*`.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::ArchonError;
use crate::AppState;

#[derive(Deserialize)]
pub struct StartWorkflowRunRequest {
    pub recipe_id: String,
    pub cwd: String,
}

pub async fn start_run(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartWorkflowRunRequest>,
) -> Result<Json<Value>, ArchonError> {
    let run = state.workflow_engine.start_run(&body.recipe_id, &body.cwd).await?;
    Ok(Json(json!(run)))
}

pub async fn start(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<Value>, ArchonError> {
    state.workflow_engine.resume(&id).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn pause(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<Value>, ArchonError> {
    state.workflow_engine.pause(&id).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn stop(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<Value>, ArchonError> {
    state.workflow_engine.stop(&id).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn resume(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<Value>, ArchonError> {
    state.workflow_engine.resume(&id).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn dismiss(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<Value>, ArchonError> {
    state.workflow_engine.dismiss(&id).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn undismiss(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<Value>, ArchonError> {
    state.workflow_engine.undismiss(&id).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
pub struct RenameRunRequest {
    pub title: String,
}

pub async fn rename(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<RenameRunRequest>,
) -> Result<Json<Value>, ArchonError> {
    state.workflow_engine.rename(&id, &body.title).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn decision(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ArchonError> {
    state.workflow_engine.decision(&id, body).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn list_runs(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "runs": state.workflow_engine.runs().await }))
}

pub async fn list_templates(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "templates": state.workflow_engine.templates() }))
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.workflow_engine.metrics().await)
}
