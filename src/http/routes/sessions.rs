//! Session routes — §6 `POST/PATCH /v1/sessions*`.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::ArchonError;
use crate::model::Session;
use crate::AppState;

#[derive(Deserialize)]
pub struct StartSessionRequest {
    pub provider: String,
    pub cwd: String,
    #[serde(default)]
    pub title: String,
}

pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartSessionRequest>,
) -> Result<Json<Session>, ArchonError> {
    let session = state.session_manager.create(&body.provider, &body.cwd, &body.title).await?;
    Ok(Json(session))
}

pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Value> {
    let sessions: Vec<Value> = state
        .session_manager
        .list()
        .await
        .into_iter()
        .map(|r| json!({ "session": r.session, "source": r.source }))
        .collect();
    Json(json!({ "sessions": sessions }))
}

#[derive(Deserialize)]
pub struct UpdateSessionRequest {
    #[serde(default)]
    pub title: Option<String>,
}

pub async fn update_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<UpdateSessionRequest>,
) -> Result<Json<Session>, ArchonError> {
    if let Some(title) = &body.title {
        state.session_manager.rename(&id, title).await?;
    }
    let (session, _) = state.session_manager.get(&id).await?;
    Ok(Json(session))
}

#[derive(Deserialize)]
pub struct SendSessionRequest {
    pub text: String,
    #[serde(default)]
    pub model: Option<String>,
}

pub async fn send(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<SendSessionRequest>,
) -> Result<Json<Value>, ArchonError> {
    let turn_id = state.session_manager.send(&id, &body.text, body.model).await?;
    Ok(Json(json!({ "ok": true, "turn_id": turn_id })))
}

#[derive(Deserialize)]
pub struct ApproveSessionRequest {
    pub request_id: i64,
    pub decision: Value,
}

pub async fn approve(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ApproveSessionRequest>,
) -> Result<Json<Value>, ArchonError> {
    state.session_manager.approve(&id, body.request_id, body.decision).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn interrupt(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<Value>, ArchonError> {
    state.session_manager.interrupt(&id).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn delete_session(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<Value>, ArchonError> {
    state.session_manager.delete(&id).await?;
    Ok(Json(json!({ "ok": true })))
}
