use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use crate::api::rest::error::{ApiError, ApiResult};
use crate::controller::gateway::guess_content_type;
use crate::controller::lab_manager::{CreatedLab, LabOrchestrator};
use crate::shared::models::{LabConfigRequest, LabEnvironment};

#[derive(Debug, Deserialize)]
pub struct CreateLabRequest {
    pub student_id: String,
    pub course_id: String,
    #[serde(default)]
    pub config: LabConfigRequest,
}

#[derive(Debug, Deserialize)]
pub struct DownloadFileQuery {
    pub path: String,
}

pub async fn create_lab(
    State(orchestrator): State<Arc<LabOrchestrator>>,
    Json(req): Json<CreateLabRequest>,
) -> ApiResult<(StatusCode, Json<CreatedLab>)> {
    let created = orchestrator
        .create_lab(&req.student_id, &req.course_id, req.config)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn list_labs(
    State(orchestrator): State<Arc<LabOrchestrator>>,
) -> ApiResult<Json<Vec<LabEnvironment>>> {
    Ok(Json(orchestrator.list_labs().await))
}

pub async fn get_lab(
    State(orchestrator): State<Arc<LabOrchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<Json<LabEnvironment>> {
    Ok(Json(orchestrator.get_lab(&id).await?))
}

pub async fn stop_lab(
    State(orchestrator): State<Arc<LabOrchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<Json<LabEnvironment>> {
    Ok(Json(orchestrator.stop_lab(&id).await?))
}

pub async fn pause_lab(
    State(orchestrator): State<Arc<LabOrchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<Json<LabEnvironment>> {
    Ok(Json(orchestrator.pause_lab(&id).await?))
}

pub async fn resume_lab(
    State(orchestrator): State<Arc<LabOrchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<Json<LabEnvironment>> {
    Ok(Json(orchestrator.resume_lab(&id).await?))
}

/// Body is the action payload as JSON; an empty body means no payload.
pub async fn proxy_action(
    State(orchestrator): State<Arc<LabOrchestrator>>,
    Path((id, ide_type, action)): Path<(String, String, String)>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let payload = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid JSON payload: {}", e)))?
    };
    let result = orchestrator
        .proxy_action(&id, &ide_type, &action, payload)
        .await?;
    Ok(Json(result))
}

pub async fn download_workspace(
    State(orchestrator): State<Arc<LabOrchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let archive = orchestrator.download_workspace(&id).await?;
    let disposition = format!("attachment; filename=\"workspace-{}.zip\"", id);
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        archive,
    )
        .into_response())
}

pub async fn download_file(
    State(orchestrator): State<Arc<LabOrchestrator>>,
    Path(id): Path<String>,
    Query(query): Query<DownloadFileQuery>,
) -> ApiResult<Response> {
    let data = orchestrator.download_file(&id, &query.path).await?;
    let content_type = guess_content_type(&query.path);
    Ok(([(header::CONTENT_TYPE, content_type)], data).into_response())
}
