//! Synthesis task relay handlers.

use super::QueryTaskParams;
use crate::api::AppState;
use crate::error::{Error, Result};
use crate::types::{ApiResponse, CreateTaskRequest, CreateTaskResponse, TaskSnapshot};
use axum::{
    Json,
    extract::{Query, State, rejection::JsonRejection},
};

/// POST /api/create-task - Submit a synthesis job
///
/// `model` defaults to `std` when omitted.
#[utoipa::path(
    post,
    path = "/api/create-task",
    tag = "tasks",
    request_body = CreateTaskRequest,
    responses(
        (status = 200, description = "Job accepted", body = CreateTaskResponse),
        (status = 400, description = "Missing URL or vendor rejection", body = crate::error::ApiError),
        (status = 502, description = "Vendor unreachable", body = crate::error::ApiError)
    )
)]
pub async fn create_task(
    State(state): State<AppState>,
    payload: std::result::Result<Json<CreateTaskRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<CreateTaskResponse>>> {
    let Json(request) = payload
        .map_err(|e| Error::InvalidParameter(format!("invalid task request: {}", e.body_text())))?;
    let submitted = state.gateway.create_task(request).await?;
    Ok(Json(ApiResponse::with_request_id(
        CreateTaskResponse {
            task_id: submitted.task_id,
        },
        submitted.request_id,
    )))
}

/// GET /api/query-task - Current state of a synthesis job
#[utoipa::path(
    get,
    path = "/api/query-task",
    tag = "tasks",
    params(QueryTaskParams),
    responses(
        (status = 200, description = "Task state", body = TaskSnapshot),
        (status = 400, description = "Missing taskId or vendor rejection", body = crate::error::ApiError),
        (status = 502, description = "Vendor unreachable", body = crate::error::ApiError)
    )
)]
pub async fn query_task(
    State(state): State<AppState>,
    Query(params): Query<QueryTaskParams>,
) -> Result<Json<ApiResponse<TaskSnapshot>>> {
    let task_id = params
        .task_id
        .ok_or_else(|| Error::InvalidParameter("taskId is required".to_string()))?;
    let queried = state.gateway.query_task(&task_id).await?;
    Ok(Json(ApiResponse::with_request_id(
        queried.snapshot,
        queried.request_id,
    )))
}
