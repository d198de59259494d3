//! Upload handlers: chunks, merge and small files.

use crate::api::AppState;
use crate::error::{Error, Result};
use crate::types::{ApiResponse, ChunkAck, MergeRequest, UploadedArtifact};
use axum::{
    Json,
    extract::{
        Multipart, State,
        multipart::{Field, MultipartError},
        rejection::JsonRejection,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use bytes::Bytes;

/// The `file` part of an upload form
struct FilePart {
    file_name: Option<String>,
    content_type: Option<String>,
    data: Bytes,
}

/// Fields of a multipart upload, chunked or whole-file
#[derive(Default)]
struct UploadForm {
    file: Option<FilePart>,
    chunk_index: Option<String>,
    total_chunks: Option<String>,
    file_id: Option<String>,
    file_name: Option<String>,
}

impl UploadForm {
    async fn read(mut multipart: Multipart, body_limit: usize) -> Result<Self> {
        let mut form = UploadForm::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| multipart_error(e, body_limit))?
        {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "file" => {
                    let file_name = field.file_name().map(str::to_string);
                    let content_type = field.content_type().map(str::to_string);
                    let data = field
                        .bytes()
                        .await
                        .map_err(|e| multipart_error(e, body_limit))?;
                    form.file = Some(FilePart {
                        file_name,
                        content_type,
                        data,
                    });
                }
                "chunkIndex" => form.chunk_index = Some(text(field, body_limit).await?),
                "totalChunks" => form.total_chunks = Some(text(field, body_limit).await?),
                "fileId" => form.file_id = Some(text(field, body_limit).await?),
                "fileName" => form.file_name = Some(text(field, body_limit).await?),
                other => tracing::debug!(field = other, "ignoring unknown form field"),
            }
        }
        Ok(form)
    }

    /// A chunk upload names its index, the chunk count and the session
    fn is_chunk(&self) -> bool {
        [&self.chunk_index, &self.total_chunks, &self.file_id]
            .iter()
            .all(|v| v.as_deref().is_some_and(|s| !s.trim().is_empty()))
    }
}

async fn text(field: Field<'_>, body_limit: usize) -> Result<String> {
    field
        .text()
        .await
        .map(|s| s.trim().to_string())
        .map_err(|e| multipart_error(e, body_limit))
}

fn multipart_error(error: MultipartError, body_limit: usize) -> Error {
    if error.status() == StatusCode::PAYLOAD_TOO_LARGE {
        // Exact size is unknown once the limit trips
        Error::PayloadTooLarge {
            size: body_limit as u64 + 1,
            limit: body_limit as u64,
        }
    } else {
        Error::InvalidParameter(format!("malformed multipart body: {}", error.body_text()))
    }
}

fn parse_count(raw: Option<&str>, field: &str) -> Result<u32> {
    let raw = raw.ok_or_else(|| Error::InvalidParameter(format!("{field} is required")))?;
    raw.parse()
        .map_err(|_| Error::InvalidParameter(format!("{field} must be a non-negative integer, got {raw:?}")))
}

async fn receive_chunk(state: &AppState, form: UploadForm) -> Result<ChunkAck> {
    if !form.is_chunk() {
        return Err(Error::InvalidParameter(
            "chunkIndex, totalChunks and fileId are required".to_string(),
        ));
    }
    let chunk_index = parse_count(form.chunk_index.as_deref(), "chunkIndex")?;
    let total_chunks = parse_count(form.total_chunks.as_deref(), "totalChunks")?;
    let file = form
        .file
        .ok_or_else(|| Error::InvalidParameter("chunk has no file part".to_string()))?;
    let file_id = form.file_id.unwrap_or_default();

    state
        .gateway
        .receiver()
        .receive_chunk(&file_id, chunk_index, Some(total_chunks), file.data)
        .await
}

async fn store_file(state: &AppState, form: UploadForm) -> Result<UploadedArtifact> {
    let file = form
        .file
        .ok_or_else(|| Error::InvalidParameter("no file uploaded".to_string()))?;
    let file_name = file
        .file_name
        .filter(|n| !n.trim().is_empty())
        .or(form.file_name)
        .ok_or_else(|| Error::InvalidParameter("uploaded file has no name".to_string()))?;

    state
        .gateway
        .receiver()
        .store_whole_file(&file_name, file.content_type.as_deref(), file.data)
        .await
}

fn body_limit(state: &AppState) -> usize {
    state.gateway.config().upload.max_body_bytes
}

/// POST /api/upload - Chunk or whole-file upload
///
/// Treated as a chunk when `chunkIndex`, `totalChunks` and `fileId` are all
/// present, otherwise as a small whole-file upload.
#[utoipa::path(
    post,
    path = "/api/upload",
    tag = "uploads",
    request_body(content = Vec<u8>, description = "multipart/form-data with `file` and optional `chunkIndex`, `totalChunks`, `fileId`, `fileName`", content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Chunk acknowledged (`ChunkAck`) or file stored (`UploadedArtifact`)"),
        (status = 400, description = "Missing file or malformed fields", body = crate::error::ApiError),
        (status = 413, description = "Upload exceeds the size limit", body = crate::error::ApiError)
    )
)]
pub async fn upload(State(state): State<AppState>, multipart: Multipart) -> Result<Response> {
    let form = UploadForm::read(multipart, body_limit(&state)).await?;
    if form.is_chunk() {
        let ack = receive_chunk(&state, form).await?;
        Ok(Json(ApiResponse::ok(ack)).into_response())
    } else {
        let artifact = store_file(&state, form).await?;
        Ok(Json(ApiResponse::ok(artifact)).into_response())
    }
}

/// POST /api/upload/chunk - Stage one chunk
#[utoipa::path(
    post,
    path = "/api/upload/chunk",
    tag = "uploads",
    request_body(content = Vec<u8>, description = "multipart/form-data with `file`, `chunkIndex`, `totalChunks`, `fileId`", content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Chunk stored", body = ChunkAck),
        (status = 400, description = "Missing or malformed fields", body = crate::error::ApiError),
        (status = 413, description = "Chunk exceeds the size limit", body = crate::error::ApiError)
    )
)]
pub async fn upload_chunk(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ApiResponse<ChunkAck>>> {
    let form = UploadForm::read(multipart, body_limit(&state)).await?;
    let ack = receive_chunk(&state, form).await?;
    Ok(Json(ApiResponse::ok(ack)))
}

/// POST /api/upload/simple - Store a small file in one request
#[utoipa::path(
    post,
    path = "/api/upload/simple",
    tag = "uploads",
    request_body(content = Vec<u8>, description = "multipart/form-data with `file`", content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "File stored", body = UploadedArtifact),
        (status = 400, description = "No file uploaded", body = crate::error::ApiError),
        (status = 413, description = "File exceeds the size limit", body = crate::error::ApiError)
    )
)]
pub async fn upload_simple(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ApiResponse<UploadedArtifact>>> {
    let form = UploadForm::read(multipart, body_limit(&state)).await?;
    let artifact = store_file(&state, form).await?;
    Ok(Json(ApiResponse::ok(artifact)))
}

/// POST /api/upload/merge - Assemble a chunked upload
#[utoipa::path(
    post,
    path = "/api/upload/merge",
    tag = "uploads",
    request_body = MergeRequest,
    responses(
        (status = 200, description = "Artifact assembled", body = UploadedArtifact),
        (status = 400, description = "Malformed request", body = crate::error::ApiError),
        (status = 422, description = "Chunks are missing", body = crate::error::ApiError),
        (status = 500, description = "Artifact could not be written", body = crate::error::ApiError)
    )
)]
pub async fn merge_upload(
    State(state): State<AppState>,
    payload: std::result::Result<Json<MergeRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<UploadedArtifact>>> {
    let Json(request) =
        payload.map_err(|e| Error::InvalidParameter(format!("invalid merge request: {}", e.body_text())))?;
    let artifact = state
        .gateway
        .assembler()
        .assemble(&request.file_id, &request.file_name, request.total_chunks)
        .await?;
    Ok(Json(ApiResponse::ok(artifact)))
}
