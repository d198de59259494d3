//! Artifact download handler.

use crate::api::AppState;
use crate::error::Result;
use crate::validation::content_type_for;
use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
};
use tokio_util::io::ReaderStream;

/// GET /uploads/:name - Download a stored artifact
///
/// Served under the configured public path with a long-lived public cache
/// header; artifact names are unique so their content never changes.
#[utoipa::path(
    get,
    path = "/uploads/{name}",
    tag = "artifacts",
    params(("name" = String, Path, description = "Artifact name")),
    responses(
        (status = 200, description = "Artifact bytes", content_type = "application/octet-stream"),
        (status = 400, description = "Invalid artifact name", body = crate::error::ApiError),
        (status = 404, description = "No such artifact", body = crate::error::ApiError)
    )
)]
pub async fn get_artifact(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response> {
    let (reader, size) = state.gateway.open_artifact(&name).await?;
    let max_age = state.gateway.config().server.artifact_cache_max_age.as_secs();

    let headers = [
        (header::CONTENT_TYPE, content_type_for(&name).to_string()),
        (header::CONTENT_LENGTH, size.to_string()),
        (header::CACHE_CONTROL, format!("public, max-age={max_age}")),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(reader))).into_response())
}
