//! OpenAPI documentation for the gateway, generated at compile time by utoipa

use utoipa::OpenApi;

/// OpenAPI documentation for the synthgate REST API
///
/// Served at `/openapi.json`; the Swagger UI at `/swagger-ui` reads a copy
/// from `/api-docs/openapi.json`.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "synthgate REST API",
        version = "0.1.0",
        description = "Chunked media uploads and AI video-synthesis task relay",
        license(
            name = "MIT OR Apache-2.0"
        )
    ),
    servers(
        (url = "http://localhost:3000", description = "Local development server")
    ),
    paths(
        // Uploads
        crate::api::routes::upload,
        crate::api::routes::upload_chunk,
        crate::api::routes::upload_simple,
        crate::api::routes::merge_upload,

        // Tasks
        crate::api::routes::create_task,
        crate::api::routes::query_task,

        // Artifacts
        crate::api::routes::get_artifact,

        // System
        crate::api::routes::health_check,
        crate::api::routes::openapi_spec,
    ),
    components(schemas(
        crate::types::MediaKind,
        crate::types::UploadedArtifact,
        crate::types::ChunkAck,
        crate::types::MergeRequest,
        crate::types::TaskId,
        crate::types::TaskStatus,
        crate::types::TaskSnapshot,
        crate::types::ModelType,
        crate::types::CreateTaskRequest,
        crate::types::CreateTaskResponse,
        crate::error::ApiError,
        crate::error::ErrorDetail,
    )),
    tags(
        (name = "uploads", description = "Chunked and whole-file uploads, chunk assembly"),
        (name = "tasks", description = "Synthesis job submission and status"),
        (name = "artifacts", description = "Stored uploads"),
        (name = "system", description = "Health and API documentation"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

/// Registers the X-Api-Key scheme
struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = &mut openapi.components {
            components.add_security_scheme(
                "api_key",
                utoipa::openapi::security::SecurityScheme::ApiKey(
                    utoipa::openapi::security::ApiKey::Header(
                        utoipa::openapi::security::ApiKeyValue::new("X-Api-Key"),
                    ),
                ),
            );
        }
    }
}
