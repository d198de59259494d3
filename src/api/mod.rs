//! REST API server module
//!
//! The HTTP face of the [`Gateway`]: chunked and whole-file uploads, chunk
//! assembly, synthesis task relay and artifact downloads.

use crate::{Gateway, Result};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::HeaderValue,
    middleware,
    routing::{get, post},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub mod auth;
pub mod error_response;
pub mod openapi;
pub mod routes;
pub mod state;

pub use openapi::ApiDoc;
pub use state::AppState;

/// Create the API router with all route definitions
///
/// # Routes
///
/// ## Uploads (API key protected when configured)
/// - `POST /api/upload` - Chunk or whole-file upload
/// - `POST /api/upload/chunk` - Stage one chunk
/// - `POST /api/upload/simple` - Store a small file
/// - `POST /api/upload/merge` - Assemble staged chunks
///
/// ## Tasks (API key protected when configured)
/// - `POST /api/create-task` - Submit a synthesis job
/// - `GET /api/query-task?taskId=` - Job status
///
/// ## Public
/// - `GET /uploads/:name` - Artifact download (under `storage.public_path`)
/// - `GET /health` - Liveness check
/// - `GET /openapi.json` - OpenAPI specification
/// - `GET /swagger-ui` - Interactive documentation (if enabled)
pub fn create_router(gateway: Arc<Gateway>) -> Router {
    let config = Arc::clone(gateway.config());
    let state = AppState::new(gateway);

    let api = Router::new()
        .route("/api/upload", post(routes::upload))
        .route("/api/upload/chunk", post(routes::upload_chunk))
        .route("/api/upload/simple", post(routes::upload_simple))
        .route("/api/upload/merge", post(routes::merge_upload))
        .route("/api/create-task", post(routes::create_task))
        .route("/api/query-task", get(routes::query_task));

    // Artifacts and health stay reachable for the vendor and health checks
    let api = if config.server.api_key.is_some() {
        api.layer(middleware::from_fn_with_state(
            config.server.api_key.clone(),
            auth::require_api_key,
        ))
    } else {
        api
    };

    let artifact_route = format!(
        "{}/:name",
        config.storage.public_path.trim_end_matches('/')
    );
    let router = Router::new()
        .merge(api)
        .route(&artifact_route, get(routes::get_artifact))
        .route("/health", get(routes::health_check))
        .route("/openapi.json", get(routes::openapi_spec));

    let router = if config.server.swagger_ui {
        router.merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
    } else {
        router
    };

    let router = router
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.upload.max_body_bytes))
        .layer(TraceLayer::new_for_http());

    if config.server.cors_enabled {
        router.layer(build_cors_layer(&config.server.cors_origins))
    } else {
        router
    }
}

/// Build a CORS layer; `"*"` or an empty list allows any origin
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_any = origins.iter().any(|o| o == "*");

    if allow_any || origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let allowed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Start the API server on the configured bind address.
///
/// Runs until the gateway's cancellation token fires (see
/// [`Gateway::shutdown`]), then drains in-flight requests.
///
/// # Example
///
/// ```no_run
/// use synthgate::{Config, Gateway};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let gateway = Arc::new(Gateway::new(Config::default())?);
/// synthgate::api::start_api_server(gateway).await?;
/// # Ok(())
/// # }
/// ```
pub async fn start_api_server(gateway: Arc<Gateway>) -> Result<()> {
    let bind_address = gateway.config().server.bind_address;
    tracing::info!(address = %bind_address, "Starting API server");

    let listener = TcpListener::bind(bind_address)
        .await
        .map_err(crate::error::Error::Io)?;
    serve(gateway, listener).await
}

/// Serve the API on an already bound listener
pub async fn serve(gateway: Arc<Gateway>, listener: TcpListener) -> Result<()> {
    let address = listener.local_addr().map_err(crate::error::Error::Io)?;
    let cancel = gateway.cancellation_token();
    let app = create_router(gateway);

    tracing::info!(address = %address, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| crate::error::Error::ApiServerError(e.to_string()))?;

    tracing::info!("API server stopped");
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
