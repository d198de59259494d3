//! # synthgate
//!
//! Chunked media upload gateway and task poller for AI video-synthesis
//! services.
//!
//! ## Design Philosophy
//!
//! synthgate is designed to be:
//! - **Library-first** - the gateway is an embeddable axum router, the client
//!   side is plain async Rust
//! - **Sensible defaults** - works out of the box with filesystem storage
//! - **Storage-agnostic** - staging and artifacts go through the [`Storage`]
//!   trait (filesystem, S3-compatible, in-memory)
//!
//! ## Server side
//!
//! ```no_run
//! use synthgate::{Config, Gateway, run_with_shutdown};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.apply_env()?;
//!
//!     let gateway = Arc::new(Gateway::new(config)?);
//!     gateway.start_janitor().await;
//!
//!     let server = tokio::spawn(synthgate::api::start_api_server(gateway.clone()));
//!     run_with_shutdown(&gateway).await?;
//!     server.await??;
//!     Ok(())
//! }
//! ```
//!
//! ## Client side
//!
//! ```no_run
//! use synthgate::{ChunkTransmitter, Config, GatewayClient, TaskPoller};
//! use synthgate::types::{CreateTaskRequest, ModelType};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let client = GatewayClient::new("http://127.0.0.1:3000");
//! let transmitter = ChunkTransmitter::new(client.clone(), &config.upload);
//!
//! let video = transmitter
//!     .transmit("motion.mp4", |p| println!("upload {p:.0}%"))
//!     .await?;
//! let photo = transmitter.upload_small("photo.png").await?;
//!
//! let task_id = client
//!     .create_task(&CreateTaskRequest {
//!         image_url: Some(photo.url),
//!         video_url: Some(video.url),
//!         model: Some(ModelType::Std),
//!     })
//!     .await?;
//!
//! let poller = TaskPoller::new(Arc::new(client), config.poll.clone());
//! let result = poller.wait(task_id).await?;
//! println!("video ready at {}", result.video_url);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// REST API module
pub mod api;
/// Chunk assembly
pub mod assembler;
/// Gateway HTTP client
pub mod client;
/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Gateway facade
pub mod gateway;
/// Staging janitor
pub mod janitor;
/// Remote task polling
pub mod poller;
/// Chunk reception
pub mod receiver;
/// Retry logic with exponential backoff
pub mod retry;
/// Staging and artifact storage
pub mod storage;
/// Synthesis vendor client
pub mod synthesis;
/// Chunked upload client side
pub mod transmitter;
/// Core types
pub mod types;
/// Media validation and name sanitisation
pub mod validation;

// Re-export commonly used types
pub use assembler::Assembler;
pub use client::GatewayClient;
pub use config::{Config, MediaLimits, PollConfig, RetryConfig, StorageBackend, UploadConfig};
pub use error::{ApiError, AssemblyError, Error, ErrorDetail, Result, ToHttpStatus};
pub use gateway::Gateway;
pub use janitor::Janitor;
pub use poller::{
    NoopObserver, PollHandle, PollObserver, PollSnapshot, PollState, TaskCompletion, TaskPoller,
    TaskQuery,
};
pub use receiver::ChunkReceiver;
pub use storage::{FilesystemStorage, MemoryStorage, ObjectStorage, Storage};
pub use synthesis::{DashScopeClient, VideoSynthesis};
pub use transmitter::{ChunkPart, ChunkTransmitter, UploadEndpoint};
pub use types::{
    ChunkAck, MediaKind, MergeRequest, ModelType, SessionId, TaskId, TaskSnapshot, TaskStatus,
    UploadedArtifact,
};

/// Wait for a termination signal, then shut the gateway down.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// The API server started by [`api::start_api_server`] watches the same
/// cancellation token and drains once this returns.
pub async fn run_with_shutdown(gateway: &Gateway) -> Result<()> {
    wait_for_signal().await;
    gateway.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
