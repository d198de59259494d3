//! The gateway: upload handling, task relay and background maintenance
//!
//! [`Gateway`] owns the storage backend and everything built on it. The HTTP
//! layer in [`crate::api`] is a thin adapter over its methods.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::assembler::Assembler;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::janitor::Janitor;
use crate::receiver::ChunkReceiver;
use crate::storage::{self, ByteReader, Storage};
use crate::synthesis::{DashScopeClient, QueriedTask, SubmittedTask, VideoSynthesis};
use crate::types::{CreateTaskRequest, TaskId};
use crate::validation::validate_artifact_name;

/// Server side of synthgate
pub struct Gateway {
    config: Arc<Config>,
    storage: Arc<dyn Storage>,
    receiver: ChunkReceiver,
    assembler: Assembler,
    synthesis: Arc<dyn VideoSynthesis>,
    cancel: CancellationToken,
    janitor: Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    /// Build a gateway from configuration
    ///
    /// Validates the configuration, opens the configured storage backend and
    /// creates the DashScope client.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let storage = storage::from_config(&config.storage)?;
        let synthesis = Arc::new(DashScopeClient::new(&config.synthesis)?);
        Ok(Self::with_parts(config, storage, synthesis))
    }

    /// Build a gateway over explicit collaborators
    pub fn with_parts(
        config: Config,
        storage: Arc<dyn Storage>,
        synthesis: Arc<dyn VideoSynthesis>,
    ) -> Self {
        let public_path = config.storage.public_path.clone();
        let receiver = ChunkReceiver::new(
            Arc::clone(&storage),
            config.upload.limits.clone(),
            public_path.clone(),
        );
        let assembler = Assembler::new(Arc::clone(&storage), public_path);

        tracing::info!(
            backend = storage.backend_name(),
            public_path = %config.storage.public_path,
            "gateway initialized"
        );

        Self {
            config: Arc::new(config),
            storage,
            receiver,
            assembler,
            synthesis,
            cancel: CancellationToken::new(),
            janitor: Mutex::new(None),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Storage backend
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Chunk and whole-file receiver
    pub fn receiver(&self) -> &ChunkReceiver {
        &self.receiver
    }

    /// Chunk assembler
    pub fn assembler(&self) -> &Assembler {
        &self.assembler
    }

    /// Token cancelled on shutdown
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Submit a synthesis job
    ///
    /// Both URLs are required. Relative artifact paths are joined onto
    /// `server.public_base_url` when one is configured.
    pub async fn create_task(&self, request: CreateTaskRequest) -> Result<SubmittedTask> {
        let image_url = required(request.image_url, "imageUrl")?;
        let video_url = required(request.video_url, "videoUrl")?;
        let model = request.model.unwrap_or_default();

        let image_url = self.absolute_url(&image_url)?;
        let video_url = self.absolute_url(&video_url)?;

        self.synthesis.submit(&image_url, &video_url, model).await
    }

    /// Current state of a synthesis job
    pub async fn query_task(&self, task_id: &str) -> Result<QueriedTask> {
        let task_id = task_id.trim();
        if task_id.is_empty() {
            return Err(Error::InvalidParameter("taskId is required".to_string()));
        }
        let queried = self.synthesis.query(&TaskId::new(task_id)).await?;
        let status = queried.snapshot.status;
        if status.is_terminal() {
            tracing::info!(task_id, ?status, request_id = ?queried.request_id, "task finished");
        } else {
            tracing::debug!(task_id, ?status, "task in progress");
        }
        Ok(queried)
    }

    /// Open a stored artifact for download
    pub async fn open_artifact(&self, name: &str) -> Result<(ByteReader, u64)> {
        validate_artifact_name(name)?;
        self.storage
            .open_artifact(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("artifact {name}")))
    }

    /// Start the staging janitor, unless it is disabled or already running
    pub async fn start_janitor(&self) {
        let mut slot = self.janitor.lock().await;
        if slot.is_some() || self.config.janitor.sweep_interval.is_zero() {
            return;
        }
        let janitor = Janitor::new(
            Arc::clone(&self.storage),
            self.config.janitor.clone(),
            self.cancel.child_token(),
        );
        *slot = Some(tokio::spawn(janitor.run()));
    }

    /// Stop background work and wait for it to finish
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("gateway shutting down");
        self.cancel.cancel();
        if let Some(handle) = self.janitor.lock().await.take() {
            handle
                .await
                .map_err(|e| Error::Other(format!("janitor task failed: {e}")))?;
        }
        tracing::info!("gateway shut down");
        Ok(())
    }

    fn absolute_url(&self, raw: &str) -> Result<String> {
        match &self.config.server.public_base_url {
            Some(base) if raw.starts_with('/') => {
                let base = url::Url::parse(base).map_err(|e| Error::Config {
                    message: format!("invalid public base URL: {e}"),
                    key: Some("server.public_base_url".to_string()),
                })?;
                let joined = base
                    .join(raw)
                    .map_err(|e| Error::InvalidParameter(format!("invalid URL {raw:?}: {e}")))?;
                Ok(joined.to_string())
            }
            _ => Ok(raw.to_string()),
        }
    }
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(Error::InvalidParameter(format!("{field} is required"))),
    }
}
