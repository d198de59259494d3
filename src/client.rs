//! HTTP client for a synthgate gateway
//!
//! This is the transport behind [`ChunkTransmitter`](crate::transmitter::ChunkTransmitter)
//! and [`TaskPoller`](crate::poller::TaskPoller) when they talk to a remote
//! gateway rather than to in-process components.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;

use crate::error::{ApiError, AssemblyError, Error, Result};
use crate::poller::TaskQuery;
use crate::transmitter::{ChunkPart, UploadEndpoint};
use crate::types::{
    ApiResponse, ChunkAck, CreateTaskRequest, CreateTaskResponse, MergeRequest, TaskId,
    TaskSnapshot, UploadedArtifact,
};
use crate::validation::content_type_for;

/// Client for the gateway REST API
#[derive(Clone, Debug)]
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl GatewayClient {
    /// Create a client for the gateway at `base_url` (e.g. `http://127.0.0.1:3000`)
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_http_client(reqwest::Client::new(), base_url)
    }

    /// Create a client sharing an existing `reqwest` client
    pub fn with_http_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
        }
    }

    /// Send `X-Api-Key` with every request
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("X-Api-Key", key),
            None => request,
        }
    }

    /// Send one chunk to `/api/upload/chunk`
    ///
    /// Any non-success status becomes [`Error::ChunkRejected`] so the
    /// transmitter retries it.
    pub async fn upload_chunk(&self, part: &ChunkPart) -> Result<ChunkAck> {
        let file = Part::stream_with_length(part.data.clone(), part.data.len() as u64)
            .file_name(part.file_name.clone())
            .mime_str("application/octet-stream")?;
        let form = Form::new()
            .part("file", file)
            .text("chunkIndex", part.chunk_index.to_string())
            .text("totalChunks", part.total_chunks.to_string())
            .text("fileId", part.session_id.to_string())
            .text("fileName", part.file_name.clone());

        let response = self
            .authorize(self.http.post(self.url("/api/upload/chunk")))
            .multipart(form)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::ChunkRejected {
                chunk_index: part.chunk_index,
                status: response.status().as_u16(),
            });
        }
        Ok(response.json::<ApiResponse<ChunkAck>>().await?.data)
    }

    /// Ask the gateway to assemble a session
    pub async fn merge(&self, request: &MergeRequest) -> Result<UploadedArtifact> {
        let response = self
            .authorize(self.http.post(self.url("/api/upload/merge")))
            .json(request)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = match decode_failure(response).await {
                Error::Assembly(AssemblyError::MergeRejected { message, .. }) => message,
                other => other.to_string(),
            };
            return Err(AssemblyError::MergeRejected { status, message }.into());
        }
        Ok(response.json::<ApiResponse<UploadedArtifact>>().await?.data)
    }

    /// Upload a small file in one request to `/api/upload/simple`
    pub async fn upload_file(&self, file_name: &str, data: Bytes) -> Result<UploadedArtifact> {
        let file = Part::stream_with_length(data.clone(), data.len() as u64)
            .file_name(file_name.to_string())
            .mime_str(content_type_for(file_name))?;
        let form = Form::new().part("file", file);
        let request = self
            .authorize(self.http.post(self.url("/api/upload/simple")))
            .multipart(form);
        unwrap_envelope(request.send().await?).await
    }

    /// Submit a synthesis job through the gateway
    pub async fn create_task(&self, request: &CreateTaskRequest) -> Result<TaskId> {
        let request = self
            .authorize(self.http.post(self.url("/api/create-task")))
            .json(request);
        let created: CreateTaskResponse = unwrap_envelope(request.send().await?).await?;
        Ok(created.task_id)
    }

    /// Fetch the current state of a job
    pub async fn query_task(&self, task_id: &TaskId) -> Result<TaskSnapshot> {
        let request = self
            .authorize(self.http.get(self.url("/api/query-task")))
            .query(&[("taskId", task_id.as_str())]);
        unwrap_envelope(request.send().await?).await
    }

    /// Liveness check
    pub async fn health(&self) -> Result<bool> {
        let response = self.http.get(self.url("/health")).send().await?;
        Ok(response.status().is_success())
    }
}

/// Extract `data` from a success envelope, or turn a failure into an [`Error`]
async fn unwrap_envelope<T: DeserializeOwned>(response: Response) -> Result<T> {
    if !response.status().is_success() {
        return Err(decode_failure(response).await);
    }
    Ok(response.json::<ApiResponse<T>>().await?.data)
}

/// Map a failed gateway response back onto the error taxonomy
async fn decode_failure(response: Response) -> Error {
    let status = response.status().as_u16();
    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => return Error::Network(e),
    };
    let Ok(api_error) = serde_json::from_str::<ApiError>(&body) else {
        return Error::Other(format!(
            "gateway returned HTTP {status}: {}",
            body.chars().take(200).collect::<String>()
        ));
    };

    let detail = api_error.error;
    match (status, detail.code.as_str()) {
        (_, "InvalidParameter") => Error::InvalidParameter(detail.message),
        (401, _) => Error::Unauthorized(detail.message),
        (404, _) => Error::NotFound(detail.message),
        (_, "AssemblyError") => AssemblyError::MergeRejected {
            status,
            message: detail.message,
        }
        .into(),
        _ => Error::Vendor {
            code: detail.code,
            message: detail.message,
            request_id: detail.request_id,
        },
    }
}

#[async_trait]
impl UploadEndpoint for GatewayClient {
    async fn send_chunk(&self, part: &ChunkPart) -> Result<ChunkAck> {
        self.upload_chunk(part).await
    }

    async fn merge(&self, request: &MergeRequest) -> Result<UploadedArtifact> {
        GatewayClient::merge(self, request).await
    }

    async fn upload_file(&self, file_name: &str, data: Bytes) -> Result<UploadedArtifact> {
        GatewayClient::upload_file(self, file_name, data).await
    }
}

#[async_trait]
impl TaskQuery for GatewayClient {
    async fn query(&self, task_id: &TaskId) -> Result<TaskSnapshot> {
        self.query_task(task_id).await
    }
}
