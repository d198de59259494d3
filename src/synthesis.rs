//! Job submission to the video-synthesis vendor
//!
//! [`VideoSynthesis`] is the seam the gateway routes use; [`DashScopeClient`]
//! implements it against the DashScope asynchronous task API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use crate::config::SynthesisConfig;
use crate::error::{Error, Result};
use crate::poller::TaskQuery;
use crate::types::{ModelType, TaskId, TaskSnapshot, TaskStatus};

const SUBMIT_PATH: &str = "/api/v1/services/aigc/image2video/video-synthesis/";
const TASKS_PATH: &str = "/api/v1/tasks/";

/// A job accepted by the vendor
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmittedTask {
    /// Identifier to poll
    pub task_id: TaskId,
    /// Vendor request id
    pub request_id: Option<String>,
}

/// One vendor status reply
#[derive(Clone, Debug, PartialEq)]
pub struct QueriedTask {
    /// Task state
    pub snapshot: TaskSnapshot,
    /// Vendor request id
    pub request_id: Option<String>,
}

/// Submits and observes synthesis jobs
#[async_trait]
pub trait VideoSynthesis: Send + Sync {
    /// Start a job animating `image_url` with the motion in `video_url`
    async fn submit(&self, image_url: &str, video_url: &str, model: ModelType)
    -> Result<SubmittedTask>;

    /// Fetch the current state of a job
    async fn query(&self, task_id: &TaskId) -> Result<QueriedTask>;
}

/// DashScope task API client
#[derive(Clone, Debug)]
pub struct DashScopeClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct VendorReply {
    #[serde(default)]
    output: Option<VendorOutput>,
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VendorOutput {
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    task_status: Option<String>,
    #[serde(default)]
    video_url: Option<String>,
    #[serde(default)]
    task_metrics: Option<TaskMetrics>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskMetrics {
    #[serde(rename = "TOTAL", default)]
    total: Option<f64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct VendorError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    request_id: Option<String>,
}

impl DashScopeClient {
    /// Create a client from the synthesis settings
    pub fn new(config: &SynthesisConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.vendor_model.clone(),
        })
    }

    fn api_key(&self) -> Result<&str> {
        self.api_key.as_deref().ok_or_else(|| Error::Config {
            message: "no synthesis API key configured".to_string(),
            key: Some("synthesis.api_key".to_string()),
        })
    }

    async fn read_reply(response: reqwest::Response) -> Result<VendorReply> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let error: VendorError = serde_json::from_str(&body).unwrap_or_default();
            tracing::warn!(
                status = status.as_u16(),
                code = error.code.as_deref().unwrap_or("-"),
                request_id = error.request_id.as_deref().unwrap_or("-"),
                "synthesis vendor rejected request"
            );
            return Err(Error::Vendor {
                code: error.code.unwrap_or_else(|| "UnknownError".to_string()),
                message: error.message.unwrap_or_else(|| format!("request failed with HTTP {status}")),
                request_id: error.request_id,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }
}

/// Protocol violation in a vendor reply
fn protocol_error(message: String, request_id: Option<String>) -> Error {
    Error::Vendor {
        code: "ProtocolError".to_string(),
        message,
        request_id,
    }
}

fn snapshot_from(output: VendorOutput, request_id: &Option<String>) -> Result<TaskSnapshot> {
    let raw_status = output
        .task_status
        .ok_or_else(|| protocol_error("reply has no task_status".to_string(), request_id.clone()))?;

    let status = match raw_status.as_str() {
        // A cancelled job never produces a video
        "CANCELED" => TaskStatus::Failed,
        other => other.parse::<TaskStatus>().map_err(|_| {
            protocol_error(format!("unknown task status {other:?}"), request_id.clone())
        })?,
    };

    let error = match status {
        TaskStatus::Failed => Some(
            output
                .message
                .or(output.code)
                .unwrap_or_else(|| format!("task {}", raw_status.to_lowercase())),
        ),
        _ => None,
    };

    Ok(TaskSnapshot {
        status,
        video_url: output.video_url,
        duration: output.task_metrics.and_then(|m| m.total),
        error,
    })
}

#[async_trait]
impl VideoSynthesis for DashScopeClient {
    async fn submit(
        &self,
        image_url: &str,
        video_url: &str,
        model: ModelType,
    ) -> Result<SubmittedTask> {
        let body = json!({
            "model": self.model,
            "input": {
                "image_url": image_url,
                "video_url": video_url,
            },
            "parameters": {
                "model": model,
            },
        });

        let response = self
            .http
            .post(format!("{}{}", self.base_url, SUBMIT_PATH))
            .bearer_auth(self.api_key()?)
            .header("X-DashScope-Async", "enable")
            .json(&body)
            .send()
            .await?;
        let reply = Self::read_reply(response).await?;

        let task_id = reply
            .output
            .and_then(|o| o.task_id)
            .ok_or_else(|| protocol_error("reply has no task_id".to_string(), reply.request_id.clone()))?;

        tracing::info!(task_id = %task_id, request_id = ?reply.request_id, "synthesis task submitted");
        Ok(SubmittedTask {
            task_id: TaskId::new(task_id),
            request_id: reply.request_id,
        })
    }

    async fn query(&self, task_id: &TaskId) -> Result<QueriedTask> {
        let url = format!(
            "{}{}{}",
            self.base_url,
            TASKS_PATH,
            urlencoding::encode(task_id.as_str())
        );
        let response = self
            .http
            .get(url)
            .bearer_auth(self.api_key()?)
            .send()
            .await?;
        let reply = Self::read_reply(response).await?;

        let output = reply
            .output
            .ok_or_else(|| protocol_error("reply has no output".to_string(), reply.request_id.clone()))?;
        let snapshot = snapshot_from(output, &reply.request_id)?;

        tracing::debug!(task_id = %task_id, status = ?snapshot.status, "synthesis task queried");
        Ok(QueriedTask {
            snapshot,
            request_id: reply.request_id,
        })
    }
}

#[async_trait]
impl TaskQuery for DashScopeClient {
    async fn query(&self, task_id: &TaskId) -> Result<TaskSnapshot> {
        Ok(VideoSynthesis::query(self, task_id).await?.snapshot)
    }
}
