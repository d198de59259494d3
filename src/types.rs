//! Core types for synthgate

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use utoipa::ToSchema;

use crate::error::{Error, Result};
use crate::validation::sanitize_file_name;

/// Longest accepted session id
const MAX_SESSION_ID_LEN: usize = 200;

/// Identifier grouping the chunks of one upload
///
/// Generated client-side from the submission time, a random component and the
/// file name, so two concurrent uploads of `clip.mp4` never share a session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Create a fresh session id for `file_name`
    pub fn generate(file_name: &str) -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let nonce: u32 = rand::random();
        let mut id = format!("{millis}-{nonce:08x}-{}", sanitize_file_name(file_name));
        id.truncate(MAX_SESSION_ID_LEN);
        Self(id)
    }

    /// Validate an id received over the wire
    ///
    /// Only `[A-Za-z0-9._-]` is accepted so the id is safe to embed in a
    /// storage path or object key.
    pub fn parse(raw: &str) -> Result<Self> {
        let valid_chars = raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
        if raw.is_empty()
            || raw.len() > MAX_SESSION_ID_LEN
            || !valid_chars
            || raw == "."
            || raw == ".."
        {
            return Err(Error::InvalidParameter(format!(
                "invalid upload session id {raw:?}"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    /// Borrow the id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SessionId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Coarse media classification of an upload
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Still image (reference photo)
    Image,
    /// Video (reference motion clip)
    Video,
}

impl MediaKind {
    /// Classify by suffix: names ending in `.mp4`, `.mov` or `.avi` (any case)
    /// are video, anything else image
    pub fn from_file_name(file_name: &str) -> Self {
        const VIDEO_SUFFIXES: [&str; 3] = [".mp4", ".mov", ".avi"];
        let name = file_name.as_bytes();
        let is_video = VIDEO_SUFFIXES.iter().any(|suffix| {
            name.len() >= suffix.len()
                && name[name.len() - suffix.len()..].eq_ignore_ascii_case(suffix.as_bytes())
        });
        if is_video { MediaKind::Video } else { MediaKind::Image }
    }

    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }
}

/// Stable reference to an assembled or directly stored upload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct UploadedArtifact {
    /// Servable URL path, e.g. `/uploads/3f2c...-clip.mp4`
    pub url: String,
    /// Media classification
    #[serde(rename = "type")]
    pub kind: MediaKind,
}

/// Acknowledgement for one received chunk
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    /// Index of the stored chunk
    pub chunk_index: u32,
    /// Always `true` when returned
    pub received: bool,
}

/// Body of the merge request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    /// Upload session to assemble
    pub file_id: String,
    /// Original file name
    pub file_name: String,
    /// Number of chunks the client sent
    pub total_chunks: u32,
}

/// Identifier of a remote synthesis job
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create a new TaskId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remote task status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Accepted, not started
    Pending,
    /// In progress
    Running,
    /// Finished with a video
    Succeeded,
    /// Finished with an error
    Failed,
}

impl TaskStatus {
    /// Whether no further transition can occur
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "RUNNING" => Ok(TaskStatus::Running),
            "SUCCEEDED" => Ok(TaskStatus::Succeeded),
            "FAILED" => Ok(TaskStatus::Failed),
            other => Err(Error::Other(format!("unknown task status {other:?}"))),
        }
    }
}

/// One observation of a remote task
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    /// Current status
    pub status: TaskStatus,
    /// Result video, once succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    /// Video duration in seconds, once succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// Failure message, once failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskSnapshot {
    /// Snapshot carrying only a status
    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            status,
            video_url: None,
            duration: None,
            error: None,
        }
    }
}

/// Synthesis quality tier
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    /// Standard quality (default)
    #[default]
    Std,
    /// Professional quality
    Pro,
}

/// Body of the create-task request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    /// URL of the reference photo
    pub image_url: Option<String>,
    /// URL of the reference motion video
    pub video_url: Option<String>,
    /// Quality tier
    pub model: Option<ModelType>,
}

/// Reply of the create-task request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskResponse {
    /// Identifier to poll
    pub task_id: TaskId,
}

/// Successful gateway response envelope
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    /// Always `true`
    pub success: bool,
    /// Payload
    pub data: T,
    /// Upstream request id, when the payload came from the synthesis vendor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl<T> ApiResponse<T> {
    /// Wrap a payload
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            request_id: None,
        }
    }

    /// Wrap a payload that came from the vendor
    pub fn with_request_id(data: T, request_id: Option<String>) -> Self {
        Self {
            success: true,
            data,
            request_id,
        }
    }
}
