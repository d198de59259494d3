//! Error types for synthgate
//!
//! This module provides error handling for the whole crate, including:
//! - Domain-specific error types (chunk upload, assembly, polling, vendor)
//! - HTTP status code mapping for API integration
//! - The uniform `{success: false, error: {code, message}}` wire shape

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use utoipa::ToSchema;

/// Result type alias for synthgate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for synthgate
///
/// Transient variants ([`Error::Network`], [`Error::ChunkRejected`]) are retried
/// locally and only surface once a retry budget is exhausted, at which point
/// they are converted to [`Error::ChunkUpload`] or [`Error::NetworkExhausted`].
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "upload.chunk_size")
        key: Option<String>,
    },

    /// A required input was missing or malformed
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport failure contacting a collaborator
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A single chunk send got a non-success response (retryable)
    #[error("chunk {chunk_index} upload failed with HTTP {status}")]
    ChunkRejected {
        /// Index of the rejected chunk
        chunk_index: u32,
        /// HTTP status returned by the receiver
        status: u16,
    },

    /// A chunk exhausted its retry budget
    #[error("failed to upload chunk {chunk_index} after {attempts} attempts: {reason}")]
    ChunkUpload {
        /// Index of the chunk that could not be delivered
        chunk_index: u32,
        /// Number of attempts made
        attempts: u32,
        /// The last failure observed
        reason: String,
    },

    /// Merging staged chunks failed
    #[error("assembly error: {0}")]
    Assembly(#[from] AssemblyError),

    /// Storage backend failure (object store replies, corrupt staging layout)
    #[error("storage error: {0}")]
    Storage(String),

    /// Requested resource does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The synthesis vendor rejected a request
    #[error("vendor error {code}: {message}")]
    Vendor {
        /// Vendor-supplied machine-readable code
        code: String,
        /// Vendor-supplied message
        message: String,
        /// Vendor request id, when provided
        request_id: Option<String>,
    },

    /// The remote task reached FAILED
    #[error("task failed: {0}")]
    TaskFailed(String),

    /// The poller gave up waiting for a terminal status
    #[error("processing timed out after {}s, please retry later", .after.as_secs())]
    Timeout {
        /// The configured overall timeout
        after: Duration,
    },

    /// Consecutive status queries failed until the failure cap was hit
    #[error(
        "network error after {attempts} consecutive failed status queries, check the connection and retry: {last_error}"
    )]
    NetworkExhausted {
        /// Consecutive failures observed
        attempts: u32,
        /// The last transport failure
        last_error: String,
    },

    /// Missing or invalid API key
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Upload exceeds the configured size limit
    #[error("payload too large: {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge {
        /// Size of the rejected payload
        size: u64,
        /// Configured limit
        limit: u64,
    },

    /// Operation not supported by the configured backend
    #[error("not supported: {0}")]
    NotSupported(String),

    /// API server error
    #[error("API server error: {0}")]
    ApiServerError(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Errors raised while merging staged chunks into an artifact
#[derive(Debug, Error)]
pub enum AssemblyError {
    /// One or more expected chunks were never staged
    #[error("session {session_id} is missing chunks {missing:?}")]
    MissingChunks {
        /// The upload session being merged
        session_id: String,
        /// Indices of the absent chunks, ascending
        missing: Vec<u32>,
    },

    /// The artifact could not be written or committed
    #[error("failed to commit artifact {artifact}: {reason}")]
    CommitFailed {
        /// The artifact name being written
        artifact: String,
        /// The underlying failure
        reason: String,
    },

    /// The gateway refused the merge request (client side)
    #[error("merge request rejected with HTTP {status}: {message}")]
    MergeRejected {
        /// HTTP status of the merge response
        status: u16,
        /// Message from the error envelope, if any
        message: String,
    },
}

/// API error response format
///
/// Every failed gateway response carries this body.
///
/// # Example JSON Response
///
/// ```json
/// {
///   "success": false,
///   "error": {
///     "code": "AssemblyError",
///     "message": "assembly error: session 1-ab-clip.mp4 is missing chunks [2]",
///     "details": { "sessionId": "1-ab-clip.mp4", "missing": [2] }
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    /// Always `false`
    pub success: bool,
    /// The error details
    pub error: ErrorDetail,
}

/// Detailed error information for API responses
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    /// Machine-readable error code (e.g., "InvalidParameter", "Timeout")
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// Upstream request id, when the failure came from the synthesis vendor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Optional additional context about the error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error with code and message
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                request_id: None,
                details: None,
            },
        }
    }

    /// Create an API error with additional details
    pub fn with_details(
        code: impl Into<String>,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        let mut api_error = Self::new(code, message);
        api_error.error.details = Some(details);
        api_error
    }

    /// Create an "invalid parameter" error
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::new("InvalidParameter", message)
    }

    /// Create an "internal error"
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("InternalError", message)
    }
}

/// Convert errors to HTTP status codes for API responses
pub trait ToHttpStatus {
    /// Get the HTTP status code for this error
    fn status_code(&self) -> u16;

    /// Get the machine-readable error code
    fn error_code(&self) -> &str;
}

impl ToHttpStatus for Error {
    fn status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - Client error (invalid input)
            Error::InvalidParameter(_) => 400,
            Error::Vendor { .. } => 400,

            // 401 / 404 / 413
            Error::Unauthorized(_) => 401,
            Error::NotFound(_) => 404,
            Error::PayloadTooLarge { .. } => 413,

            // 422 Unprocessable Entity - Semantic errors
            Error::Assembly(AssemblyError::MissingChunks { .. }) => 422,
            Error::TaskFailed(_) => 422,

            // 500 Internal Server Error - Server-side issues
            Error::Config { .. } => 500,
            Error::Io(_) => 500,
            Error::Serialization(_) => 500,
            Error::Storage(_) => 500,
            Error::Assembly(AssemblyError::CommitFailed { .. }) => 500,
            Error::ApiServerError(_) => 500,
            Error::Other(_) => 500,

            // 501 Not Implemented - Feature not supported
            Error::NotSupported(_) => 501,

            // 502 Bad Gateway - Collaborator errors
            Error::Network(_) => 502,
            Error::ChunkRejected { .. } => 502,
            Error::ChunkUpload { .. } => 502,
            Error::NetworkExhausted { .. } => 502,
            Error::Assembly(AssemblyError::MergeRejected { .. }) => 502,

            // 504 Gateway Timeout
            Error::Timeout { .. } => 504,
        }
    }

    fn error_code(&self) -> &str {
        match self {
            Error::Config { .. } => "ConfigError",
            Error::InvalidParameter(_) => "InvalidParameter",
            Error::Io(_) => "InternalError",
            Error::Network(_) => "NetworkError",
            Error::Serialization(_) => "InternalError",
            Error::ChunkRejected { .. } => "UploadError",
            Error::ChunkUpload { .. } => "ChunkUploadError",
            Error::Assembly(_) => "AssemblyError",
            Error::Storage(_) => "InternalError",
            Error::NotFound(_) => "NotFound",
            Error::Vendor { code, .. } => code,
            Error::TaskFailed(_) => "TaskFailed",
            Error::Timeout { .. } => "Timeout",
            Error::NetworkExhausted { .. } => "NetworkExhausted",
            Error::Unauthorized(_) => "Unauthorized",
            Error::PayloadTooLarge { .. } => "PayloadTooLarge",
            Error::NotSupported(_) => "NotSupported",
            Error::ApiServerError(_) => "InternalError",
            Error::Other(_) => "InternalError",
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let code = error.error_code().to_string();
        let message = error.to_string();

        let request_id = match &error {
            Error::Vendor { request_id, .. } => request_id.clone(),
            _ => None,
        };

        // Add contextual details for specific error types
        let details = match &error {
            Error::ChunkUpload {
                chunk_index,
                attempts,
                ..
            } => Some(serde_json::json!({
                "chunkIndex": chunk_index,
                "attempts": attempts,
            })),
            Error::Assembly(AssemblyError::MissingChunks {
                session_id,
                missing,
            }) => Some(serde_json::json!({
                "sessionId": session_id,
                "missing": missing,
            })),
            Error::PayloadTooLarge { size, limit } => Some(serde_json::json!({
                "size": size,
                "limit": limit,
            })),
            Error::Timeout { after } => Some(serde_json::json!({
                "timeoutSecs": after.as_secs(),
            })),
            Error::NetworkExhausted { attempts, .. } => Some(serde_json::json!({
                "attempts": attempts,
            })),
            _ => None,
        };

        ApiError {
            success: false,
            error: ErrorDetail {
                code,
                message,
                request_id,
                details,
            },
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    /// Returns (Error, expected_status_code, expected_error_code) for every
    /// reachable match arm in ToHttpStatus that does not need a live transport.
    fn all_error_variants() -> Vec<(Error, u16, &'static str)> {
        vec![
            (
                Error::Config {
                    message: "chunk size must be positive".into(),
                    key: Some("upload.chunk_size".into()),
                },
                500,
                "ConfigError",
            ),
            (
                Error::InvalidParameter("missing taskId".into()),
                400,
                "InvalidParameter",
            ),
            (
                Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone")),
                500,
                "InternalError",
            ),
            (
                Error::ChunkRejected {
                    chunk_index: 1,
                    status: 503,
                },
                502,
                "UploadError",
            ),
            (
                Error::ChunkUpload {
                    chunk_index: 2,
                    attempts: 3,
                    reason: "HTTP 500".into(),
                },
                502,
                "ChunkUploadError",
            ),
            (
                Error::Assembly(AssemblyError::MissingChunks {
                    session_id: "s".into(),
                    missing: vec![1],
                }),
                422,
                "AssemblyError",
            ),
            (
                Error::Assembly(AssemblyError::CommitFailed {
                    artifact: "a.mp4".into(),
                    reason: "disk full".into(),
                }),
                500,
                "AssemblyError",
            ),
            (
                Error::Assembly(AssemblyError::MergeRejected {
                    status: 500,
                    message: "boom".into(),
                }),
                502,
                "AssemblyError",
            ),
            (Error::Storage("bad reply".into()), 500, "InternalError"),
            (Error::NotFound("artifact x".into()), 404, "NotFound"),
            (
                Error::Vendor {
                    code: "InvalidApiKey".into(),
                    message: "key rejected".into(),
                    request_id: Some("req-1".into()),
                },
                400,
                "InvalidApiKey",
            ),
            (Error::TaskFailed("bad input".into()), 422, "TaskFailed"),
            (
                Error::Timeout {
                    after: Duration::from_secs(300),
                },
                504,
                "Timeout",
            ),
            (
                Error::NetworkExhausted {
                    attempts: 3,
                    last_error: "connection refused".into(),
                },
                502,
                "NetworkExhausted",
            ),
            (Error::Unauthorized("no key".into()), 401, "Unauthorized"),
            (
                Error::PayloadTooLarge {
                    size: 20,
                    limit: 10,
                },
                413,
                "PayloadTooLarge",
            ),
            (
                Error::NotSupported("sweep".into()),
                501,
                "NotSupported",
            ),
            (
                Error::ApiServerError("bind failed".into()),
                500,
                "InternalError",
            ),
            (Error::Other("unknown".into()), 500, "InternalError"),
        ]
    }

    #[test]
    fn every_variant_maps_to_expected_status_code() {
        for (error, expected_status, _) in all_error_variants() {
            assert_eq!(
                error.status_code(),
                expected_status,
                "unexpected status for {error:?}"
            );
        }
    }

    #[test]
    fn every_variant_maps_to_expected_error_code() {
        for (error, _, expected_code) in all_error_variants() {
            assert_eq!(
                error.error_code(),
                expected_code,
                "unexpected code for {error:?}"
            );
        }
    }

    #[test]
    fn api_error_is_never_successful() {
        let api_error = ApiError::invalid_parameter("missing file");
        assert!(!api_error.success);
        assert_eq!(api_error.error.code, "InvalidParameter");

        let json = serde_json::to_value(&api_error).unwrap();
        assert_eq!(json["success"], false);
        assert!(json["error"].get("requestId").is_none());
    }

    #[test]
    fn api_error_from_chunk_upload_has_index_and_attempts() {
        let api_error: ApiError = Error::ChunkUpload {
            chunk_index: 4,
            attempts: 3,
            reason: "HTTP 503".into(),
        }
        .into();

        let details = api_error.error.details.unwrap();
        assert_eq!(details["chunkIndex"], 4);
        assert_eq!(details["attempts"], 3);
        assert!(api_error.error.message.contains("chunk 4"));
    }

    #[test]
    fn api_error_from_missing_chunks_lists_indices() {
        let api_error: ApiError = Error::Assembly(AssemblyError::MissingChunks {
            session_id: "17-ab12cd34-clip.mp4".into(),
            missing: vec![0, 2],
        })
        .into();

        let details = api_error.error.details.unwrap();
        assert_eq!(details["sessionId"], "17-ab12cd34-clip.mp4");
        assert_eq!(details["missing"], serde_json::json!([0, 2]));
    }

    #[test]
    fn api_error_from_vendor_carries_request_id() {
        let api_error: ApiError = Error::Vendor {
            code: "Throttling".into(),
            message: "slow down".into(),
            request_id: Some("req-9".into()),
        }
        .into();

        assert_eq!(api_error.error.code, "Throttling");
        assert_eq!(api_error.error.request_id.as_deref(), Some("req-9"));

        let json = serde_json::to_value(&api_error).unwrap();
        assert_eq!(json["error"]["requestId"], "req-9");
    }

    #[test]
    fn timeout_message_mentions_seconds() {
        let error = Error::Timeout {
            after: Duration::from_secs(300),
        };
        assert!(error.to_string().contains("300s"));

        let api_error: ApiError = error.into();
        assert_eq!(api_error.error.details.unwrap()["timeoutSecs"], 300);
    }

    #[test]
    fn api_error_from_io_has_no_details() {
        let api_error: ApiError =
            Error::Io(std::io::Error::other("disk on fire")).into();
        assert!(api_error.error.details.is_none());
        assert_eq!(api_error.error.code, "InternalError");
    }
}
