//! Server side of chunk transmission

use bytes::Bytes;
use std::sync::Arc;

use crate::config::MediaLimits;
use crate::error::{Error, Result};
use crate::storage::Storage;
use crate::types::{ChunkAck, MediaKind, SessionId, UploadedArtifact};
use crate::validation::sanitize_file_name;

/// Persists incoming chunks and small whole-file uploads
///
/// The receiver never checks ordering or completeness; that is the
/// assembler's job once the client asks for a merge.
#[derive(Clone)]
pub struct ChunkReceiver {
    storage: Arc<dyn Storage>,
    limits: MediaLimits,
    public_path: String,
}

impl ChunkReceiver {
    /// Create a receiver writing to `storage`
    pub fn new(storage: Arc<dyn Storage>, limits: MediaLimits, public_path: impl Into<String>) -> Self {
        Self {
            storage,
            limits,
            public_path: public_path.into(),
        }
    }

    /// Stage one chunk
    ///
    /// Re-sending an index overwrites the earlier write. When `total_chunks`
    /// is known, indices at or beyond it are rejected.
    pub async fn receive_chunk(
        &self,
        session_id: &str,
        chunk_index: u32,
        total_chunks: Option<u32>,
        data: Bytes,
    ) -> Result<ChunkAck> {
        let session = SessionId::parse(session_id)?;
        if let Some(total) = total_chunks
            && chunk_index >= total
        {
            return Err(Error::InvalidParameter(format!(
                "chunk index {chunk_index} is out of range for {total} chunks"
            )));
        }
        if data.len() as u64 > self.limits.max_video_bytes {
            return Err(Error::PayloadTooLarge {
                size: data.len() as u64,
                limit: self.limits.max_video_bytes,
            });
        }

        let size = data.len();
        self.storage.put_chunk(&session, chunk_index, data).await?;

        tracing::debug!(
            session_id = %session,
            chunk_index,
            total_chunks,
            bytes = size,
            "chunk received"
        );
        Ok(ChunkAck {
            chunk_index,
            received: true,
        })
    }

    /// Store a small file directly as an artifact
    ///
    /// The media type comes from the declared content type when it names
    /// one, else from the extension.
    pub async fn store_whole_file(
        &self,
        file_name: &str,
        content_type: Option<&str>,
        data: Bytes,
    ) -> Result<UploadedArtifact> {
        if file_name.trim().is_empty() {
            return Err(Error::InvalidParameter("no file uploaded".to_string()));
        }

        let kind = match content_type {
            Some(mime) if mime.starts_with("image/") => MediaKind::Image,
            Some(mime) if mime.starts_with("video/") => MediaKind::Video,
            _ => MediaKind::from_file_name(file_name),
        };
        let limit = match kind {
            MediaKind::Image => self.limits.max_image_bytes,
            MediaKind::Video => self.limits.max_video_bytes,
        };
        let size = data.len() as u64;
        if size > limit {
            return Err(Error::PayloadTooLarge { size, limit });
        }

        let name = artifact_name(file_name);
        self.storage.put_artifact(&name, data).await?;

        tracing::info!(artifact = %name, bytes = size, kind = kind.as_str(), "stored whole-file upload");
        Ok(UploadedArtifact {
            url: artifact_url(&self.public_path, &name),
            kind,
        })
    }
}

/// Globally unique artifact name: `<uuid-v4>-<sanitised file name>`
pub(crate) fn artifact_name(file_name: &str) -> String {
    format!("{}-{}", uuid::Uuid::new_v4(), sanitize_file_name(file_name))
}

/// Public URL path of an artifact
pub(crate) fn artifact_url(public_path: &str, name: &str) -> String {
    format!("{}/{}", public_path.trim_end_matches('/'), name)
}
