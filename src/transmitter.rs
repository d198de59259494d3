//! Client side of chunked uploads
//!
//! A file is cut into `chunk_size` pieces that are sent strictly in order,
//! one at a time, each with its own retry budget. Once every chunk is
//! acknowledged the endpoint is asked to merge them.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::{MediaLimits, RetryConfig, UploadConfig};
use crate::error::{AssemblyError, Error, Result, ToHttpStatus};
use crate::retry::with_retry;
use crate::types::{ChunkAck, MergeRequest, SessionId, UploadedArtifact};
use crate::validation::check_media;

/// One chunk on its way to the receiver
#[derive(Clone, Debug)]
pub struct ChunkPart {
    /// Upload session the chunk belongs to
    pub session_id: SessionId,
    /// Original file name
    pub file_name: String,
    /// Zero-based position
    pub chunk_index: u32,
    /// Number of chunks in the session
    pub total_chunks: u32,
    /// Chunk bytes
    pub data: Bytes,
}

/// Where chunks, merges and small files are sent
#[async_trait]
pub trait UploadEndpoint: Send + Sync {
    /// Deliver one chunk
    async fn send_chunk(&self, part: &ChunkPart) -> Result<ChunkAck>;

    /// Assemble a fully transmitted session
    async fn merge(&self, request: &MergeRequest) -> Result<UploadedArtifact>;

    /// Store a small file in one request
    async fn upload_file(&self, file_name: &str, data: Bytes) -> Result<UploadedArtifact>;
}

/// Number of chunks for a file; an empty file still sends one empty chunk
///
/// Fails when the count does not fit the `u32` chunk index of the wire format.
pub fn chunk_count(size: u64, chunk_size: usize) -> Result<u32> {
    let chunk_size = chunk_size.max(1) as u64;
    let count = size.div_ceil(chunk_size).max(1);
    u32::try_from(count).map_err(|_| {
        Error::InvalidParameter(format!(
            "{size} bytes in {chunk_size} byte chunks needs {count} chunks, more than {}",
            u32::MAX
        ))
    })
}

/// Splits files into chunks and uploads them
pub struct ChunkTransmitter<E> {
    endpoint: E,
    chunk_size: usize,
    retry: RetryConfig,
    limits: Option<MediaLimits>,
}

impl<E: UploadEndpoint> ChunkTransmitter<E> {
    /// Create a transmitter with the chunk size, retry policy and limits of `config`
    pub fn new(endpoint: E, config: &UploadConfig) -> Self {
        Self {
            endpoint,
            chunk_size: config.chunk_size.max(1),
            retry: config.retry.clone(),
            limits: Some(config.limits.clone()),
        }
    }

    /// Skip the local media type and size check
    pub fn without_validation(mut self) -> Self {
        self.limits = None;
        self
    }

    /// The endpoint chunks are sent to
    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    /// Upload the file at `path` in chunks
    ///
    /// `on_progress` receives the percentage of acknowledged chunks after
    /// each one.
    pub async fn transmit(
        &self,
        path: impl AsRef<Path>,
        on_progress: impl FnMut(f64) + Send,
    ) -> Result<UploadedArtifact> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::InvalidParameter(format!("{} has no usable file name", path.display()))
            })?
            .to_string();
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        self.transmit_reader(file, &file_name, size, on_progress)
            .await
    }

    /// Upload `size` bytes read from `reader` in chunks
    pub async fn transmit_reader<R>(
        &self,
        mut reader: R,
        file_name: &str,
        size: u64,
        mut on_progress: impl FnMut(f64) + Send,
    ) -> Result<UploadedArtifact>
    where
        R: AsyncRead + Unpin + Send,
    {
        if let Some(limits) = &self.limits {
            check_media(file_name, size, limits)?;
        }

        let session_id = SessionId::generate(file_name);
        let total_chunks = chunk_count(size, self.chunk_size)?;
        tracing::info!(
            session_id = %session_id,
            file_name,
            size,
            total_chunks,
            chunk_size = self.chunk_size,
            "starting chunked upload"
        );

        let mut uploaded = 0u32;
        for chunk_index in 0..total_chunks {
            let offset = chunk_index as u64 * self.chunk_size as u64;
            let expected = (size - offset).min(self.chunk_size as u64);
            let data = read_chunk(&mut reader, expected).await?;

            let part = ChunkPart {
                session_id: session_id.clone(),
                file_name: file_name.to_string(),
                chunk_index,
                total_chunks,
                data,
            };
            with_retry(&self.retry, || self.endpoint.send_chunk(&part))
                .await
                .map_err(|exhausted| Error::ChunkUpload {
                    chunk_index,
                    attempts: exhausted.attempts,
                    reason: exhausted.error.to_string(),
                })?;

            uploaded += 1;
            tracing::debug!(session_id = %session_id, chunk_index, "chunk acknowledged");
            on_progress(uploaded as f64 / total_chunks as f64 * 100.0);
        }

        let merge = MergeRequest {
            file_id: session_id.to_string(),
            file_name: file_name.to_string(),
            total_chunks,
        };
        let artifact = self.endpoint.merge(&merge).await.map_err(|e| match e {
            Error::Assembly(inner) => Error::Assembly(inner),
            other => AssemblyError::MergeRejected {
                status: other.status_code(),
                message: other.to_string(),
            }
            .into(),
        })?;

        tracing::info!(session_id = %session_id, url = %artifact.url, "chunked upload complete");
        Ok(artifact)
    }

    /// Upload a small file in a single request
    pub async fn upload_small(&self, path: impl AsRef<Path>) -> Result<UploadedArtifact> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::InvalidParameter(format!("{} has no usable file name", path.display()))
            })?
            .to_string();
        let data = tokio::fs::read(path).await?;
        if let Some(limits) = &self.limits {
            check_media(&file_name, data.len() as u64, limits)?;
        }
        self.endpoint.upload_file(&file_name, Bytes::from(data)).await
    }
}

/// Read exactly `len` bytes; a short read means the file shrank mid-upload
async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, len: u64) -> Result<Bytes> {
    let mut buf = Vec::with_capacity(len as usize);
    reader.take(len).read_to_end(&mut buf).await?;
    if (buf.len() as u64) < len {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("expected {len} bytes, source ended after {}", buf.len()),
        )));
    }
    Ok(Bytes::from(buf))
}
