//! Staging and artifact storage
//!
//! Staged chunks are keyed by `(session, chunk index)`; artifacts by their
//! generated name. The receiver, assembler and janitor only talk to the
//! [`Storage`] trait, so the gateway runs unchanged on a local disk, an
//! S3-compatible bucket or process memory.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::Result;
use crate::types::SessionId;

mod fs;
mod memory;
mod object;

pub use fs::FilesystemStorage;
pub use memory::MemoryStorage;
pub use object::ObjectStorage;

/// Boxed byte source handed out by storage backends
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Durable home for staged chunks and assembled artifacts
#[async_trait]
pub trait Storage: Send + Sync {
    /// Short backend name used in logs and health output
    fn backend_name(&self) -> &'static str;

    /// Store one chunk, replacing any previous write of the same index
    async fn put_chunk(&self, session: &SessionId, index: u32, data: Bytes) -> Result<()>;

    /// Open a staged chunk, `None` if it was never stored
    async fn open_chunk(&self, session: &SessionId, index: u32) -> Result<Option<ByteReader>>;

    /// Whether a chunk is staged
    async fn chunk_exists(&self, session: &SessionId, index: u32) -> Result<bool>;

    /// Remove every staged chunk of a session
    ///
    /// `total_chunks` bounds the indices for backends that cannot list.
    async fn delete_session(&self, session: &SessionId, total_chunks: u32) -> Result<()>;

    /// Start writing an artifact; nothing is visible until [`ArtifactSink::commit`]
    async fn create_artifact(&self, name: &str) -> Result<Box<dyn ArtifactSink>>;

    /// Open an artifact for reading along with its length
    async fn open_artifact(&self, name: &str) -> Result<Option<(ByteReader, u64)>>;

    /// Delete staged sessions untouched for longer than `older_than`
    ///
    /// Returns the number of sessions removed.
    async fn sweep_staging(&self, older_than: Duration) -> Result<usize>;

    /// Store a complete artifact in one call
    async fn put_artifact(&self, name: &str, data: Bytes) -> Result<u64> {
        let mut sink = self.create_artifact(name).await?;
        if let Err(e) = sink.write(data).await {
            sink.abort().await;
            return Err(e);
        }
        sink.commit().await
    }
}

/// In-progress artifact write
#[async_trait]
pub trait ArtifactSink: Send {
    /// Append bytes to the artifact
    async fn write(&mut self, data: Bytes) -> Result<()>;

    /// Flush and publish the artifact, returning its total length
    async fn commit(self: Box<Self>) -> Result<u64>;

    /// Discard everything written so far
    async fn abort(self: Box<Self>);
}

/// Build the backend selected in `config`
pub fn from_config(config: &StorageConfig) -> Result<Arc<dyn Storage>> {
    let storage: Arc<dyn Storage> = match config.backend {
        StorageBackend::Filesystem => Arc::new(FilesystemStorage::new(
            config.staging_dir.clone(),
            config.artifact_dir.clone(),
        )),
        StorageBackend::Memory => Arc::new(MemoryStorage::new()),
        StorageBackend::Object => Arc::new(ObjectStorage::new(config.object.clone())?),
    };
    tracing::debug!(backend = storage.backend_name(), "storage backend ready");
    Ok(storage)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    pub(crate) async fn read_all(mut reader: ByteReader) -> Vec<u8> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        buf
    }

    /// Behaviour every backend must share
    async fn exercise(storage: &dyn Storage) {
        let session = SessionId::parse("1-abcd0123-clip.mp4").unwrap();

        assert!(!storage.chunk_exists(&session, 0).await.unwrap());
        assert!(storage.open_chunk(&session, 0).await.unwrap().is_none());

        storage
            .put_chunk(&session, 0, Bytes::from_static(b"first"))
            .await
            .unwrap();
        storage
            .put_chunk(&session, 0, Bytes::from_static(b"again"))
            .await
            .unwrap();
        assert!(storage.chunk_exists(&session, 0).await.unwrap());
        let chunk = storage.open_chunk(&session, 0).await.unwrap().unwrap();
        assert_eq!(read_all(chunk).await, b"again");

        storage.delete_session(&session, 1).await.unwrap();
        assert!(!storage.chunk_exists(&session, 0).await.unwrap());
        // Deleting twice is fine
        storage.delete_session(&session, 1).await.unwrap();

        let mut sink = storage.create_artifact("a-clip.mp4").await.unwrap();
        sink.write(Bytes::from_static(b"hello ")).await.unwrap();
        assert!(storage.open_artifact("a-clip.mp4").await.unwrap().is_none());
        sink.write(Bytes::from_static(b"world")).await.unwrap();
        assert_eq!(sink.commit().await.unwrap(), 11);

        let (reader, len) = storage.open_artifact("a-clip.mp4").await.unwrap().unwrap();
        assert_eq!(len, 11);
        assert_eq!(read_all(reader).await, b"hello world");

        let sink = storage.create_artifact("b-photo.png").await.unwrap();
        sink.abort().await;
        assert!(storage.open_artifact("b-photo.png").await.unwrap().is_none());

        assert_eq!(
            storage
                .put_artifact("c-photo.png", Bytes::from_static(b"png"))
                .await
                .unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn filesystem_backend_contract() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path().join("chunks"), dir.path().join("uploads"));
        exercise(&storage).await;
    }

    #[tokio::test]
    async fn memory_backend_contract() {
        exercise(&MemoryStorage::new()).await;
    }

    #[test]
    fn from_config_selects_backend() {
        let mut config = StorageConfig {
            backend: StorageBackend::Memory,
            ..Default::default()
        };
        assert_eq!(from_config(&config).unwrap().backend_name(), "memory");

        config.backend = StorageBackend::Filesystem;
        assert_eq!(from_config(&config).unwrap().backend_name(), "filesystem");
    }
}
