//! Merges staged chunks into a final artifact

use futures::StreamExt;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio_util::io::ReaderStream;

use crate::error::{AssemblyError, Error, Result};
use crate::receiver::{artifact_name, artifact_url};
use crate::storage::{ArtifactSink, Storage};
use crate::types::{MediaKind, SessionId, UploadedArtifact};

/// Read buffer used while copying chunks into the artifact
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Concatenates a session's chunks, in index order, into one artifact
#[derive(Clone)]
pub struct Assembler {
    storage: Arc<dyn Storage>,
    public_path: String,
    merging: Arc<Mutex<HashSet<String>>>,
}

impl Assembler {
    /// Create an assembler over `storage`
    pub fn new(storage: Arc<dyn Storage>, public_path: impl Into<String>) -> Self {
        Self {
            storage,
            public_path: public_path.into(),
            merging: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Assemble chunks `0..total_chunks` of `session_id`
    ///
    /// Fails with [`AssemblyError::MissingChunks`] before writing anything if
    /// any chunk is absent. The staged chunks are deleted only after the
    /// artifact is committed; a failed commit keeps them so the merge can be
    /// retried.
    pub async fn assemble(
        &self,
        session_id: &str,
        file_name: &str,
        total_chunks: u32,
    ) -> Result<UploadedArtifact> {
        let session = SessionId::parse(session_id)?;
        if file_name.trim().is_empty() {
            return Err(Error::InvalidParameter("file name is required".to_string()));
        }
        if total_chunks == 0 {
            return Err(Error::InvalidParameter(
                "total chunks must be at least 1".to_string(),
            ));
        }

        let _guard = MergeGuard::acquire(&self.merging, &session).ok_or_else(|| {
            Error::InvalidParameter(format!("session {session} is already being merged"))
        })?;
        self.assemble_locked(&session, file_name, total_chunks).await
    }

    async fn assemble_locked(
        &self,
        session: &SessionId,
        file_name: &str,
        total_chunks: u32,
    ) -> Result<UploadedArtifact> {
        let mut missing = Vec::new();
        for index in 0..total_chunks {
            if !self.storage.chunk_exists(session, index).await? {
                missing.push(index);
            }
        }
        if !missing.is_empty() {
            tracing::warn!(session_id = %session, ?missing, "cannot merge incomplete session");
            return Err(AssemblyError::MissingChunks {
                session_id: session.to_string(),
                missing,
            }
            .into());
        }

        let name = artifact_name(file_name);
        let mut sink = self
            .storage
            .create_artifact(&name)
            .await
            .map_err(|e| commit_failed(&name, e))?;

        if let Err(e) = self.copy_chunks(session, total_chunks, sink.as_mut()).await {
            sink.abort().await;
            return Err(match e {
                Error::Assembly(inner) => Error::Assembly(inner),
                other => commit_failed(&name, other),
            });
        }
        let size = sink.commit().await.map_err(|e| commit_failed(&name, e))?;

        if let Err(e) = self.storage.delete_session(session, total_chunks).await {
            // The artifact is already published; the janitor picks up leftovers
            tracing::warn!(session_id = %session, error = %e, "failed to clean staged chunks");
        }

        let kind = MediaKind::from_file_name(file_name);
        tracing::info!(
            session_id = %session,
            artifact = %name,
            chunks = total_chunks,
            bytes = size,
            kind = kind.as_str(),
            "assembled upload"
        );
        Ok(UploadedArtifact {
            url: artifact_url(&self.public_path, &name),
            kind,
        })
    }

    async fn copy_chunks(
        &self,
        session: &SessionId,
        total_chunks: u32,
        sink: &mut dyn ArtifactSink,
    ) -> Result<()> {
        for index in 0..total_chunks {
            // A chunk can vanish between the existence check and here (janitor)
            let reader = self.storage.open_chunk(session, index).await?.ok_or_else(|| {
                AssemblyError::MissingChunks {
                    session_id: session.to_string(),
                    missing: vec![index],
                }
            })?;

            let mut stream = ReaderStream::with_capacity(reader, COPY_BUFFER_SIZE);
            while let Some(buf) = stream.next().await {
                sink.write(buf?).await?;
            }
        }
        Ok(())
    }
}

fn commit_failed(artifact: &str, error: Error) -> Error {
    AssemblyError::CommitFailed {
        artifact: artifact.to_string(),
        reason: error.to_string(),
    }
    .into()
}

/// Marks a session as merging until dropped, including when the merge future is cancelled
struct MergeGuard {
    merging: Arc<Mutex<HashSet<String>>>,
    session: String,
}

impl MergeGuard {
    fn acquire(merging: &Arc<Mutex<HashSet<String>>>, session: &SessionId) -> Option<Self> {
        let inserted = merging
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(session.as_str().to_string());
        inserted.then(|| Self {
            merging: Arc::clone(merging),
            session: session.as_str().to_string(),
        })
    }
}

impl Drop for MergeGuard {
    fn drop(&mut self) {
        self.merging
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.session);
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ByteReader, FilesystemStorage, MemoryStorage};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    async fn stage(storage: &dyn Storage, session: &str, data: &[u8], chunk_size: usize) -> u32 {
        let session = SessionId::parse(session).unwrap();
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[][..]]
        } else {
            data.chunks(chunk_size).collect()
        };
        for (i, chunk) in chunks.iter().enumerate() {
            storage
                .put_chunk(&session, i as u32, Bytes::copy_from_slice(chunk))
                .await
                .unwrap();
        }
        chunks.len() as u32
    }

    async fn artifact_bytes(storage: &dyn Storage, url: &str) -> Vec<u8> {
        let name = url.rsplit('/').next().unwrap();
        let (mut reader, len) = storage.open_artifact(name).await.unwrap().unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(len, buf.len() as u64);
        buf
    }

    #[tokio::test]
    async fn round_trip_for_many_chunk_sizes() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 251) as u8).collect();
        for chunk_size in [1, 2, 3, 7, 64, 999, 1000, 4096] {
            let storage = MemoryStorage::new();
            let assembler = Assembler::new(Arc::new(storage.clone()), "/uploads");
            let session = format!("s-{chunk_size}");
            let total = stage(&storage, &session, &data, chunk_size).await;

            let artifact = assembler.assemble(&session, "clip.mp4", total).await.unwrap();
            assert_eq!(artifact_bytes(&storage, &artifact.url).await, data, "chunk size {chunk_size}");
            assert_eq!(storage.staged_chunk_count().await, 0);
        }
    }

    #[tokio::test]
    async fn twelve_mib_video_in_three_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path().join("chunks"), dir.path().join("uploads"));
        let assembler = Assembler::new(Arc::new(storage.clone()), "/uploads");

        let data: Vec<u8> = (0..12 * 1024 * 1024).map(|i: u32| (i % 256) as u8).collect();
        let total = stage(&storage, "17-0a0b0c0d-clip.MOV", &data, 5 * 1024 * 1024).await;
        assert_eq!(total, 3);

        let artifact = assembler
            .assemble("17-0a0b0c0d-clip.MOV", "clip.MOV", total)
            .await
            .unwrap();
        assert_eq!(artifact.kind, MediaKind::Video);
        assert!(artifact.url.starts_with("/uploads/"));
        assert!(artifact.url.ends_with("-clip.MOV"));
        assert_eq!(artifact_bytes(&storage, &artifact.url).await, data);
        assert!(!dir.path().join("chunks/17-0a0b0c0d-clip.MOV").exists());
    }

    #[tokio::test]
    async fn empty_file_assembles_to_empty_artifact() {
        let storage = MemoryStorage::new();
        let assembler = Assembler::new(Arc::new(storage.clone()), "/uploads");
        let total = stage(&storage, "empty", b"", 5).await;
        let artifact = assembler.assemble("empty", "photo.png", total).await.unwrap();
        assert_eq!(artifact.kind, MediaKind::Image);
        assert!(artifact_bytes(&storage, &artifact.url).await.is_empty());
    }

    #[tokio::test]
    async fn missing_chunks_fail_before_writing() {
        let storage = MemoryStorage::new();
        let assembler = Assembler::new(Arc::new(storage.clone()), "/uploads");
        let session = SessionId::parse("gap").unwrap();
        storage.put_chunk(&session, 1, Bytes::from_static(b"b")).await.unwrap();

        let err = assembler.assemble("gap", "a.mp4", 4).await.unwrap_err();
        match err {
            Error::Assembly(AssemblyError::MissingChunks { missing, .. }) => {
                assert_eq!(missing, vec![0, 2, 3]);
            }
            other => panic!("expected missing chunks, got {other:?}"),
        }
        // Staged chunk kept for a later retry
        assert!(storage.chunk_exists(&session, 1).await.unwrap());
    }

    #[tokio::test]
    async fn zero_total_chunks_is_invalid() {
        let assembler = Assembler::new(Arc::new(MemoryStorage::new()), "/uploads");
        let err = assembler.assemble("s", "a.mp4", 0).await.unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn artifact_names_are_unique() {
        let storage = MemoryStorage::new();
        let assembler = Assembler::new(Arc::new(storage.clone()), "/uploads");
        stage(&storage, "a", b"one", 10).await;
        stage(&storage, "b", b"two", 10).await;
        let first = assembler.assemble("a", "same.png", 1).await.unwrap();
        let second = assembler.assemble("b", "same.png", 1).await.unwrap();
        assert_ne!(first.url, second.url);
    }

    /// Memory storage whose artifacts can never be committed
    struct FailingCommit(MemoryStorage);

    struct RejectingSink;

    #[async_trait]
    impl ArtifactSink for RejectingSink {
        async fn write(&mut self, _data: Bytes) -> Result<()> {
            Ok(())
        }
        async fn commit(self: Box<Self>) -> Result<u64> {
            Err(Error::Io(std::io::Error::other("disk full")))
        }
        async fn abort(self: Box<Self>) {}
    }

    #[async_trait]
    impl Storage for FailingCommit {
        fn backend_name(&self) -> &'static str {
            "failing"
        }
        async fn put_chunk(&self, s: &SessionId, i: u32, d: Bytes) -> Result<()> {
            self.0.put_chunk(s, i, d).await
        }
        async fn open_chunk(&self, s: &SessionId, i: u32) -> Result<Option<ByteReader>> {
            self.0.open_chunk(s, i).await
        }
        async fn chunk_exists(&self, s: &SessionId, i: u32) -> Result<bool> {
            self.0.chunk_exists(s, i).await
        }
        async fn delete_session(&self, s: &SessionId, t: u32) -> Result<()> {
            self.0.delete_session(s, t).await
        }
        async fn create_artifact(&self, _name: &str) -> Result<Box<dyn ArtifactSink>> {
            Ok(Box::new(RejectingSink))
        }
        async fn open_artifact(&self, name: &str) -> Result<Option<(ByteReader, u64)>> {
            self.0.open_artifact(name).await
        }
        async fn sweep_staging(&self, older_than: Duration) -> Result<usize> {
            self.0.sweep_staging(older_than).await
        }
    }

    #[tokio::test]
    async fn failed_commit_keeps_staged_chunks() {
        let inner = MemoryStorage::new();
        let storage = FailingCommit(inner.clone());
        stage(&inner, "keep", b"abcdef", 2).await;
        let assembler = Assembler::new(Arc::new(storage), "/uploads");

        let err = assembler.assemble("keep", "a.mp4", 3).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Assembly(AssemblyError::CommitFailed { .. })
        ));
        assert_eq!(inner.staged_chunk_count().await, 3);

        // The session lock is released after a failure
        let again = assembler.assemble("keep", "a.mp4", 3).await.unwrap_err();
        assert!(matches!(again, Error::Assembly(_)));
    }

    #[tokio::test]
    async fn concurrent_merge_of_one_session_is_rejected() {
        let storage = MemoryStorage::new();
        let assembler = Assembler::new(Arc::new(storage.clone()), "/uploads");
        stage(&storage, "busy", b"abc", 2).await;
        let session = SessionId::parse("busy").unwrap();

        let guard = MergeGuard::acquire(&assembler.merging, &session).unwrap();
        let err = assembler.assemble("busy", "a.mp4", 2).await.unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(ref m) if m.contains("already being merged")));

        // Dropping the guard, as a cancelled merge does, frees the session
        drop(guard);
        assembler.assemble("busy", "a.mp4", 2).await.unwrap();
    }
}
