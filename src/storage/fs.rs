//! Local-directory storage backend
//!
//! Layout:
//! - `<staging_dir>/<session>/chunk-<index>` for staged chunks
//! - `<artifact_dir>/<name>` for artifacts, written via `.<name>.<uuid>.partial`

use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use super::{ArtifactSink, ByteReader, Storage};
use crate::error::{Error, Result};
use crate::types::SessionId;

/// Stores chunks and artifacts under two local directories
#[derive(Clone, Debug)]
pub struct FilesystemStorage {
    staging_dir: PathBuf,
    artifact_dir: PathBuf,
}

impl FilesystemStorage {
    /// Create a backend rooted at the given directories
    ///
    /// Directories are created on first write, not here.
    pub fn new(staging_dir: PathBuf, artifact_dir: PathBuf) -> Self {
        Self {
            staging_dir,
            artifact_dir,
        }
    }

    fn session_dir(&self, session: &SessionId) -> PathBuf {
        self.staging_dir.join(session.as_str())
    }

    fn chunk_path(&self, session: &SessionId, index: u32) -> PathBuf {
        self.session_dir(session).join(format!("chunk-{index}"))
    }
}

/// Open a file for reading, mapping "not found" to `None`
async fn open_if_exists(path: &Path) -> Result<Option<File>> {
    match File::open(path).await {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Most recent modification time of a directory or anything directly inside it
async fn last_touched(dir: &Path) -> std::io::Result<SystemTime> {
    let mut newest = fs::metadata(dir).await?.modified()?;
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) {
            newest = newest.max(modified);
        }
    }
    Ok(newest)
}

#[async_trait]
impl Storage for FilesystemStorage {
    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    async fn put_chunk(&self, session: &SessionId, index: u32, data: Bytes) -> Result<()> {
        let dir = self.session_dir(session);
        fs::create_dir_all(&dir).await?;

        // Write beside the target and rename so readers never see a torn chunk
        let final_path = self.chunk_path(session, index);
        let temp_path = dir.join(format!("chunk-{index}.{}.tmp", uuid::Uuid::new_v4().simple()));

        let mut file = File::create(&temp_path).await?;
        let written = async {
            file.write_all(&data).await?;
            file.sync_all().await
        }
        .await;
        drop(file);

        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&temp_path, &final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        tracing::debug!(
            session_id = %session,
            chunk_index = index,
            bytes = data.len(),
            path = %final_path.display(),
            "chunk staged"
        );
        Ok(())
    }

    async fn open_chunk(&self, session: &SessionId, index: u32) -> Result<Option<ByteReader>> {
        let file = open_if_exists(&self.chunk_path(session, index)).await?;
        Ok(file.map(|f| Box::new(f) as ByteReader))
    }

    async fn chunk_exists(&self, session: &SessionId, index: u32) -> Result<bool> {
        Ok(fs::try_exists(self.chunk_path(session, index)).await?)
    }

    async fn delete_session(&self, session: &SessionId, _total_chunks: u32) -> Result<()> {
        match fs::remove_dir_all(self.session_dir(session)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_artifact(&self, name: &str) -> Result<Box<dyn ArtifactSink>> {
        fs::create_dir_all(&self.artifact_dir).await?;
        let final_path = self.artifact_dir.join(name);
        let temp_path = self
            .artifact_dir
            .join(format!(".{name}.{}.partial", uuid::Uuid::new_v4().simple()));
        let file = File::create(&temp_path).await?;

        Ok(Box::new(FileSink {
            file: Some(file),
            temp_path,
            final_path,
            written: 0,
            settled: false,
        }))
    }

    async fn open_artifact(&self, name: &str) -> Result<Option<(ByteReader, u64)>> {
        let Some(file) = open_if_exists(&self.artifact_dir.join(name)).await? else {
            return Ok(None);
        };
        let len = file.metadata().await?.len();
        Ok(Some((Box::new(file), len)))
    }

    async fn sweep_staging(&self, older_than: Duration) -> Result<usize> {
        let mut entries = match fs::read_dir(&self.staging_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let path = entry.path();
            let touched = match last_touched(&path).await {
                Ok(touched) => touched,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot stat staged session");
                    continue;
                }
            };
            let age = now.duration_since(touched).unwrap_or_default();
            if age < older_than {
                continue;
            }
            match fs::remove_dir_all(&path).await {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), age_secs = age.as_secs(), "removed abandoned session");
                    removed += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove abandoned session");
                }
            }
        }
        Ok(removed)
    }
}

/// Writes `.<name>.<uuid>.partial` and renames it into place on commit
///
/// Dropping the sink without committing (a cancelled merge) removes the
/// partial file.
struct FileSink {
    /// `None` once closed by commit or abort
    file: Option<File>,
    temp_path: PathBuf,
    final_path: PathBuf,
    written: u64,
    settled: bool,
}

impl FileSink {
    fn file(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| Error::Storage(format!("{} is already closed", self.temp_path.display())))
    }

    async fn discard(&mut self) {
        self.settled = true;
        drop(self.file.take());
        match fs::remove_file(&self.temp_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.temp_path.display(), error = %e, "failed to discard partial artifact");
            }
        }
    }
}

#[async_trait]
impl ArtifactSink for FileSink {
    async fn write(&mut self, data: Bytes) -> Result<()> {
        self.file()?.write_all(&data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<u64> {
        let flushed = async {
            let file = self.file()?;
            file.flush().await?;
            file.sync_all().await?;
            Ok::<_, Error>(())
        }
        .await;
        drop(self.file.take());
        if let Err(e) = flushed {
            self.discard().await;
            return Err(e);
        }
        if let Err(e) = fs::rename(&self.temp_path, &self.final_path).await {
            self.discard().await;
            return Err(e.into());
        }
        self.settled = true;
        Ok(self.written)
    }

    async fn abort(mut self: Box<Self>) {
        self.discard().await;
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        // Close before unlinking so the removal also works where open files are locked
        drop(self.file.take());
        match std::fs::remove_file(&self.temp_path) {
            Ok(()) => {
                tracing::debug!(path = %self.temp_path.display(), "removed partial artifact of an unfinished write");
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.temp_path.display(), error = %e, "failed to remove partial artifact");
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn storage(root: &Path) -> FilesystemStorage {
        FilesystemStorage::new(root.join("temp/chunks"), root.join("public/uploads"))
    }

    #[tokio::test]
    async fn staging_dir_is_created_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        assert!(!dir.path().join("temp").exists());

        let session = SessionId::parse("s1").unwrap();
        storage
            .put_chunk(&session, 3, Bytes::from_static(b"abc"))
            .await
            .unwrap();

        let chunk = dir.path().join("temp/chunks/s1/chunk-3");
        assert_eq!(std::fs::read(chunk).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn chunk_writes_leave_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let session = SessionId::parse("s2").unwrap();

        for _ in 0..3 {
            storage
                .put_chunk(&session, 0, Bytes::from_static(b"xyz"))
                .await
                .unwrap();
        }

        let names: Vec<_> = std::fs::read_dir(dir.path().join("temp/chunks/s2"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["chunk-0".to_string()]);
    }

    #[tokio::test]
    async fn partial_artifact_is_hidden_until_commit() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());

        let mut sink = storage.create_artifact("x-clip.mp4").await.unwrap();
        sink.write(Bytes::from_static(b"data")).await.unwrap();
        assert!(!dir.path().join("public/uploads/x-clip.mp4").exists());

        sink.commit().await.unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("public/uploads/x-clip.mp4")).unwrap(),
            b"data"
        );
        let leftovers = std::fs::read_dir(dir.path().join("public/uploads"))
            .unwrap()
            .count();
        assert_eq!(leftovers, 1);
    }

    fn artifact_dir_entries(root: &Path) -> Vec<String> {
        std::fs::read_dir(root.join("public/uploads"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn dropped_sink_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());

        let mut sink = storage.create_artifact("u-clip.mp4").await.unwrap();
        sink.write(Bytes::from(vec![0u8; 1024 * 1024])).await.unwrap();
        assert_eq!(artifact_dir_entries(dir.path()).len(), 1);

        drop(sink);
        assert!(artifact_dir_entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn aborted_sink_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());

        let mut sink = storage.create_artifact("a-photo.png").await.unwrap();
        sink.write(Bytes::from_static(b"png")).await.unwrap();
        sink.abort().await;
        assert!(artifact_dir_entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn sweep_removes_only_stale_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let session = SessionId::parse("old").unwrap();
        storage
            .put_chunk(&session, 0, Bytes::from_static(b"a"))
            .await
            .unwrap();

        assert_eq!(
            storage.sweep_staging(Duration::from_secs(3600)).await.unwrap(),
            0
        );
        assert!(storage.chunk_exists(&session, 0).await.unwrap());

        assert_eq!(storage.sweep_staging(Duration::ZERO).await.unwrap(), 1);
        assert!(!storage.chunk_exists(&session, 0).await.unwrap());
    }

    #[tokio::test]
    async fn sweep_without_staging_dir_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            storage(dir.path())
                .sweep_staging(Duration::ZERO)
                .await
                .unwrap(),
            0
        );
    }
}
