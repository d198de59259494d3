//! In-process storage backend, used by tests and throwaway gateways

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{ArtifactSink, ByteReader, Storage};
use crate::error::Result;
use crate::types::SessionId;

#[derive(Default)]
struct Inner {
    chunks: HashMap<(String, u32), (Bytes, Instant)>,
    artifacts: HashMap<String, Bytes>,
}

/// Keeps everything in memory; contents vanish with the process
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStorage {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of staged chunks across all sessions
    pub async fn staged_chunk_count(&self) -> usize {
        self.inner.lock().await.chunks.len()
    }
}

fn key(session: &SessionId, index: u32) -> (String, u32) {
    (session.as_str().to_string(), index)
}

#[async_trait]
impl Storage for MemoryStorage {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn put_chunk(&self, session: &SessionId, index: u32, data: Bytes) -> Result<()> {
        self.inner
            .lock()
            .await
            .chunks
            .insert(key(session, index), (data, Instant::now()));
        Ok(())
    }

    async fn open_chunk(&self, session: &SessionId, index: u32) -> Result<Option<ByteReader>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .chunks
            .get(&key(session, index))
            .map(|(data, _)| Box::new(Cursor::new(data.clone())) as ByteReader))
    }

    async fn chunk_exists(&self, session: &SessionId, index: u32) -> Result<bool> {
        Ok(self.inner.lock().await.chunks.contains_key(&key(session, index)))
    }

    async fn delete_session(&self, session: &SessionId, _total_chunks: u32) -> Result<()> {
        self.inner
            .lock()
            .await
            .chunks
            .retain(|(id, _), _| id != session.as_str());
        Ok(())
    }

    async fn create_artifact(&self, name: &str) -> Result<Box<dyn ArtifactSink>> {
        Ok(Box::new(MemorySink {
            inner: Arc::clone(&self.inner),
            name: name.to_string(),
            buffer: BytesMut::new(),
        }))
    }

    async fn open_artifact(&self, name: &str) -> Result<Option<(ByteReader, u64)>> {
        let inner = self.inner.lock().await;
        Ok(inner.artifacts.get(name).map(|data| {
            let len = data.len() as u64;
            (Box::new(Cursor::new(data.clone())) as ByteReader, len)
        }))
    }

    async fn sweep_staging(&self, older_than: Duration) -> Result<usize> {
        let mut inner = self.inner.lock().await;

        // A session is stale only if its newest chunk is
        let mut newest: HashMap<String, Instant> = HashMap::new();
        for ((id, _), (_, stored_at)) in &inner.chunks {
            let entry = newest.entry(id.clone()).or_insert(*stored_at);
            *entry = (*entry).max(*stored_at);
        }
        let stale: Vec<String> = newest
            .into_iter()
            .filter(|(_, stored_at)| stored_at.elapsed() >= older_than)
            .map(|(id, _)| id)
            .collect();

        inner.chunks.retain(|(id, _), _| !stale.contains(id));
        Ok(stale.len())
    }
}

struct MemorySink {
    inner: Arc<Mutex<Inner>>,
    name: String,
    buffer: BytesMut,
}

#[async_trait]
impl ArtifactSink for MemorySink {
    async fn write(&mut self, data: Bytes) -> Result<()> {
        self.buffer.extend_from_slice(&data);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<u64> {
        let len = self.buffer.len() as u64;
        self.inner
            .lock()
            .await
            .artifacts
            .insert(self.name, self.buffer.freeze());
        Ok(len)
    }

    async fn abort(self: Box<Self>) {}
}
