//! In-process backend, for tests and development.

use std::io::Cursor;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use data_model::Metadata;
use futures::stream;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::CHUNK_SIZE;
use crate::{
    BatchDeleteBackend,
    BlobError,
    BlobResult,
    Chunk,
    ChunkStream,
    ClearableBackend,
    Source,
    StorageBackend,
    StreamingBackend,
};

/// Keeps objects in a concurrent map. Nothing survives the process.
#[derive(Default)]
pub struct MemoryBackend {
    objects: DashMap<String, Bytes>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn get(&self, id: &str) -> BlobResult<Bytes> {
        self.objects
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BlobError::NotFound { id: id.to_string() })
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "MemoryBackend"
    }

    async fn upload(&self, source: &mut dyn Source, id: &str, _metadata: &Metadata) -> BlobResult<()> {
        let mut data = Vec::new();
        source.read_to_end(&mut data).await?;
        self.objects.insert(id.to_string(), Bytes::from(data));
        Ok(())
    }

    async fn open(&self, id: &str) -> BlobResult<Box<dyn AsyncRead + Send + Unpin>> {
        Ok(Box::new(Cursor::new(self.get(id)?)))
    }

    async fn read(&self, id: &str) -> BlobResult<Bytes> {
        self.get(id)
    }

    async fn exists(&self, id: &str) -> BlobResult<bool> {
        Ok(self.objects.contains_key(id))
    }

    fn url(&self, _id: &str) -> Option<String> {
        None
    }

    async fn delete(&self, id: &str) -> BlobResult<()> {
        self.objects.remove(id);
        Ok(())
    }

    fn streaming(&self) -> Option<&dyn StreamingBackend> {
        Some(self)
    }

    fn batch_delete(&self) -> Option<&dyn BatchDeleteBackend> {
        Some(self)
    }

    fn clearable(&self) -> Option<&dyn ClearableBackend> {
        Some(self)
    }
}

#[async_trait]
impl StreamingBackend for MemoryBackend {
    async fn stream(&self, id: &str) -> BlobResult<ChunkStream> {
        let data = self.get(id)?;
        let total_len = Some(data.len() as u64);
        let chunks: Vec<BlobResult<Chunk>> = (0..data.len())
            .step_by(CHUNK_SIZE)
            .map(|start| {
                let end = (start + CHUNK_SIZE).min(data.len());
                Ok(Chunk {
                    data: data.slice(start..end),
                    total_len,
                })
            })
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

#[async_trait]
impl BatchDeleteBackend for MemoryBackend {
    async fn delete_many(&self, ids: &[String]) -> BlobResult<()> {
        for id in ids {
            self.objects.remove(id);
        }
        Ok(())
    }
}

#[async_trait]
impl ClearableBackend for MemoryBackend {
    async fn clear(&self) -> BlobResult<()> {
        self.objects.clear();
        Ok(())
    }
}
