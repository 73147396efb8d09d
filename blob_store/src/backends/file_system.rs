//! Local filesystem backend.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use data_model::Metadata;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::CHUNK_SIZE;
use crate::{
    BatchDeleteBackend,
    BlobError,
    BlobResult,
    Chunk,
    ChunkStream,
    ClearableBackend,
    MovingBackend,
    Source,
    StorageBackend,
    StreamingBackend,
};

/// Stores objects as files below a root directory. Ids are relative paths.
pub struct FileSystemBackend {
    directory: PathBuf,

    /// Public URL prefix, e.g. `/uploads` when the directory is served by a
    /// web server.
    prefix: Option<String>,
}

impl FileSystemBackend {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            prefix: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Maps an id onto a path below the root, refusing anything that could
    /// escape it.
    fn path_for(&self, id: &str) -> BlobResult<PathBuf> {
        let relative = Path::new(id);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if id.is_empty() || escapes {
            return Err(BlobError::InvalidUri {
                uri: id.to_string(),
                reason: "id must be a relative path without `..`".to_string(),
            });
        }
        Ok(self.directory.join(relative))
    }

    /// Removes directories left empty by a delete, stopping at the root.
    async fn prune_empty_parents(&self, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == self.directory || !dir.starts_with(&self.directory) {
                break;
            }
            if tokio::fs::remove_dir(dir).await.is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

#[async_trait]
impl StorageBackend for FileSystemBackend {
    fn name(&self) -> &'static str {
        "FileSystemBackend"
    }

    async fn upload(&self, source: &mut dyn Source, id: &str, _metadata: &Metadata) -> BlobResult<()> {
        let path = self.path_for(id)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(&path).await?;
        let written = tokio::io::copy(source, &mut file).await?;
        file.flush().await?;
        debug!(id, bytes = written, "stored file");
        Ok(())
    }

    async fn download(&self, id: &str) -> BlobResult<tokio::fs::File> {
        let path = self.path_for(id)?;
        let mut original = tokio::fs::File::open(&path)
            .await
            .map_err(|e| BlobError::from_io(id, e))?;
        Ok(crate::spool(&mut original).await?)
    }

    async fn open(&self, id: &str) -> BlobResult<Box<dyn AsyncRead + Send + Unpin>> {
        let path = self.path_for(id)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| BlobError::from_io(id, e))?;
        Ok(Box::new(file))
    }

    async fn read(&self, id: &str) -> BlobResult<Bytes> {
        let path = self.path_for(id)?;
        tokio::fs::read(&path)
            .await
            .map(Bytes::from)
            .map_err(|e| BlobError::from_io(id, e))
    }

    async fn exists(&self, id: &str) -> BlobResult<bool> {
        let path = self.path_for(id)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    fn url(&self, id: &str) -> Option<String> {
        match &self.prefix {
            Some(prefix) => Some(format!("{}/{}", prefix.trim_end_matches('/'), id)),
            None => Some(format!("file://{}", self.directory.join(id).display())),
        }
    }

    async fn delete(&self, id: &str) -> BlobResult<()> {
        let path = self.path_for(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        self.prune_empty_parents(&path).await;
        Ok(())
    }

    fn streaming(&self) -> Option<&dyn StreamingBackend> {
        Some(self)
    }

    fn moving(&self) -> Option<&dyn MovingBackend> {
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
impl StreamingBackend for FileSystemBackend {
    async fn stream(&self, id: &str) -> BlobResult<ChunkStream> {
        let path = self.path_for(id)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| BlobError::from_io(id, e))?;
        let total_len = Some(file.metadata().await?.len());
        let chunks = ReaderStream::with_capacity(file, CHUNK_SIZE).map(move |chunk| {
            chunk
                .map(|data| Chunk { data, total_len })
                .map_err(BlobError::from)
        });
        Ok(Box::pin(chunks))
    }
}

#[async_trait]
impl MovingBackend for FileSystemBackend {
    async fn movable(&self, source_id: &str, dest_id: &str) -> bool {
        let (Ok(source), Ok(_)) = (self.path_for(source_id), self.path_for(dest_id)) else {
            return false;
        };
        tokio::fs::try_exists(&source).await.unwrap_or(false)
    }

    async fn move_object(&self, source_id: &str, dest_id: &str, _metadata: &Metadata) -> BlobResult<()> {
        let source = self.path_for(source_id)?;
        let dest = self.path_for(dest_id)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&source, &dest)
            .await
            .map_err(|e| BlobError::from_io(source_id, e))?;
        self.prune_empty_parents(&source).await;
        Ok(())
    }
}

#[async_trait]
impl BatchDeleteBackend for FileSystemBackend {
    async fn delete_many(&self, ids: &[String]) -> BlobResult<()> {
        for id in ids {
            self.delete(id).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ClearableBackend for FileSystemBackend {
    async fn clear(&self) -> BlobResult<()> {
        match tokio::fs::remove_dir_all(&self.directory).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&self.directory).await?;
        Ok(())
    }
}
