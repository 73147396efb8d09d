//! Storage capability contract.

use async_trait::async_trait;
use bytes::Bytes;
use data_model::Metadata;
use futures::stream::BoxStream;
use strum::{Display, EnumIter};
use tokio::{fs::File, io::AsyncRead};

use crate::{materialize, BlobResult, Source};

/// Optional behaviour a backend may provide on top of the required
/// operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Capability {
    Stream,
    Move,
    MultiDelete,
    Clear,
}

/// One piece of a streamed object.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub data: Bytes,

    /// Total length of the object, when the backend knows it up front.
    pub total_len: Option<u64>,
}

pub type ChunkStream = BoxStream<'static, BlobResult<Chunk>>;

/// Required operations every backend must implement.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short type name used in diagnostics, e.g. `MemoryBackend`.
    fn name(&self) -> &'static str;

    /// Stores the content of `source` under `id`, replacing any previous
    /// object with that id.
    async fn upload(&self, source: &mut dyn Source, id: &str, metadata: &Metadata) -> BlobResult<()>;

    /// Materializes the full object in a local temp file, rewound to offset 0.
    async fn download(&self, id: &str) -> BlobResult<File> {
        let data = self.read(id).await?;
        Ok(materialize(&data).await?)
    }

    /// Opens the object for reading. Implementations may fetch lazily.
    async fn open(&self, id: &str) -> BlobResult<Box<dyn AsyncRead + Send + Unpin>>;

    /// Reads the whole object into memory.
    async fn read(&self, id: &str) -> BlobResult<Bytes>;

    async fn exists(&self, id: &str) -> BlobResult<bool>;

    fn url(&self, id: &str) -> Option<String>;

    /// Removes the object. Deleting a missing object is not an error.
    async fn delete(&self, id: &str) -> BlobResult<()>;

    fn streaming(&self) -> Option<&dyn StreamingBackend> {
        None
    }

    fn moving(&self) -> Option<&dyn MovingBackend> {
        None
    }

    fn batch_delete(&self) -> Option<&dyn BatchDeleteBackend> {
        None
    }

    fn clearable(&self) -> Option<&dyn ClearableBackend> {
        None
    }

    fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Stream => self.streaming().is_some(),
            Capability::Move => self.moving().is_some(),
            Capability::MultiDelete => self.batch_delete().is_some(),
            Capability::Clear => self.clearable().is_some(),
        }
    }
}

#[async_trait]
pub trait StreamingBackend: Send + Sync {
    async fn stream(&self, id: &str) -> BlobResult<ChunkStream>;
}

/// Moving objects within a backend.
///
/// Whether a particular move is possible is decided per call by
/// [`MovingBackend::movable`]; callers must not invoke
/// [`MovingBackend::move_object`] when it returns `false`.
#[async_trait]
pub trait MovingBackend: Send + Sync {
    async fn movable(&self, source_id: &str, dest_id: &str) -> bool;

    async fn move_object(&self, source_id: &str, dest_id: &str, metadata: &Metadata) -> BlobResult<()>;
}

#[async_trait]
pub trait BatchDeleteBackend: Send + Sync {
    async fn delete_many(&self, ids: &[String]) -> BlobResult<()>;
}

#[async_trait]
pub trait ClearableBackend: Send + Sync {
    /// Removes every object stored by this backend.
    async fn clear(&self) -> BlobResult<()>;
}
