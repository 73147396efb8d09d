//! Backend over any `object_store` implementation (S3, GCS, Azure, local,
//! in-memory).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use data_model::Metadata;
use futures::{StreamExt, TryStreamExt};
use object_store::{
    aws::AmazonS3ConfigKey,
    parse_url,
    parse_url_opts,
    path::Path,
    ObjectStore,
    ObjectStoreScheme,
    PutPayload,
};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::StreamReader;
use tracing::info;
use url::Url;

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

/// Stores objects in an [`ObjectStore`] below a base path.
pub struct ObjectStoreBackend {
    object_store: Arc<dyn ObjectStore>,

    /// Base path for object_store operations.
    path: Path,

    /// Base URL used for generating object URLs.
    base_url: String,
}

impl ObjectStoreBackend {
    pub fn new(object_store: Arc<dyn ObjectStore>, path: Path, base_url: impl Into<String>) -> Self {
        Self {
            object_store,
            path,
            base_url: base_url.into(),
        }
    }

    /// Builds the object store from a URL such as `s3://bucket/prefix` or
    /// `file:///var/lib/stowage`.
    pub fn from_url(url_str: &str) -> BlobResult<Self> {
        let url = url_str.parse::<Url>()?;
        let (scheme, _) = ObjectStoreScheme::parse(&url).map_err(|e| BlobError::InvalidUri {
            uri: url_str.to_string(),
            reason: e.to_string(),
        })?;
        let (object_store, path) = match scheme {
            ObjectStoreScheme::AmazonS3 => {
                // inject AWS environment variables to prioritize keys over instance metadata
                // credentials.
                let opts: Vec<(AmazonS3ConfigKey, String)> = std::env::vars_os()
                    .filter_map(|(os_key, os_value)| {
                        let (key, value) = (os_key.to_str()?, os_value.to_str()?);
                        if !key.starts_with("AWS_") {
                            return None;
                        }
                        let config_key = key.to_ascii_lowercase().parse().ok()?;
                        Some((config_key, value.to_string()))
                    })
                    .collect();
                parse_url_opts(&url, opts)?
            }
            _ => parse_url(&url)?,
        };
        info!(url = %url_str, "using object store backend");
        Ok(Self::new(Arc::from(object_store), path, url_str))
    }

    fn location(&self, id: &str) -> Path {
        if self.path.as_ref().is_empty() {
            Path::from(id)
        } else {
            Path::from(format!("{}/{}", self.path, id))
        }
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    fn name(&self) -> &'static str {
        "ObjectStoreBackend"
    }

    async fn upload(&self, source: &mut dyn Source, id: &str, _metadata: &Metadata) -> BlobResult<()> {
        let mut data = Vec::new();
        source.read_to_end(&mut data).await?;
        self.object_store
            .put(&self.location(id), PutPayload::from(data))
            .await?;
        Ok(())
    }

    async fn open(&self, id: &str) -> BlobResult<Box<dyn AsyncRead + Send + Unpin>> {
        let result = self.object_store.get(&self.location(id)).await?;
        let stream = result
            .into_stream()
            .map_err(|e| std::io::Error::other(e.to_string()));
        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn read(&self, id: &str) -> BlobResult<Bytes> {
        let result = self.object_store.get(&self.location(id)).await?;
        Ok(result.bytes().await?)
    }

    async fn exists(&self, id: &str) -> BlobResult<bool> {
        match self.object_store.head(&self.location(id)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn url(&self, id: &str) -> Option<String> {
        Some(format!("{}/{}", self.base_url.trim_end_matches('/'), id))
    }

    async fn delete(&self, id: &str) -> BlobResult<()> {
        match self.object_store.delete(&self.location(id)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
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
impl StreamingBackend for ObjectStoreBackend {
    async fn stream(&self, id: &str) -> BlobResult<ChunkStream> {
        let result = self.object_store.get(&self.location(id)).await?;
        let total_len = Some(result.meta.size as u64);
        let chunks = result.into_stream().map(move |chunk| {
            chunk
                .map(|data| Chunk { data, total_len })
                .map_err(BlobError::from)
        });
        Ok(Box::pin(chunks))
    }
}

#[async_trait]
impl MovingBackend for ObjectStoreBackend {
    async fn movable(&self, source_id: &str, _dest_id: &str) -> bool {
        self.exists(source_id).await.unwrap_or(false)
    }

    async fn move_object(&self, source_id: &str, dest_id: &str, _metadata: &Metadata) -> BlobResult<()> {
        self.object_store
            .rename(&self.location(source_id), &self.location(dest_id))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BatchDeleteBackend for ObjectStoreBackend {
    async fn delete_many(&self, ids: &[String]) -> BlobResult<()> {
        let locations = futures::stream::iter(
            ids.iter()
                .map(|id| Ok(self.location(id)))
                .collect::<Vec<_>>(),
        )
        .boxed();
        let mut deleted = self.object_store.delete_stream(locations);
        while let Some(result) = deleted.next().await {
            match result {
                Ok(_) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ClearableBackend for ObjectStoreBackend {
    async fn clear(&self) -> BlobResult<()> {
        let prefix = (!self.path.as_ref().is_empty()).then(|| self.path.clone());
        let locations: Vec<Path> = self
            .object_store
            .list(prefix.as_ref())
            .map_ok(|meta| meta.location)
            .try_collect()
            .await?;
        for location in locations {
            match self.object_store.delete(&location).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
