//! Backend configuration.

use std::{env, path::Path, sync::Arc};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    BlobError,
    BlobResult,
    FileSystemBackend,
    MemoryBackend,
    ObjectStoreBackend,
    StorageBackend,
};

/// How to build one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Objects live in process memory.
    Memory,

    /// Objects are files below `directory`.
    FileSystem {
        directory: String,

        /// Public URL prefix for generated URLs.
        #[serde(default)]
        prefix: Option<String>,
    },

    /// Objects live in an object store addressed by URL (e.g.
    /// `s3://bucket/prefix`, `gs://bucket`, `file:///path`).
    ObjectStore { url: String },
}

impl StorageConfig {
    pub fn file_system(name: &str) -> Self {
        StorageConfig::FileSystem {
            directory: default_storage_path(name),
            prefix: None,
        }
    }

    /// The same storage narrowed to `scope`: a subdirectory, or one more
    /// path segment of the object store URL. Memory backends are private
    /// to their instance already.
    pub fn scoped(&self, scope: &str) -> BlobResult<Self> {
        Ok(match self {
            StorageConfig::Memory => StorageConfig::Memory,
            StorageConfig::FileSystem { directory, prefix } => StorageConfig::FileSystem {
                directory: Path::new(directory).join(scope).to_string_lossy().to_string(),
                prefix: prefix
                    .as_ref()
                    .map(|prefix| format!("{}/{}", prefix.trim_end_matches('/'), scope)),
            },
            StorageConfig::ObjectStore { url } => {
                let invalid = |reason: &str| BlobError::InvalidUri {
                    uri: url.clone(),
                    reason: reason.to_string(),
                };
                let mut scoped = Url::parse(url).map_err(|e| invalid(&e.to_string()))?;
                scoped
                    .path_segments_mut()
                    .map_err(|_| invalid("URL has no path"))?
                    .pop_if_empty()
                    .push(scope);
                StorageConfig::ObjectStore {
                    url: scoped.to_string(),
                }
            }
        })
    }

    pub fn build(&self) -> BlobResult<Arc<dyn StorageBackend>> {
        Ok(match self {
            StorageConfig::Memory => Arc::new(MemoryBackend::new()),
            StorageConfig::FileSystem { directory, prefix } => {
                let backend = FileSystemBackend::new(directory);
                match prefix {
                    Some(prefix) => Arc::new(backend.with_prefix(prefix)),
                    None => Arc::new(backend),
                }
            }
            StorageConfig::ObjectStore { url } => Arc::new(ObjectStoreBackend::from_url(url)?),
        })
    }
}

/// Default directory for a named backend (local filesystem).
pub fn default_storage_path(name: &str) -> String {
    env::current_dir()
        .unwrap_or_else(|_| std::path::PathBuf::from("."))
        .join("stowage_storage")
        .join(name)
        .to_str()
        .map(str::to_string)
        .unwrap_or_else(|| format!("./stowage_storage/{}", name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped() {
        let fs = StorageConfig::FileSystem {
            directory: "/srv/uploads".to_string(),
            prefix: Some("https://cdn.example.com/uploads/".to_string()),
        };
        assert_eq!(
            fs.scoped("lint").unwrap(),
            StorageConfig::FileSystem {
                directory: "/srv/uploads/lint".to_string(),
                prefix: Some("https://cdn.example.com/uploads/lint".to_string()),
            }
        );

        let url_of = |config: StorageConfig| match config {
            StorageConfig::ObjectStore { url } => url,
            other => panic!("unexpected config {:?}", other),
        };
        let s3 = StorageConfig::ObjectStore {
            url: "s3://bucket/store".to_string(),
        };
        assert_eq!(url_of(s3.scoped("lint").unwrap()), "s3://bucket/store/lint");
        let memory = StorageConfig::ObjectStore {
            url: "memory:///".to_string(),
        };
        assert_eq!(url_of(memory.scoped("lint").unwrap()), "memory:///lint");

        assert_eq!(StorageConfig::Memory.scoped("lint").unwrap(), StorageConfig::Memory);
    }
}
