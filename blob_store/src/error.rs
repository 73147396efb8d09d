//! Error types for storage backend operations.

use std::fmt;

/// Result type for storage backend operations.
pub type BlobResult<T> = Result<T, BlobError>;

/// Errors that can occur during storage backend operations.
#[derive(Debug)]
pub enum BlobError {
    /// No object under the requested id.
    NotFound { id: String },

    /// The id or URL can't be mapped onto the backend.
    InvalidUri { uri: String, reason: String },

    /// I/O error during a backend operation.
    IoError { source: std::io::Error },

    /// Network error (S3/GCS/Azure).
    NetworkError { source: anyhow::Error },

    /// No backend registered under the key.
    UnknownBackend { key: String },

    /// Generic error.
    Other { source: anyhow::Error },
}

impl fmt::Display for BlobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobError::NotFound { id } => write!(f, "Object not found: {}", id),
            BlobError::InvalidUri { uri, reason } => {
                write!(f, "Invalid id '{}': {}", uri, reason)
            }
            BlobError::IoError { source } => write!(f, "I/O error: {}", source),
            BlobError::NetworkError { source } => write!(f, "Network error: {}", source),
            BlobError::UnknownBackend { key } => write!(f, "No backend registered as '{}'", key),
            BlobError::Other { source } => write!(f, "Storage error: {}", source),
        }
    }
}

impl std::error::Error for BlobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BlobError::IoError { source } => Some(source),
            BlobError::NetworkError { source } => Some(source.as_ref()),
            BlobError::Other { source } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl BlobError {
    /// Maps a filesystem error for `id`, keeping "not found" distinct.
    pub fn from_io(id: &str, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            BlobError::NotFound { id: id.to_string() }
        } else {
            BlobError::IoError { source: err }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobError::NotFound { .. })
    }
}

impl From<std::io::Error> for BlobError {
    fn from(err: std::io::Error) -> Self {
        BlobError::IoError { source: err }
    }
}

impl From<anyhow::Error> for BlobError {
    fn from(err: anyhow::Error) -> Self {
        BlobError::Other { source: err }
    }
}

impl From<object_store::Error> for BlobError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => BlobError::NotFound { id: path },
            _ => BlobError::NetworkError {
                source: anyhow::Error::from(err),
            },
        }
    }
}

impl From<url::ParseError> for BlobError {
    fn from(err: url::ParseError) -> Self {
        BlobError::InvalidUri {
            uri: String::new(),
            reason: err.to_string(),
        }
    }
}
