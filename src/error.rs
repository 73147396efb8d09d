use blob_store::BlobError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error("analyzer {analyzer} is unavailable: {reason}")]
    Unavailable { analyzer: String, reason: String },

    #[error("io error while analyzing: {0}")]
    Io(#[from] std::io::Error),

    #[error("no analyzer registered as {0}")]
    UnknownAnalyzer(String),
}

#[derive(Debug, Error)]
pub enum AttacherError {
    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Analyze(#[from] AnalyzeError),

    #[error("malformed attachment data: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error("attachment is held by {0}, which is neither the cache nor the store")]
    UnknownStorage(String),

    #[error("record repository error: {0}")]
    Record(#[source] anyhow::Error),

    #[error("processing failed: {0}")]
    Processing(#[source] anyhow::Error),

    #[error("failed to submit background job: {0}")]
    Submit(#[source] anyhow::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AttacherResult<T> = Result<T, AttacherError>;
