use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use blob_store::Source;
use bytes::Bytes;
use data_model::AttachmentValue;

/// Named derivatives of one upload, e.g. `original` and `thumb`.
pub type Versions = BTreeMap<String, Bytes>;

/// Transforms a cached file before it is stored.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Returns the versions to store, or `None` to store `cached` unchanged.
    /// `source` is a local copy of the cached content at offset 0.
    async fn process(
        &self,
        source: &mut dyn Source,
        cached: &AttachmentValue,
        phase: Option<&str>,
    ) -> Result<Option<Versions>>;
}
