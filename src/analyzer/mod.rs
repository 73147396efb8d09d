//! Content-type analysis and metadata extraction.
//!
//! An [`AnalyzerRegistry`] holds every analyzer under a name plus one
//! [`Selection`] deciding which of them runs for an extraction. Extraction
//! never moves the caller's stream: the read position is recorded before the
//! selected analyzer runs and restored afterwards, on success and on
//! failure alike.

mod builtin;

use std::{collections::HashMap, io::SeekFrom, sync::Arc};

use async_trait::async_trait;
use blob_store::Source;
use data_model::{Metadata, METADATA_FILENAME, METADATA_MIME_TYPE, METADATA_SIZE};
use serde_json::json;
use strum::IntoEnumIterator;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

pub use builtin::{
    AnalyzerKind,
    ContentTypeAnalyzer,
    FileCommandAnalyzer,
    InferAnalyzer,
    MagicAnalyzer,
    MimeGuessAnalyzer,
};

use crate::error::AnalyzeError;

/// Maximum number of bytes a sniffing analyzer reads.
pub const MAGIC_NUMBER_BYTES: usize = 1024;

/// What an analyzer gets to look at.
pub struct AnalyzerInput<'a> {
    pub io: &'a mut dyn Source,
    pub filename: Option<String>,
    /// Content type claimed by whoever supplied the data.
    pub declared_type: Option<String>,
}

impl<'a> AnalyzerInput<'a> {
    pub fn new(io: &'a mut dyn Source) -> Self {
        Self {
            io,
            filename: None,
            declared_type: None,
        }
    }

    pub fn with_filename(mut self, filename: Option<&str>) -> Self {
        self.filename = filename.map(str::to_string);
        self
    }

    pub fn with_declared_type(mut self, declared_type: Option<&str>) -> Self {
        self.declared_type = declared_type.map(str::to_string);
        self
    }

    /// Reads up to `limit` bytes from the current position.
    pub async fn read_prefix(&mut self, limit: usize) -> std::io::Result<Vec<u8>> {
        let mut prefix = Vec::with_capacity(limit);
        (&mut *self.io).take(limit as u64).read_to_end(&mut prefix).await?;
        Ok(prefix)
    }
}

/// Hints supplied alongside an upload.
#[derive(Debug, Clone, Default)]
pub struct UploadHints {
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

/// Determines a content type. Returns `None` when the answer is not known
/// with confidence.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, input: &mut AnalyzerInput<'_>) -> Result<Option<String>, AnalyzeError>;

    /// True when the answer is always the declared type, so the stream
    /// need not be consulted at all.
    fn trusts_declared_type(&self) -> bool {
        false
    }
}

/// An analyzer that can delegate to the registered ones, e.g. to fall back
/// from one sniffer to another. It is responsible for rewinding the stream
/// between its own sub-calls.
#[async_trait]
pub trait ComposedAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        input: &mut AnalyzerInput<'_>,
        registry: &AnalyzerRegistry,
    ) -> Result<Option<String>, AnalyzeError>;
}

#[derive(Clone)]
pub enum Selection {
    Named(String),
    Custom(Arc<dyn Analyzer>),
    Composed(Arc<dyn ComposedAnalyzer>),
}

impl From<AnalyzerKind> for Selection {
    fn from(kind: AnalyzerKind) -> Self {
        Selection::Named(kind.to_string())
    }
}

pub struct AnalyzerRegistryBuilder {
    analyzers: HashMap<String, Arc<dyn Analyzer>>,
    selection: Selection,
}

impl Default for AnalyzerRegistryBuilder {
    fn default() -> Self {
        let analyzers = AnalyzerKind::iter()
            .map(|kind| (kind.to_string(), kind.analyzer()))
            .collect();
        Self {
            analyzers,
            selection: AnalyzerKind::File.into(),
        }
    }
}

impl AnalyzerRegistryBuilder {
    pub fn register(mut self, name: &str, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzers.insert(name.to_string(), analyzer);
        self
    }

    pub fn select(mut self, selection: impl Into<Selection>) -> Self {
        self.selection = selection.into();
        self
    }

    pub fn build(self) -> Result<AnalyzerRegistry, AnalyzeError> {
        if let Selection::Named(name) = &self.selection {
            if !self.analyzers.contains_key(name) {
                return Err(AnalyzeError::UnknownAnalyzer(name.clone()));
            }
        }
        Ok(AnalyzerRegistry {
            analyzers: self.analyzers,
            selection: self.selection,
        })
    }
}

pub struct AnalyzerRegistry {
    analyzers: HashMap<String, Arc<dyn Analyzer>>,
    selection: Selection,
}

impl AnalyzerRegistry {
    /// Starts from the built-in analyzers with `file` selected.
    pub fn builder() -> AnalyzerRegistryBuilder {
        AnalyzerRegistryBuilder::default()
    }

    pub fn with_kind(kind: AnalyzerKind) -> Self {
        let mut builder = Self::builder();
        builder.selection = kind.into();
        AnalyzerRegistry {
            analyzers: builder.analyzers,
            selection: builder.selection,
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Analyzer>, AnalyzeError> {
        self.analyzers
            .get(name)
            .cloned()
            .ok_or_else(|| AnalyzeError::UnknownAnalyzer(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.analyzers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// Runs one registered analyzer without restoring the stream position.
    pub async fn analyze_with(
        &self,
        name: &str,
        input: &mut AnalyzerInput<'_>,
    ) -> Result<Option<String>, AnalyzeError> {
        let analyzer = self.get(name)?;
        analyzer.analyze(input).await
    }

    /// Runs the selected analyzer. The stream is back at its starting
    /// position when this returns.
    pub async fn extract(&self, input: &mut AnalyzerInput<'_>) -> Result<Option<String>, AnalyzeError> {
        let selected = match &self.selection {
            Selection::Named(name) => Some(self.get(name)?),
            Selection::Custom(analyzer) => Some(analyzer.clone()),
            Selection::Composed(_) => None,
        };
        if let Some(analyzer) = &selected {
            if analyzer.trusts_declared_type() {
                return Ok(input.declared_type.clone());
            }
        }

        let position = input.io.stream_position().await?;
        let result = match (&selected, &self.selection) {
            (Some(analyzer), _) => analyzer.analyze(input).await,
            (None, Selection::Composed(analyzer)) => analyzer.analyze(input, self).await,
            (None, _) => Ok(None),
        };
        input.io.seek(SeekFrom::Start(position)).await?;

        debug!(mime_type = ?result.as_ref().ok(), "extracted content type");
        result
    }

    /// Extracts `filename`, `size` and `mime_type`, leaving the stream where
    /// it was.
    pub async fn extract_metadata(&self, input: &mut AnalyzerInput<'_>) -> Result<Metadata, AnalyzeError> {
        let size = measure_size(input.io).await?;
        let mime_type = self.extract(input).await?;

        let mut metadata = Metadata::new();
        metadata.insert(METADATA_FILENAME.to_string(), json!(input.filename));
        metadata.insert(METADATA_SIZE.to_string(), json!(size));
        metadata.insert(METADATA_MIME_TYPE.to_string(), json!(mime_type));
        Ok(metadata)
    }
}

impl Default for AnalyzerRegistry {
    fn default() -> Self {
        Self::with_kind(AnalyzerKind::File)
    }
}

/// Bytes between the current position and the end of the stream.
async fn measure_size(io: &mut dyn Source) -> std::io::Result<u64> {
    let position = io.stream_position().await?;
    let end = io.seek(SeekFrom::End(0)).await?;
    io.seek(SeekFrom::Start(position)).await?;
    // Seeking past the end is legal; nothing is left to read there.
    Ok(end.saturating_sub(position))
}
