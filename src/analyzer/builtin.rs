use std::{io::ErrorKind, process::Stdio, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use tokio::{io::AsyncWriteExt, process::Command};

use super::{Analyzer, AnalyzerInput, MAGIC_NUMBER_BYTES};
use crate::error::AnalyzeError;

/// Analyzers shipped with stowage, addressable from configuration.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumIter, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AnalyzerKind {
    #[default]
    File,
    Infer,
    Magic,
    MimeGuess,
    ContentType,
}

impl AnalyzerKind {
    pub fn analyzer(self) -> Arc<dyn Analyzer> {
        match self {
            AnalyzerKind::File => Arc::new(FileCommandAnalyzer::default()),
            AnalyzerKind::Infer => Arc::new(InferAnalyzer),
            AnalyzerKind::Magic => Arc::new(MagicAnalyzer),
            AnalyzerKind::MimeGuess => Arc::new(MimeGuessAnalyzer),
            AnalyzerKind::ContentType => Arc::new(ContentTypeAnalyzer),
        }
    }
}

/// Pipes a prefix of the content through `file --mime-type --brief -`.
pub struct FileCommandAnalyzer {
    program: String,
}

impl Default for FileCommandAnalyzer {
    fn default() -> Self {
        Self {
            program: "file".to_string(),
        }
    }
}

impl FileCommandAnalyzer {
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn unavailable(&self, reason: impl ToString) -> AnalyzeError {
        AnalyzeError::Unavailable {
            analyzer: self.program.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Analyzer for FileCommandAnalyzer {
    async fn analyze(&self, input: &mut AnalyzerInput<'_>) -> Result<Option<String>, AnalyzeError> {
        let prefix = input.read_prefix(MAGIC_NUMBER_BYTES).await?;
        if prefix.is_empty() {
            return Ok(None);
        }

        let mut child = Command::new(&self.program)
            .args(["--mime-type", "--brief", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => self.unavailable("command not found"),
                _ => AnalyzeError::Io(e),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // `file` may stop reading as soon as it has seen enough.
            match stdin.write_all(&prefix).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
                Err(e) => return Err(e.into()),
            }
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(self.unavailable(String::from_utf8_lossy(&output.stderr).trim()));
        }

        let mime_type = String::from_utf8_lossy(&output.stdout).trim().to_string();
        match mime_type.as_str() {
            "" | "inode/x-empty" => Ok(None),
            _ => Ok(Some(mime_type)),
        }
    }
}

/// Signature matching with the `infer` crate.
pub struct InferAnalyzer;

#[async_trait]
impl Analyzer for InferAnalyzer {
    async fn analyze(&self, input: &mut AnalyzerInput<'_>) -> Result<Option<String>, AnalyzeError> {
        let prefix = input.read_prefix(MAGIC_NUMBER_BYTES).await?;
        Ok(infer::get(&prefix).map(|kind| kind.mime_type().to_string()))
    }
}

/// Shared-mime-info magic database lookup.
pub struct MagicAnalyzer;

impl MagicAnalyzer {
    const UNKNOWN: &'static str = "application/octet-stream";
}

#[async_trait]
impl Analyzer for MagicAnalyzer {
    async fn analyze(&self, input: &mut AnalyzerInput<'_>) -> Result<Option<String>, AnalyzeError> {
        let prefix = input.read_prefix(MAGIC_NUMBER_BYTES).await?;
        if prefix.is_empty() {
            return Ok(None);
        }
        let mime_type = tree_magic_mini::from_u8(&prefix);
        Ok((mime_type != Self::UNKNOWN).then(|| mime_type.to_string()))
    }
}

/// Guesses from the filename extension only.
pub struct MimeGuessAnalyzer;

#[async_trait]
impl Analyzer for MimeGuessAnalyzer {
    async fn analyze(&self, input: &mut AnalyzerInput<'_>) -> Result<Option<String>, AnalyzeError> {
        Ok(input
            .filename
            .as_deref()
            .and_then(|filename| mime_guess::from_path(filename).first_raw())
            .map(str::to_string))
    }
}

/// Trusts the declared content type.
pub struct ContentTypeAnalyzer;

impl ContentTypeAnalyzer {
    pub const NAME: &'static str = "content_type";
}

#[async_trait]
impl Analyzer for ContentTypeAnalyzer {
    async fn analyze(&self, input: &mut AnalyzerInput<'_>) -> Result<Option<String>, AnalyzeError> {
        Ok(input.declared_type.clone())
    }

    fn trusts_declared_type(&self) -> bool {
        true
    }
}
