//! Conformance driver for storage backends.
//!
//! [`Linter`] uploads throwaway objects into a backend and checks every
//! required operation and every optional capability the backend claims.
//! Failures go through the configured [`LintAction`]: `Error` stops at the
//! first violation, `Warn` logs it and moves on to the next independent
//! check. Checks that depend on a step that already failed are recorded as
//! skipped instead of piling up follow-on failures.

use std::{fmt, future::Future, io::Cursor, sync::Arc};

use bytes::Bytes;
use data_model::Metadata;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    BatchDeleteBackend,
    BlobResult,
    ClearableBackend,
    MovingBackend,
    StorageBackend,
    StorageConfig,
    StreamingBackend,
};

/// Produces the payload uploaded for each check.
pub type ContentFactory = Box<dyn Fn() -> Bytes + Send + Sync>;

const DEFAULT_CONTENT: &[u8] = b"stowage lint payload";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LintAction {
    #[default]
    Error,
    Warn,
}

/// A backend broke the storage contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConformanceViolation {
    pub backend: String,
    pub operation: String,
    pub description: String,
}

impl fmt::Display for ConformanceViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} - {}", self.backend, self.operation, self.description)
    }
}

impl std::error::Error for ConformanceViolation {}

/// Outcome of a lint run.
#[derive(Debug, Clone, Default)]
pub struct LintReport {
    pub backend: String,

    /// Number of assertions that held.
    pub passed: usize,

    /// Violations collected in `Warn` mode.
    pub violations: Vec<ConformanceViolation>,

    /// Checks that were not run, with the reason.
    pub skipped: Vec<String>,
}

impl LintReport {
    pub fn is_conformant(&self) -> bool {
        self.violations.is_empty()
    }
}

type Step<T> = Result<T, ConformanceViolation>;

pub struct Linter<'a> {
    backend: &'a dyn StorageBackend,
    action: LintAction,
    content: ContentFactory,
    report: LintReport,
}

impl<'a> Linter<'a> {
    pub fn new(
        backend: &'a dyn StorageBackend,
        action: LintAction,
        content: Option<ContentFactory>,
    ) -> Self {
        Self {
            backend,
            action,
            content: content.unwrap_or_else(|| Box::new(|| Bytes::from_static(DEFAULT_CONTENT))),
            report: LintReport {
                backend: backend.name().to_string(),
                ..Default::default()
            },
        }
    }

    pub async fn run(mut self) -> Result<LintReport, ConformanceViolation> {
        self.lint_storage().await?;
        self.lint_move().await?;
        self.lint_multi_delete().await?;
        self.lint_clear().await?;

        info!(
            backend = %self.report.backend,
            passed = self.report.passed,
            violations = self.report.violations.len(),
            skipped = self.report.skipped.len(),
            "lint finished"
        );
        Ok(self.report)
    }

    async fn lint_storage(&mut self) -> Step<()> {
        let id = random_id();
        if !self.upload(&id).await? {
            self.skip("download, open, read, exists, url, stream, delete: upload failed");
            return Ok(());
        }

        let result = self.lint_uploaded(&id).await;
        if result.is_err() {
            cleanup(self.backend, &[id]).await;
        }
        result
    }

    async fn lint_uploaded(&mut self, id: &str) -> Step<()> {
        self.lint_download(id).await?;
        self.lint_open(id).await?;
        self.lint_read(id).await?;
        self.lint_exists(id).await?;
        self.lint_url(id)?;
        match self.backend.streaming() {
            Some(streaming) => self.lint_stream(streaming, id).await?,
            None => self.skip("stream: not supported"),
        }
        self.lint_delete(id).await
    }

    async fn lint_download(&mut self, id: &str) -> Step<()> {
        let backend = self.backend;
        let Some(mut file) = self.attempt("download", backend.download(id)).await? else {
            return Ok(());
        };
        let mut data = Vec::new();
        if let Err(e) = file.read_to_end(&mut data).await {
            return self.fail("download", format!("returned an unreadable file: {e}"));
        }
        self.check("download", !data.is_empty(), "returns an empty file")?;
        Ok(())
    }

    async fn lint_open(&mut self, id: &str) -> Step<()> {
        let backend = self.backend;
        let Some(mut reader) = self.attempt("open", backend.open(id)).await? else {
            return Ok(());
        };
        let mut data = Vec::new();
        if let Err(e) = reader.read_to_end(&mut data).await {
            return self.fail("open", format!("returned an unreadable stream: {e}"));
        }
        self.check("open", !data.is_empty(), "returns an empty stream")?;
        Ok(())
    }

    async fn lint_read(&mut self, id: &str) -> Step<()> {
        let backend = self.backend;
        if let Some(data) = self.attempt("read", backend.read(id)).await? {
            self.check("read", !data.is_empty(), "returns empty content")?;
        }
        Ok(())
    }

    async fn lint_exists(&mut self, id: &str) -> Step<()> {
        let backend = self.backend;
        if let Some(exists) = self.attempt("exists", backend.exists(id)).await? {
            self.check("exists", exists, "returns false for a file that was uploaded")?;
        }
        Ok(())
    }

    fn lint_url(&mut self, id: &str) -> Step<()> {
        let url = self.backend.url(id);
        self.check(
            "url",
            url.as_deref().map_or(true, |u| !u.is_empty()),
            "returns an empty string instead of a URL or nothing",
        )?;
        Ok(())
    }

    async fn lint_stream(&mut self, streaming: &dyn StreamingBackend, id: &str) -> Step<()> {
        let Some(stream) = self.attempt("stream", streaming.stream(id)).await? else {
            return Ok(());
        };

        let mut content = Vec::new();
        let mut declared = Vec::new();
        let chunks: Vec<_> = stream.collect().await;
        for chunk in chunks {
            match chunk {
                Ok(chunk) => {
                    content.extend_from_slice(&chunk.data);
                    declared.extend(chunk.total_len);
                }
                Err(e) => return self.fail("stream", format!("raised an error: {e}")),
            }
        }

        if !self.check("stream", !content.is_empty(), "yields no content")? {
            return Ok(());
        }
        if let Some(wrong) = declared.iter().find(|len| **len != content.len() as u64) {
            return self.fail(
                "stream",
                format!(
                    "declares a total length of {} bytes but yields {} bytes",
                    wrong,
                    content.len()
                ),
            );
        }
        if !declared.is_empty() {
            self.report.passed += 1;
        }
        Ok(())
    }

    async fn lint_delete(&mut self, id: &str) -> Step<()> {
        let backend = self.backend;
        if self.attempt("delete", backend.delete(id)).await?.is_none() {
            self.skip("exists after delete: delete failed");
            return Ok(());
        }
        if let Some(exists) = self.attempt("exists", backend.exists(id)).await? {
            self.check("delete", !exists, "file still exists after deleting")?;
        }
        Ok(())
    }

    async fn lint_move(&mut self) -> Step<()> {
        let backend = self.backend;
        let Some(moving) = backend.moving() else {
            self.skip("move: not supported");
            return Ok(());
        };

        let (source, dest) = (random_id(), random_id());
        if !self.upload(&source).await? {
            self.skip("move: upload failed");
            return Ok(());
        }

        if !moving.movable(&source, &dest).await {
            self.skip("move: movable returned false");
            cleanup(backend, &[source]).await;
            return Ok(());
        }

        let result = self.lint_moved(moving, &source, &dest).await;
        cleanup(backend, &[source, dest]).await;
        result
    }

    async fn lint_moved(&mut self, moving: &dyn MovingBackend, source: &str, dest: &str) -> Step<()> {
        let backend = self.backend;
        if self
            .attempt("move", moving.move_object(source, dest, &Metadata::new()))
            .await?
            .is_none()
        {
            return Ok(());
        }
        if let Some(exists) = self.attempt("exists", backend.exists(dest)).await? {
            self.check("move", exists, "moved file doesn't exist at the destination")?;
        }
        if let Some(exists) = self.attempt("exists", backend.exists(source)).await? {
            self.check("move", !exists, "source file still exists after moving")?;
        }
        Ok(())
    }

    async fn lint_multi_delete(&mut self) -> Step<()> {
        let backend = self.backend;
        let Some(batch) = backend.batch_delete() else {
            self.skip("multi_delete: not supported");
            return Ok(());
        };

        let id = random_id();
        if !self.upload(&id).await? {
            self.skip("multi_delete: upload failed");
            return Ok(());
        }

        let ids = [id];
        let result = self.lint_multi_deleted(batch, &ids).await;
        cleanup(backend, &ids).await;
        result
    }

    async fn lint_multi_deleted(&mut self, batch: &dyn BatchDeleteBackend, ids: &[String]) -> Step<()> {
        let backend = self.backend;
        if self.attempt("multi_delete", batch.delete_many(ids)).await?.is_none() {
            return Ok(());
        }
        for id in ids {
            if let Some(exists) = self.attempt("exists", backend.exists(id)).await? {
                self.check("multi_delete", !exists, "file still exists after multi-deleting it")?;
            }
        }
        Ok(())
    }

    async fn lint_clear(&mut self) -> Step<()> {
        let backend = self.backend;
        let Some(clearable) = backend.clearable() else {
            self.skip("clear: not supported");
            return Ok(());
        };

        let id = random_id();
        if !self.upload(&id).await? {
            self.skip("clear: upload failed");
            return Ok(());
        }

        let result = self.lint_cleared(clearable, &id).await;
        cleanup(backend, &[id]).await;
        result
    }

    async fn lint_cleared(&mut self, clearable: &dyn ClearableBackend, id: &str) -> Step<()> {
        let backend = self.backend;
        if self.attempt("clear", clearable.clear()).await?.is_none() {
            return Ok(());
        }
        if let Some(exists) = self.attempt("exists", backend.exists(id)).await? {
            self.check("clear", !exists, "file still exists after clearing")?;
        }
        Ok(())
    }

    async fn upload(&mut self, id: &str) -> Step<bool> {
        let backend = self.backend;
        let mut source = Cursor::new((self.content)());
        let metadata = Metadata::new();
        let uploaded = self
            .attempt("upload", backend.upload(&mut source, id, &metadata))
            .await?;
        Ok(uploaded.is_some())
    }

    /// Awaits a backend call, turning an error into a violation of
    /// `operation`.
    async fn attempt<T>(
        &mut self,
        operation: &str,
        call: impl Future<Output = BlobResult<T>>,
    ) -> Step<Option<T>> {
        match call.await {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                self.fail(operation, format!("raised an error: {e}"))?;
                Ok(None)
            }
        }
    }

    fn check(&mut self, operation: &str, holds: bool, description: &str) -> Step<bool> {
        if holds {
            self.report.passed += 1;
            return Ok(true);
        }
        self.fail(operation, description.to_string())?;
        Ok(false)
    }

    fn fail(&mut self, operation: &str, description: String) -> Step<()> {
        let violation = ConformanceViolation {
            backend: self.backend.name().to_string(),
            operation: operation.to_string(),
            description,
        };
        match self.action {
            LintAction::Error => Err(violation),
            LintAction::Warn => {
                warn!("{}", violation);
                self.report.violations.push(violation);
                Ok(())
            }
        }
    }

    fn skip(&mut self, reason: &str) {
        info!(backend = %self.report.backend, reason, "skipping lint check");
        self.report.skipped.push(reason.to_string());
    }
}

/// Builds the storage described by `config`, narrowed to a fresh scope.
/// A run against it cannot reach objects that existed before, which
/// matters since the clear check empties the whole backend.
pub fn scoped_backend(config: &StorageConfig) -> BlobResult<Arc<dyn StorageBackend>> {
    config.scoped(&random_id())?.build()
}

fn random_id() -> String {
    format!("stowage-lint-{}", Uuid::new_v4().simple())
}

async fn cleanup(backend: &dyn StorageBackend, ids: &[String]) {
    for id in ids {
        let _ = backend.delete(id).await;
    }
}
