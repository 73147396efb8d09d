//! Cache-then-store attachment lifecycle.
//!
//! A slot starts empty, receives a cached upload on assignment and is
//! promoted to the store when the record is saved. Promotion and deletion
//! run inline or, when configured, are handed to the background job system
//! as a [`BackgroundEnvelope`](data_model::BackgroundEnvelope) and resumed
//! later by [`Attacher::perform`].

mod background;

use std::{
    collections::{BTreeMap, HashMap},
    io::Cursor,
    sync::Arc,
};

use blob_store::{BackendRegistry, Source};
use bytes::Bytes;
use data_model::{Attachment, AttachmentValue, Record, RecordKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

pub use background::{
    dump,
    run_worker,
    BackgroundJob,
    ChannelSubmitter,
    JobKind,
    JobSubmitter,
    Loaded,
    ResumeOutcome,
};

use crate::{
    analyzer::{AnalyzerInput, AnalyzerRegistry, UploadHints},
    config::{BackgroundConfig, StowageConfig},
    error::{AttacherError, AttacherResult},
    observers::{MetricsObserver, TracingObserver},
    pipeline::{PhaseContext, PhaseName, PhasePipeline},
    processor::{Processor, Versions},
    records::RecordRepository,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttacherConfig {
    pub cache: String,
    pub store: String,
    #[serde(default)]
    pub background: BackgroundConfig,
}

/// New content for a slot.
pub enum Assignment<'a> {
    /// Raw content, cached on assignment.
    Upload {
        source: &'a mut dyn Source,
        hints: UploadHints,
    },
    /// A serialized attachment, typically echoed back by a form.
    Data(&'a str),
    Clear,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finalized {
    /// Nothing cached in the slot.
    Unchanged,
    /// Promotion was handed to the job system.
    Deferred,
    Promoted(Attachment),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deletion {
    Deleted,
    Deferred,
}

/// One file to write into the store.
enum StoreUpload<'a> {
    Copy(&'a AttachmentValue),
    Generated {
        id: String,
        data: Bytes,
        base: &'a AttachmentValue,
    },
}

pub struct AttacherBuilder {
    config: AttacherConfig,
    backends: BackendRegistry,
    records: Arc<dyn RecordRepository>,
    analyzers: Option<Arc<AnalyzerRegistry>>,
    pipeline: PhasePipeline,
    processor: Option<Arc<dyn Processor>>,
    submitter: Option<Arc<dyn JobSubmitter>>,
}

impl AttacherBuilder {
    pub fn new(config: AttacherConfig, backends: BackendRegistry, records: Arc<dyn RecordRepository>) -> Self {
        Self {
            config,
            backends,
            records,
            analyzers: None,
            pipeline: PhasePipeline::default(),
            processor: None,
            submitter: None,
        }
    }

    /// Everything configurable comes from `config`: backends, the selected
    /// analyzer and background modes. Phases are logged and metered.
    pub fn from_config(config: &StowageConfig, records: Arc<dyn RecordRepository>) -> AttacherResult<Self> {
        let backends = BackendRegistry::from_config(&config.storages)?;
        let pipeline = PhasePipeline::new()
            .with_observer(Arc::new(TracingObserver))
            .with_observer(Arc::new(MetricsObserver::default()));
        Ok(Self::new(config.attacher_config(), backends, records)
            .analyzers(Arc::new(AnalyzerRegistry::with_kind(config.analyzer)))
            .pipeline(pipeline))
    }

    pub fn analyzers(mut self, analyzers: Arc<AnalyzerRegistry>) -> Self {
        self.analyzers = Some(analyzers);
        self
    }

    pub fn pipeline(mut self, pipeline: PhasePipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn submitter(mut self, submitter: Arc<dyn JobSubmitter>) -> Self {
        self.submitter = Some(submitter);
        self
    }

    pub fn build(self) -> AttacherResult<Attacher> {
        self.backends.get(&self.config.cache)?;
        self.backends.get(&self.config.store)?;
        let background = self.config.background;
        if (background.promote || background.delete) && self.submitter.is_none() {
            return Err(AttacherError::Submit(anyhow::anyhow!(
                "background jobs are enabled but no job submitter is configured"
            )));
        }

        Ok(Attacher {
            config: self.config,
            backends: self.backends,
            records: self.records,
            analyzers: self.analyzers.unwrap_or_default(),
            pipeline: self.pipeline,
            processor: self.processor,
            submitter: self.submitter,
        })
    }
}

pub struct Attacher {
    config: AttacherConfig,
    backends: BackendRegistry,
    records: Arc<dyn RecordRepository>,
    analyzers: Arc<AnalyzerRegistry>,
    pipeline: PhasePipeline,
    processor: Option<Arc<dyn Processor>>,
    submitter: Option<Arc<dyn JobSubmitter>>,
}

impl Attacher {
    pub fn config(&self) -> &AttacherConfig {
        &self.config
    }

    pub fn is_cached(&self, attachment: &Attachment) -> bool {
        attachment.is_in(&self.config.cache)
    }

    pub fn is_stored(&self, attachment: &Attachment) -> bool {
        attachment.is_in(&self.config.store)
    }

    fn context(
        &self,
        storage: &str,
        record: Option<&RecordKey>,
        slot: Option<&str>,
        phase: Option<&str>,
    ) -> PhaseContext {
        PhaseContext {
            storage: Some(storage.to_string()),
            record: record.cloned(),
            slot: slot.map(str::to_string),
            phase_label: phase.map(str::to_string),
        }
    }

    /// Extracts metadata from `source` and uploads it to the cache under a
    /// fresh id.
    pub async fn upload_to_cache(&self, source: &mut dyn Source, hints: UploadHints) -> AttacherResult<AttachmentValue> {
        let mut input = AnalyzerInput::new(source)
            .with_filename(hints.filename.as_deref())
            .with_declared_type(hints.content_type.as_deref());
        let metadata = self.analyzers.extract_metadata(&mut input).await?;
        let id = generate_id(input.filename.as_deref());

        let cache = self.backends.get(&self.config.cache)?;
        cache.upload(&mut *input.io, &id, &metadata).await?;
        debug!(%id, storage = %self.config.cache, "cached upload");
        Ok(AttachmentValue::new(&self.config.cache, id, metadata))
    }

    /// Puts new content into `slot` and returns what it replaced. Nothing is
    /// persisted or deleted here.
    pub async fn assign(
        &self,
        record: &mut Record,
        slot: &str,
        assignment: Assignment<'_>,
    ) -> AttacherResult<Option<Attachment>> {
        let attachment = match assignment {
            Assignment::Upload { source, hints } => Some(self.upload_to_cache(source, hints).await?.into()),
            Assignment::Data(data) => Some(self.accept(Attachment::from_json(data)?).await?),
            Assignment::Clear => None,
        };
        Ok(record.set_attachment(slot, attachment))
    }

    /// Stored attachments are taken as they are. Cached ones get their
    /// metadata re-extracted from the cached content, so client-supplied
    /// values cannot lie about it.
    async fn accept(&self, attachment: Attachment) -> AttacherResult<Attachment> {
        if self.is_stored(&attachment) {
            return Ok(attachment);
        }
        if !self.is_cached(&attachment) {
            let storage = attachment.storage().unwrap_or("several storages");
            return Err(AttacherError::UnknownStorage(storage.to_string()));
        }

        match attachment {
            Attachment::Single(value) => Ok(self.refresh(&value).await?.into()),
            Attachment::Versions(versions) => {
                let mut refreshed = BTreeMap::new();
                for (name, value) in versions {
                    refreshed.insert(name, self.refresh(&value).await?);
                }
                Ok(Attachment::Versions(refreshed))
            }
        }
    }

    async fn refresh(&self, value: &AttachmentValue) -> AttacherResult<AttachmentValue> {
        let backend = self.backends.get(value.storage())?;
        let mut file = backend.download(value.id()).await?;
        let mut input = AnalyzerInput::new(&mut file).with_filename(value.original_filename());
        let metadata = self.analyzers.extract_metadata(&mut input).await?;
        Ok(value.with_metadata(metadata))
    }

    /// Processes and uploads a cached attachment into the store. The caller
    /// is responsible for binding the result to a slot.
    pub async fn promote(&self, cached: &Attachment, phase: Option<&str>) -> AttacherResult<Attachment> {
        self.promote_in(cached, None, None, phase).await
    }

    async fn promote_in(
        &self,
        cached: &Attachment,
        record: Option<&RecordKey>,
        slot: Option<&str>,
        phase: Option<&str>,
    ) -> AttacherResult<Attachment> {
        let store_context = self.context(&self.config.store, record, slot, phase);
        let uploads = match cached {
            Attachment::Single(value) => {
                let versions = match self.processor.as_deref() {
                    Some(processor) => {
                        let context = self.context(value.storage(), record, slot, phase);
                        self.pipeline
                            .run(
                                PhaseName::Process,
                                1,
                                &context,
                                self.process(processor, value, phase),
                                |versions: &Option<Versions>| versions.as_ref().map_or(1, |v| v.len()),
                            )
                            .await?
                    }
                    None => None,
                };
                match versions {
                    Some(versions) if !versions.is_empty() => versions
                        .into_iter()
                        .map(|(name, data)| {
                            let id = version_id(value.id(), &name);
                            (Some(name), StoreUpload::Generated { id, data, base: value })
                        })
                        .collect(),
                    _ => vec![(None, StoreUpload::Copy(value))],
                }
            }
            Attachment::Versions(values) => values
                .iter()
                .map(|(name, value)| (Some(name.clone()), StoreUpload::Copy(value)))
                .collect(),
        };

        self.store(uploads, &store_context).await
    }

    async fn process(
        &self,
        processor: &dyn Processor,
        value: &AttachmentValue,
        phase: Option<&str>,
    ) -> AttacherResult<Option<Versions>> {
        let backend = self.backends.get(value.storage())?;
        let mut file = backend.download(value.id()).await?;
        processor
            .process(&mut file, value, phase)
            .await
            .map_err(AttacherError::Processing)
    }

    async fn store(
        &self,
        uploads: Vec<(Option<String>, StoreUpload<'_>)>,
        context: &PhaseContext,
    ) -> AttacherResult<Attachment> {
        let input_count = uploads.len();
        let operation = async {
            let store = self.backends.get(&self.config.store)?;
            let mut single = None;
            let mut versions = BTreeMap::new();

            for (name, upload) in uploads {
                let value = match upload {
                    StoreUpload::Copy(value) => {
                        let backend = self.backends.get(value.storage())?;
                        let mut file = backend.download(value.id()).await?;
                        store.upload(&mut file, value.id(), value.metadata()).await?;
                        AttachmentValue::new(&self.config.store, value.id(), value.metadata().clone())
                    }
                    StoreUpload::Generated { id, data, base } => {
                        let mut source = Cursor::new(data);
                        let metadata = {
                            let mut input =
                                AnalyzerInput::new(&mut source).with_filename(base.original_filename());
                            self.analyzers.extract_metadata(&mut input).await?
                        };
                        store.upload(&mut source, &id, &metadata).await?;
                        AttachmentValue::new(&self.config.store, id, metadata)
                    }
                };
                match name {
                    Some(name) => {
                        versions.insert(name, value);
                    }
                    None => single = Some(value),
                }
            }

            Ok::<_, AttacherError>(match single {
                Some(value) => Attachment::Single(value),
                None => Attachment::Versions(versions),
            })
        };

        self.pipeline
            .run(PhaseName::Store, input_count, context, operation, Attachment::file_count)
            .await
    }

    /// Promotes a cached slot, inline or through the job system.
    pub async fn finalize(&self, record: &mut Record, slot: &str, phase: Option<&str>) -> AttacherResult<Finalized> {
        let Some(attachment) = record.attachment(slot).cloned() else {
            return Ok(Finalized::Unchanged);
        };
        if !self.is_cached(&attachment) {
            return Ok(Finalized::Unchanged);
        }

        if self.config.background.promote {
            let envelope = dump(record.key(), slot, Some(&attachment), phase)?;
            self.submit(BackgroundJob::Promote(envelope)).await?;
            info!(record = %record.key(), slot, "deferred promotion");
            return Ok(Finalized::Deferred);
        }

        let stored = self
            .promote_in(&attachment, Some(record.key()), Some(slot), phase)
            .await?;
        record.set_attachment(slot, Some(stored.clone()));
        self.persist(record, slot).await?;
        Ok(Finalized::Promoted(stored))
    }

    /// Deletes every file of `attachment`, inline or through the job system.
    pub async fn delete(
        &self,
        record: &Record,
        slot: &str,
        attachment: &Attachment,
        phase: Option<&str>,
    ) -> AttacherResult<Deletion> {
        if self.config.background.delete {
            let envelope = dump(record.key(), slot, Some(attachment), phase)?;
            self.submit(BackgroundJob::Delete(envelope)).await?;
            return Ok(Deletion::Deferred);
        }
        self.delete_now(attachment, Some(record.key()), Some(slot), phase)
            .await?;
        Ok(Deletion::Deleted)
    }

    /// Empties `slot`, persists the record and deletes what the slot held.
    pub async fn destroy(
        &self,
        record: &mut Record,
        slot: &str,
        phase: Option<&str>,
    ) -> AttacherResult<Option<Deletion>> {
        let Some(attachment) = record.set_attachment(slot, None) else {
            return Ok(None);
        };
        self.persist(record, slot).await?;
        self.delete(record, slot, &attachment, phase).await.map(Some)
    }

    async fn delete_now(
        &self,
        attachment: &Attachment,
        record: Option<&RecordKey>,
        slot: Option<&str>,
        phase: Option<&str>,
    ) -> AttacherResult<()> {
        let mut by_storage: HashMap<&str, Vec<String>> = HashMap::new();
        for file in attachment.files() {
            by_storage
                .entry(file.storage())
                .or_default()
                .push(file.id().to_string());
        }

        for (storage, ids) in by_storage {
            let context = self.context(storage, record, slot, phase);
            let operation = async {
                let backend = self.backends.get(storage)?;
                match backend.batch_delete() {
                    Some(batch) => batch.delete_many(&ids).await?,
                    None => {
                        for id in &ids {
                            backend.delete(id).await?;
                        }
                    }
                }
                Ok::<_, AttacherError>(ids.len())
            };
            self.pipeline
                .run(PhaseName::Delete, ids.len(), &context, operation, |deleted: &usize| *deleted)
                .await?;
        }
        Ok(())
    }

    async fn persist(&self, record: &Record, slot: &str) -> AttacherResult<()> {
        if record.is_placeholder() {
            debug!(record = %record.key(), slot, "not persisting placeholder record");
            return Ok(());
        }
        self.records
            .save_attachment(record, slot)
            .await
            .map_err(AttacherError::Record)
    }

    async fn submit(&self, job: BackgroundJob) -> AttacherResult<()> {
        let submitter = self.submitter.as_ref().ok_or_else(|| {
            AttacherError::Submit(anyhow::anyhow!("no job submitter is configured"))
        })?;
        submitter.submit(job).await.map_err(AttacherError::Submit)
    }
}

fn generate_id(filename: Option<&str>) -> String {
    let id = Uuid::new_v4().simple().to_string();
    let extension = filename
        .and_then(|name| std::path::Path::new(name).extension())
        .and_then(|ext| ext.to_str());
    match extension {
        Some(ext) => format!("{}.{}", id, ext.to_lowercase()),
        None => id,
    }
}

/// Store id of a processed version. Derived from the cached id so that
/// promoting the same upload twice writes to the same place.
fn version_id(cached_id: &str, version: &str) -> String {
    match cached_id.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.contains('/') => {
            format!("{}/{}.{}", stem, version, ext)
        }
        _ => format!("{}/{}", cached_id, version),
    }
}
