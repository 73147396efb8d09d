use std::{io::Cursor, sync::Arc, sync::Mutex};

use blob_store::{BackendRegistry, MemoryBackend};
use data_model::{
    test_objects::tests::{TEST_RECORD_ID, TEST_RECORD_TYPE, TEST_SLOT},
    AttachmentValue,
    Record,
    RecordKey,
};
use tokio::sync::mpsc;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    analyzer::{AnalyzerKind, AnalyzerRegistry, UploadHints},
    attacher::{Assignment, Attacher, AttacherBuilder, AttacherConfig, BackgroundJob, ChannelSubmitter},
    config::BackgroundConfig,
    pipeline::{PhaseEvent, PhaseName, PhaseObserver, PhasePipeline},
    processor::Processor,
    records::InMemoryRecords,
};

/// Five bytes standing in for an uploaded photo.
pub const IMAGE: &[u8] = b"image";

#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<PhaseEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<PhaseEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn for_phase(&self, phase: PhaseName) -> Vec<PhaseEvent> {
        self.events().into_iter().filter(|e| e.phase == phase).collect()
    }
}

impl PhaseObserver for RecordingObserver {
    fn on_phase(&self, event: &PhaseEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// An attacher over two memory backends (`cache` and `store`), analyzing by
/// filename extension.
pub struct TestAttacher {
    pub attacher: Arc<Attacher>,
    pub backends: BackendRegistry,
    pub cache: Arc<MemoryBackend>,
    pub store: Arc<MemoryBackend>,
    pub records: Arc<InMemoryRecords>,
    pub observer: Arc<RecordingObserver>,
    pub jobs: Option<mpsc::UnboundedReceiver<String>>,
}

impl TestAttacher {
    pub fn new(background: bool, processor: Option<Arc<dyn Processor>>) -> Self {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry().with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let cache = Arc::new(MemoryBackend::new());
        let store = Arc::new(MemoryBackend::new());
        let backends = BackendRegistry::new()
            .register("cache", cache.clone())
            .register("store", store.clone());
        let records = Arc::new(InMemoryRecords::new());
        let observer = Arc::new(RecordingObserver::default());

        let config = AttacherConfig {
            cache: "cache".to_string(),
            store: "store".to_string(),
            background: BackgroundConfig {
                promote: background,
                delete: background,
            },
        };
        let mut builder = AttacherBuilder::new(config, backends.clone(), records.clone())
            .analyzers(Arc::new(AnalyzerRegistry::with_kind(AnalyzerKind::MimeGuess)))
            .pipeline(PhasePipeline::new().with_observer(observer.clone()));
        if let Some(processor) = processor {
            builder = builder.processor(processor);
        }
        let mut jobs = None;
        if background {
            let (submitter, receiver) = ChannelSubmitter::new();
            builder = builder.submitter(Arc::new(submitter));
            jobs = Some(receiver);
        }

        Self {
            attacher: Arc::new(builder.build().unwrap()),
            backends,
            cache,
            store,
            records,
            observer,
            jobs,
        }
    }

    /// Inserts an empty record into the repository and returns it.
    pub async fn saved_record(&self) -> Record {
        let record = Record::new(RecordKey::new(TEST_RECORD_TYPE, TEST_RECORD_ID));
        self.records.insert(record.clone()).await;
        record
    }

    /// Assigns a fresh upload of [`IMAGE`] to the test slot and persists the
    /// record, like an application saving a form.
    pub async fn assign_upload(&self, record: &mut Record) -> AttachmentValue {
        self.assign_bytes(record, IMAGE, "image.jpg").await
    }

    pub async fn assign_bytes(&self, record: &mut Record, data: &[u8], filename: &str) -> AttachmentValue {
        let mut source = Cursor::new(data.to_vec());
        let hints = UploadHints {
            filename: Some(filename.to_string()),
            content_type: None,
        };
        self.attacher
            .assign(record, TEST_SLOT, Assignment::Upload { source: &mut source, hints })
            .await
            .unwrap();
        self.records.insert(record.clone()).await;
        match record.attachment(TEST_SLOT) {
            Some(data_model::Attachment::Single(value)) => value.clone(),
            other => panic!("expected a cached file, got {:?}", other),
        }
    }

    /// Takes the next submitted job off the queue.
    pub fn next_job(&mut self) -> BackgroundJob {
        let payload = self
            .jobs
            .as_mut()
            .expect("background jobs are disabled")
            .try_recv()
            .expect("no job was submitted");
        BackgroundJob::from_json(&payload).unwrap()
    }
}
