#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, io::Cursor, sync::Arc, time::Duration};

    use anyhow::Result;
    use async_trait::async_trait;
    use blob_store::{Source, StorageBackend};
    use bytes::Bytes;
    use data_model::{
        test_objects::tests::{mock_value, TEST_RECORD_ID, TEST_RECORD_TYPE, TEST_SLOT},
        Attachment,
        AttachmentValue,
        Metadata,
        Record,
        RecordKey,
    };
    use tokio::io::AsyncReadExt;

    use crate::{
        analyzer::{AnalyzerKind, AnalyzerRegistry},
        attacher::{
            dump,
            run_worker,
            Assignment,
            AttacherBuilder,
            BackgroundJob,
            Deletion,
            Finalized,
            JobKind,
            ResumeOutcome,
        },
        config::BackgroundConfig,
        pipeline::{PhaseContext, PhaseHook, PhaseName, PhasePipeline},
        processor::{Processor, Versions},
        records::InMemoryRecords,
        testing::{TestAttacher, IMAGE},
    };

    /// Produces an `original` and a two-byte `thumb`.
    struct Thumbnails;

    #[async_trait]
    impl Processor for Thumbnails {
        async fn process(
            &self,
            source: &mut dyn Source,
            _cached: &AttachmentValue,
            _phase: Option<&str>,
        ) -> Result<Option<Versions>> {
            let mut data = Vec::new();
            source.read_to_end(&mut data).await?;
            let mut versions = Versions::new();
            versions.insert("thumb".to_string(), Bytes::copy_from_slice(&data[..2]));
            versions.insert("original".to_string(), Bytes::from(data));
            Ok(Some(versions))
        }
    }

    /// Rebinds the slot in the repository right before the store phase,
    /// like a user saving a new upload while promotion is running.
    struct Reassign {
        records: Arc<InMemoryRecords>,
        replacement: Attachment,
    }

    #[async_trait]
    impl PhaseHook for Reassign {
        async fn before(&self, phase: PhaseName, context: &PhaseContext) {
            if phase != PhaseName::Store {
                return;
            }
            let key = context.record.clone().unwrap();
            let mut record = self.records.get(&key).await.unwrap();
            record.set_attachment(TEST_SLOT, Some(self.replacement.clone()));
            self.records.insert(record).await;
        }
    }

    fn single(attachment: Option<&Attachment>) -> &AttachmentValue {
        match attachment {
            Some(Attachment::Single(value)) => value,
            other => panic!("expected a single file, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cached_data_metadata_is_reextracted() {
        let harness = TestAttacher::new(false, None);
        harness
            .cache
            .upload(&mut Cursor::new(IMAGE.to_vec()), "abc.jpg", &Metadata::new())
            .await
            .unwrap();

        let tampered = mock_value("cache", "abc.jpg", 24354535).to_json().unwrap();
        let mut record = Record::new(RecordKey::new(TEST_RECORD_TYPE, TEST_RECORD_ID));
        harness
            .attacher
            .assign(&mut record, TEST_SLOT, Assignment::Data(&tampered))
            .await
            .unwrap();

        let value = single(record.attachment(TEST_SLOT));
        assert_eq!(value.size(), Some(5));
        assert_eq!(value.mime_type(), Some("image/jpeg"));
        assert_eq!(value.original_filename(), Some("image.jpg"));
    }

    #[tokio::test]
    async fn test_stored_data_is_trusted() {
        let harness = TestAttacher::new(false, None);
        let tampered = mock_value("store", "abc.jpg", 24354535).to_json().unwrap();
        let mut record = Record::new(RecordKey::new(TEST_RECORD_TYPE, TEST_RECORD_ID));

        harness
            .attacher
            .assign(&mut record, TEST_SLOT, Assignment::Data(&tampered))
            .await
            .unwrap();

        assert_eq!(single(record.attachment(TEST_SLOT)).size(), Some(24354535));
        assert!(harness.observer.events().is_empty());
    }

    #[tokio::test]
    async fn test_versions_are_counted_by_observers() {
        let harness = TestAttacher::new(false, Some(Arc::new(Thumbnails)));
        let mut record = harness.saved_record().await;
        let cached = harness.assign_upload(&mut record).await;

        let stored = match harness.attacher.finalize(&mut record, TEST_SLOT, Some("create")).await.unwrap() {
            Finalized::Promoted(stored) => stored,
            other => panic!("expected promotion, got {:?}", other),
        };
        let Attachment::Versions(versions) = &stored else {
            panic!("expected versions, got {:?}", stored);
        };
        let stem = cached.id().trim_end_matches(".jpg");
        assert_eq!(versions["original"].id(), format!("{}/original.jpg", stem));
        assert_eq!(versions["thumb"].size(), Some(2));
        assert_eq!(harness.store.len(), 2);

        let process = harness.observer.for_phase(PhaseName::Process);
        assert_eq!(process.len(), 1);
        assert_eq!(process[0].output_count, Some(2));
        assert_eq!(process[0].context.storage.as_deref(), Some("cache"));

        let store = harness.observer.for_phase(PhaseName::Store);
        assert_eq!(store.len(), 1);
        assert_eq!(store[0].input_count, 2);
        assert_eq!(store[0].output_count, Some(2));
        assert_eq!(store[0].context.phase_label.as_deref(), Some("create"));
        assert_eq!(store[0].context.record.as_ref(), Some(record.key()));

        let deletion = harness.attacher.destroy(&mut record, TEST_SLOT, None).await.unwrap();
        assert_eq!(deletion, Some(Deletion::Deleted));
        let delete = harness.observer.for_phase(PhaseName::Delete);
        assert_eq!(delete.len(), 1);
        assert_eq!(delete[0].output_count, Some(2));
        assert!(harness.store.is_empty());
    }

    #[tokio::test]
    async fn test_stale_promotion_is_discarded() {
        let mut harness = TestAttacher::new(true, None);
        let mut record = harness.saved_record().await;
        harness.assign_upload(&mut record).await;

        let finalized = harness.attacher.finalize(&mut record, TEST_SLOT, None).await.unwrap();
        assert_eq!(finalized, Finalized::Deferred);
        assert!(harness.attacher.is_cached(record.attachment(TEST_SLOT).unwrap()));
        let job = harness.next_job();
        assert_eq!(job.kind(), JobKind::Promote);

        let replacement = harness.assign_bytes(&mut record, b"other", "other.png").await;

        let outcome = harness.attacher.perform(job).await.unwrap();
        assert_eq!(outcome, ResumeOutcome::Discarded);
        assert!(harness.store.is_empty());
        let saved = harness.records.get(record.key()).await.unwrap();
        assert_eq!(single(saved.attachment(TEST_SLOT)), &replacement);
    }

    #[tokio::test]
    async fn test_fresh_promotion_is_persisted() {
        let mut harness = TestAttacher::new(true, None);
        let mut record = harness.saved_record().await;
        let cached = harness.assign_upload(&mut record).await;
        harness.attacher.finalize(&mut record, TEST_SLOT, None).await.unwrap();
        let job = harness.next_job();

        let outcome = harness.attacher.perform(job.clone()).await.unwrap();
        let ResumeOutcome::Promoted(stored) = outcome else {
            panic!("expected promotion");
        };
        assert!(harness.attacher.is_stored(&stored));
        assert!(harness.store.exists(cached.id()).await.unwrap());
        let saved = harness.records.get(record.key()).await.unwrap();
        assert_eq!(saved.attachment(TEST_SLOT), Some(&stored));

        // A redelivered job finds the slot already promoted.
        let outcome = harness.attacher.perform(job).await.unwrap();
        assert_eq!(outcome, ResumeOutcome::Discarded);
        assert_eq!(harness.store.len(), 1);
        assert!(harness.store.exists(cached.id()).await.unwrap());
    }

    #[tokio::test]
    async fn test_reassignment_during_promotion_removes_stored_copy() {
        let mut harness = TestAttacher::new(true, None);
        let mut record = harness.saved_record().await;
        harness.assign_upload(&mut record).await;
        harness.attacher.finalize(&mut record, TEST_SLOT, None).await.unwrap();
        let job = harness.next_job();

        let replacement: Attachment = mock_value("store", "replacement.jpg", 3).into();
        let hook = Reassign {
            records: harness.records.clone(),
            replacement: replacement.clone(),
        };
        let config = harness.attacher.config().clone();
        let worker = AttacherBuilder::new(
            crate::attacher::AttacherConfig {
                background: BackgroundConfig::default(),
                ..config
            },
            harness.backends.clone(),
            harness.records.clone(),
        )
        .analyzers(Arc::new(AnalyzerRegistry::with_kind(AnalyzerKind::MimeGuess)))
        .pipeline(PhasePipeline::new().with_hook(Arc::new(hook)))
        .build()
        .unwrap();

        let outcome = worker.perform(job).await.unwrap();
        assert_eq!(outcome, ResumeOutcome::Discarded);
        assert!(harness.store.is_empty());
        let saved = harness.records.get(record.key()).await.unwrap();
        assert_eq!(saved.attachment(TEST_SLOT), Some(&replacement));
    }

    #[tokio::test]
    async fn test_missing_record_resolves_to_placeholder() {
        let harness = TestAttacher::new(true, None);
        let key = RecordKey::new(TEST_RECORD_TYPE, "deleted");
        let cached: Attachment = harness
            .attacher
            .upload_to_cache(&mut Cursor::new(IMAGE.to_vec()), Default::default())
            .await
            .unwrap()
            .into();

        let promote = dump(&key, TEST_SLOT, Some(&cached), None).unwrap();
        let loaded = harness.attacher.load(&promote).await.unwrap();
        assert!(loaded.record.is_placeholder());
        assert_eq!(loaded.attachment.as_ref(), Some(&cached));

        let outcome = harness.attacher.resume_promote(&promote).await.unwrap();
        assert_eq!(outcome, ResumeOutcome::Discarded);
        assert!(harness.store.is_empty());
        assert!(harness.records.get(&key).await.is_none());

        let delete = dump(&key, TEST_SLOT, Some(&cached), None).unwrap();
        let outcome = harness.attacher.resume_delete(&delete).await.unwrap();
        assert_eq!(outcome, ResumeOutcome::Deleted);
        assert!(harness.cache.is_empty());
    }

    #[tokio::test]
    async fn test_multi_delete_removes_every_file() {
        let harness = TestAttacher::new(false, None);
        let record = harness.saved_record().await;
        let mut versions = BTreeMap::new();
        for (name, id) in [("a", "one.jpg"), ("b", "nested/two.png"), ("c", "three")] {
            harness
                .cache
                .upload(&mut Cursor::new(IMAGE.to_vec()), id, &Metadata::new())
                .await
                .unwrap();
            versions.insert(name.to_string(), mock_value("cache", id, 5));
        }
        harness
            .cache
            .upload(&mut Cursor::new(IMAGE.to_vec()), "unrelated.jpg", &Metadata::new())
            .await
            .unwrap();

        let deletion = harness
            .attacher
            .delete(&record, TEST_SLOT, &Attachment::Versions(versions), None)
            .await
            .unwrap();
        assert_eq!(deletion, Deletion::Deleted);
        assert_eq!(harness.cache.len(), 1);
        assert!(harness.cache.exists("unrelated.jpg").await.unwrap());

        let delete = harness.observer.for_phase(PhaseName::Delete);
        assert_eq!(delete.len(), 1);
        assert_eq!(delete[0].input_count, 3);
        assert_eq!(delete[0].output_count, Some(3));
    }

    #[tokio::test]
    async fn test_deferred_destroy() {
        let mut harness = TestAttacher::new(true, None);
        let mut record = harness.saved_record().await;
        let cached = harness.assign_upload(&mut record).await;

        let deletion = harness.attacher.destroy(&mut record, TEST_SLOT, Some("destroy")).await.unwrap();
        assert_eq!(deletion, Some(Deletion::Deferred));
        assert!(harness.cache.exists(cached.id()).await.unwrap());
        let saved = harness.records.get(record.key()).await.unwrap();
        assert!(saved.attachment(TEST_SLOT).is_none());

        let job = harness.next_job();
        assert_eq!(job.kind(), JobKind::Delete);
        assert_eq!(job.envelope().phase.as_deref(), Some("destroy"));
        let outcome = harness.attacher.perform(job).await.unwrap();
        assert_eq!(outcome, ResumeOutcome::Deleted);
        assert!(harness.cache.is_empty());
    }

    #[tokio::test]
    async fn test_worker_promotes_in_background() {
        let mut harness = TestAttacher::new(true, None);
        let jobs = harness.jobs.take().unwrap();
        let worker = tokio::spawn(run_worker(harness.attacher.clone(), jobs));

        let mut record = harness.saved_record().await;
        let cached = harness.assign_upload(&mut record).await;
        harness.attacher.finalize(&mut record, TEST_SLOT, None).await.unwrap();

        let mut promoted = false;
        for _ in 0..100 {
            let saved = harness.records.get(record.key()).await.unwrap();
            if saved.attachment(TEST_SLOT).is_some_and(|a| harness.attacher.is_stored(a)) {
                promoted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        worker.abort();

        assert!(promoted);
        assert!(harness.store.exists(cached.id()).await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_job_payload() {
        assert!(BackgroundJob::from_json(r#"{"job":"promote","envelope":{"record":["User","1"]}}"#).is_err());
    }
}
