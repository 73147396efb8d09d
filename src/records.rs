//! Record persistence collaborator.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use data_model::{Record, RecordKey};
use tokio::sync::RwLock;

/// Loads records and persists slot changes. Implemented by the host
/// application over its own database.
#[async_trait]
pub trait RecordRepository: Send + Sync {
    async fn find(&self, key: &RecordKey) -> Result<Option<Record>>;

    /// Persists the current content of `slot` on `record`.
    async fn save_attachment(&self, record: &Record, slot: &str) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryRecords {
    records: RwLock<HashMap<RecordKey, Record>>,
}

impl InMemoryRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: Record) {
        self.records.write().await.insert(record.key().clone(), record);
    }

    pub async fn get(&self, key: &RecordKey) -> Option<Record> {
        self.records.read().await.get(key).cloned()
    }
}

#[async_trait]
impl RecordRepository for InMemoryRecords {
    async fn find(&self, key: &RecordKey) -> Result<Option<Record>> {
        Ok(self.get(key).await)
    }

    async fn save_attachment(&self, record: &Record, slot: &str) -> Result<()> {
        if record.is_placeholder() {
            anyhow::bail!("cannot persist placeholder record {}", record.key());
        }
        let mut records = self.records.write().await;
        let stored = records
            .entry(record.key().clone())
            .or_insert_with(|| Record::new(record.key().clone()));
        stored.set_attachment(slot, record.attachment(slot).cloned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use data_model::{
        test_objects::tests::{mock_value, TEST_RECORD_ID, TEST_RECORD_TYPE, TEST_SLOT},
        Attachment,
    };

    use super::*;

    #[tokio::test]
    async fn test_save_attachment_touches_only_the_slot() {
        let records = InMemoryRecords::new();
        let key = RecordKey::new(TEST_RECORD_TYPE, TEST_RECORD_ID);

        let mut existing = Record::new(key.clone());
        existing.set_attachment("document", Some(mock_value("store", "doc.pdf", 10).into()));
        records.insert(existing).await;

        let mut edited = Record::new(key.clone());
        edited.set_attachment(TEST_SLOT, Some(mock_value("cache", "a.jpg", 5).into()));
        records.save_attachment(&edited, TEST_SLOT).await.unwrap();

        let saved = records.get(&key).await.unwrap();
        assert!(saved.attachment("document").is_some());
        assert_eq!(
            saved.attachment(TEST_SLOT),
            Some(&Attachment::from(mock_value("cache", "a.jpg", 5)))
        );
    }

    #[tokio::test]
    async fn test_placeholder_is_not_persisted() {
        let records = InMemoryRecords::new();
        let placeholder = Record::placeholder(RecordKey::new(TEST_RECORD_TYPE, "missing"));
        assert!(records.save_attachment(&placeholder, TEST_SLOT).await.is_err());
        assert!(records.get(placeholder.key()).await.is_none());
    }
}
