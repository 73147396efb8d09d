pub mod envelope;
pub mod test_objects;

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    hash::{Hash, Hasher},
    path::Path,
};

use serde::{Deserialize, Serialize};

pub use envelope::BackgroundEnvelope;

/// Free-form metadata attached to an uploaded object.
pub type Metadata = BTreeMap<String, serde_json::Value>;

pub const METADATA_FILENAME: &str = "filename";
pub const METADATA_SIZE: &str = "size";
pub const METADATA_MIME_TYPE: &str = "mime_type";

/// One object held by a backend.
///
/// Two values are equal when they point at the same object, i.e. when both
/// the backend key and the id match. Metadata never takes part in the
/// comparison. Values are never edited: metadata refreshes produce a new
/// value through [`AttachmentValue::with_metadata`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentValue {
    id: String,
    storage: String,
    #[serde(default)]
    metadata: Metadata,
}

impl AttachmentValue {
    pub fn new(storage: impl Into<String>, id: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            id: id.into(),
            storage: storage.into(),
            metadata,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn storage(&self) -> &str {
        &self.storage
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn size(&self) -> Option<u64> {
        self.metadata.get(METADATA_SIZE).and_then(|v| v.as_u64())
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.metadata.get(METADATA_MIME_TYPE).and_then(|v| v.as_str())
    }

    pub fn original_filename(&self) -> Option<&str> {
        self.metadata.get(METADATA_FILENAME).and_then(|v| v.as_str())
    }

    /// Lowercased extension, taken from the id first and the original
    /// filename second.
    pub fn extension(&self) -> Option<String> {
        extension_of(&self.id)
            .or_else(|| self.original_filename().and_then(extension_of))
            .map(|ext| ext.to_lowercase())
    }

    /// Returns a new value for the same object with `refreshed` merged over
    /// the current metadata.
    pub fn with_metadata(&self, refreshed: Metadata) -> Self {
        let mut metadata = self.metadata.clone();
        metadata.extend(refreshed);
        Self {
            id: self.id.clone(),
            storage: self.storage.clone(),
            metadata,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }
}

impl PartialEq for AttachmentValue {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.storage == other.storage
    }
}

impl Eq for AttachmentValue {}

impl Hash for AttachmentValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.storage.hash(state);
        self.id.hash(state);
    }
}

impl Display for AttachmentValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.storage, self.id)
    }
}

fn extension_of(name: &str) -> Option<&str> {
    Path::new(name).extension().and_then(|ext| ext.to_str())
}

/// The content of a slot: a single object, or a set of named versions
/// derived from one upload (e.g. `original` and `thumb`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Attachment {
    Single(AttachmentValue),
    Versions(BTreeMap<String, AttachmentValue>),
}

impl Attachment {
    pub fn files(&self) -> Vec<&AttachmentValue> {
        match self {
            Attachment::Single(value) => vec![value],
            Attachment::Versions(versions) => versions.values().collect(),
        }
    }

    pub fn file_count(&self) -> usize {
        match self {
            Attachment::Single(_) => 1,
            Attachment::Versions(versions) => versions.len(),
        }
    }

    /// The backend key shared by every file, if there is exactly one.
    pub fn storage(&self) -> Option<&str> {
        let mut keys = self.files().into_iter().map(|f| f.storage());
        let first = keys.next()?;
        keys.all(|key| key == first).then_some(first)
    }

    pub fn is_in(&self, storage: &str) -> bool {
        self.storage() == Some(storage)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }
}

impl From<AttachmentValue> for Attachment {
    fn from(value: AttachmentValue) -> Self {
        Attachment::Single(value)
    }
}

/// Identity of the entity that owns a slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub record_type: String,
    pub id: String,
}

impl RecordKey {
    pub fn new(record_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            id: id.into(),
        }
    }
}

impl Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.record_type, self.id)
    }
}

/// In-memory view of an entity and its attachment slots.
///
/// A record built with [`Record::placeholder`] stands in for an entity that
/// could not be found. It is enough to address objects for deletion but it
/// has no slots and is never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    key: RecordKey,
    attachments: BTreeMap<String, Attachment>,
    persisted: bool,
}

impl Record {
    pub fn new(key: RecordKey) -> Self {
        Self {
            key,
            attachments: BTreeMap::new(),
            persisted: true,
        }
    }

    pub fn placeholder(key: RecordKey) -> Self {
        Self {
            key,
            attachments: BTreeMap::new(),
            persisted: false,
        }
    }

    pub fn key(&self) -> &RecordKey {
        &self.key
    }

    pub fn is_placeholder(&self) -> bool {
        !self.persisted
    }

    pub fn attachment(&self, slot: &str) -> Option<&Attachment> {
        self.attachments.get(slot)
    }

    pub fn attachments(&self) -> &BTreeMap<String, Attachment> {
        &self.attachments
    }

    /// Binds `attachment` to `slot` and returns whatever it replaced.
    pub fn set_attachment(&mut self, slot: &str, attachment: Option<Attachment>) -> Option<Attachment> {
        match attachment {
            Some(attachment) => self.attachments.insert(slot.to_string(), attachment),
            None => self.attachments.remove(slot),
        }
    }
}
