use serde::{Deserialize, Deserializer, Serialize};

use crate::{Attachment, RecordKey};

/// Snapshot handed to the job system when promotion or deletion of a slot
/// is deferred.
///
/// Wire shape:
///
/// ```json
/// {"attachment": "<attachment json>" | null, "record": ["User", "1"], "name": "avatar", "phase": "store" | null}
/// ```
///
/// Every field is required and unknown fields are rejected, so a payload
/// produced by an incompatible producer fails loudly instead of resuming
/// with defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackgroundEnvelope {
    #[serde(deserialize_with = "required")]
    pub attachment: Option<String>,
    pub record: (String, String),
    pub name: String,
    #[serde(deserialize_with = "required")]
    pub phase: Option<String>,
}

fn required<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer)
}

impl BackgroundEnvelope {
    pub fn new(
        attachment: Option<&Attachment>,
        record: &RecordKey,
        name: &str,
        phase: Option<&str>,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            attachment: attachment.map(|a| a.to_json()).transpose()?,
            record: (record.record_type.clone(), record.id.clone()),
            name: name.to_string(),
            phase: phase.map(str::to_string),
        })
    }

    pub fn record_key(&self) -> RecordKey {
        RecordKey::new(self.record.0.clone(), self.record.1.clone())
    }

    /// Parses the captured attachment back into a value.
    pub fn attachment(&self) -> serde_json::Result<Option<Attachment>> {
        self.attachment
            .as_deref()
            .map(Attachment::from_json)
            .transpose()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }
}
