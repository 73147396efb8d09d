pub mod tests {
    use serde_json::json;

    use crate::{
        AttachmentValue,
        Metadata,
        METADATA_FILENAME,
        METADATA_MIME_TYPE,
        METADATA_SIZE,
    };

    pub const TEST_RECORD_TYPE: &str = "User";
    pub const TEST_RECORD_ID: &str = "29543";
    pub const TEST_SLOT: &str = "avatar";

    pub fn mock_metadata(size: u64) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert(METADATA_FILENAME.to_string(), json!("image.jpg"));
        metadata.insert(METADATA_SIZE.to_string(), json!(size));
        metadata.insert(METADATA_MIME_TYPE.to_string(), json!("image/jpeg"));
        metadata
    }

    pub fn mock_value(storage: &str, id: &str, size: u64) -> AttachmentValue {
        AttachmentValue::new(storage, id, mock_metadata(size))
    }
}
