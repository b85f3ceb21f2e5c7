use serde_json::Value;

use crate::errors::{Result, TetherError};
use crate::helpers::MAX_DOC_SIZE;

/// A stored document: a JSON map of field names to values
pub type Document = serde_json::Map<String, Value>;

/// Reserved field holding a document's tags
pub const TAGS_FIELD: &str = "_tags";

/// Encode a document to its stored form, enforcing the size ceiling
pub fn encode_document(doc: &Document) -> Result<Vec<u8>> {
    let encoded = serde_json::to_vec(doc)?;
    if encoded.len() > MAX_DOC_SIZE {
        return Err(TetherError::TooLarge { size: encoded.len(), limit: MAX_DOC_SIZE });
    }
    Ok(encoded)
}

/// Decode a stored document.
///
/// Stored bytes came from `encode_document`, so a parse failure means the
/// backing handed us something it shouldn't have.
pub fn decode_document(bytes: &[u8]) -> Result<Document> {
    serde_json::from_slice(bytes)
        .map_err(|err| TetherError::Corrupt(format!("undecodable document: {err}").into()))
}

/// Store caller-supplied tags into the reserved `_tags` field
pub fn attach_tags(doc: &mut Document, tags: &[String]) {
    if tags.is_empty() {
        return;
    }
    let tags = tags.iter().map(|tag| Value::String(tag.clone())).collect();
    doc.insert(TAGS_FIELD.to_string(), Value::Array(tags));
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_roundtrip() {
        let original = doc(json!({"name": "John", "age": 30, "nested": {"a": [1, 2, 3]}}));
        let encoded = encode_document(&original).unwrap();
        assert_eq!(decode_document(&encoded).unwrap(), original);
    }

    #[test]
    fn test_size_ceiling() {
        let padding = "x".repeat(MAX_DOC_SIZE);
        let too_big = doc(json!({ "padding": padding }));
        assert!(matches!(
            encode_document(&too_big),
            Err(TetherError::TooLarge { .. })
        ));

        // Just under the ceiling is fine
        let small = doc(json!({"padding": "x".repeat(100)}));
        assert!(encode_document(&small).is_ok());
    }

    #[test]
    fn test_attach_tags() {
        let mut document = doc(json!({"v": 1}));
        attach_tags(&mut document, &["user".to_string(), "active".to_string()]);
        assert_eq!(document.get(TAGS_FIELD), Some(&json!(["user", "active"])));

        // Empty tag lists leave the document untouched
        let mut untagged = doc(json!({"v": 1}));
        attach_tags(&mut untagged, &[]);
        assert!(!untagged.contains_key(TAGS_FIELD));
    }

    #[test]
    fn test_decode_garbage_is_corrupt() {
        assert!(matches!(
            decode_document(b"\x00\x01not json"),
            Err(TetherError::Corrupt(_))
        ));
    }
}
