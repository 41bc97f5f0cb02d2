// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tagged artifact values and lazy fan-in sequences.

use crate::event::BlobRef;
use crate::id::CanonicalId;
use reel_error::ForgeError;
use serde_json::Value;

/// A resolved artifact value, tagged by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactValue {
    /// UTF-8 text.
    Text(String),
    /// Raw bytes with their MIME type (images, audio, video).
    Bytes {
        /// The blob bytes.
        data: Vec<u8>,
        /// MIME type of the bytes.
        mime_type: String,
    },
    /// A JSON scalar (string, number, bool, null).
    JsonScalar(Value),
    /// A JSON object.
    JsonObject(serde_json::Map<String, Value>),
    /// A JSON array.
    JsonArray(Vec<Value>),
}

impl ArtifactValue {
    /// Interpret blob bytes according to their MIME type.
    #[must_use]
    pub fn from_blob(data: Vec<u8>, mime_type: &str) -> Self {
        if mime_type == "application/json" {
            if let Ok(v) = serde_json::from_slice::<Value>(&data) {
                return Self::from_json(v);
            }
        }
        if mime_type.starts_with("text/") {
            if let Ok(s) = String::from_utf8(data.clone()) {
                return Self::Text(s);
            }
        }
        Self::Bytes {
            data,
            mime_type: mime_type.to_string(),
        }
    }

    /// Wrap a JSON value in the matching tagged variant.
    #[must_use]
    pub fn from_json(v: Value) -> Self {
        match v {
            Value::Object(o) => Self::JsonObject(o),
            Value::Array(a) => Self::JsonArray(a),
            scalar => Self::JsonScalar(scalar),
        }
    }

    /// Render as a JSON value for payload assembly. Binary values become a
    /// `{"$blob": {...}}` reference object rather than inlined bytes.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Text(s) => Value::String(s.clone()),
            Self::Bytes { data, mime_type } => serde_json::json!({
                "$blob": { "size": data.len(), "mime_type": mime_type }
            }),
            Self::JsonScalar(v) => v.clone(),
            Self::JsonObject(o) => Value::Object(o.clone()),
            Self::JsonArray(a) => Value::Array(a.clone()),
        }
    }

    /// True for empty strings, arrays, objects, and JSON null.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(s) => s.is_empty(),
            Self::Bytes { data, .. } => data.is_empty(),
            Self::JsonScalar(v) => v.is_null(),
            Self::JsonObject(o) => o.is_empty(),
            Self::JsonArray(a) => a.is_empty(),
        }
    }
}

/// Something that can hand back blob bytes for a [`BlobRef`].
///
/// Implemented by the artifact store; kept as a trait so fan-in sequences
/// stay lazy without dragging storage into the contract crate.
pub trait BlobSource: Send + Sync {
    /// Fetch the bytes behind a blob reference.
    ///
    /// # Errors
    ///
    /// `STORAGE_NOT_FOUND` when the blob is absent, `STORAGE_IO` otherwise.
    fn fetch(&self, blob: &BlobRef) -> Result<Vec<u8>, ForgeError>;
}

/// One member of a fan-in sequence, in final order.
#[derive(Debug, Clone, PartialEq)]
pub struct FanInItem {
    /// Artifact id of the member.
    pub id: CanonicalId,
    /// Group key the member belongs to (outer dimension value).
    pub group: String,
    /// Blob reference, when the member was materialized.
    pub blob: Option<BlobRef>,
}

/// A finite, restartable sequence of fan-in members.
///
/// Members are resolved lazily against a [`BlobSource`]; iterating twice
/// yields the same order.
#[derive(Debug, Clone, Default)]
pub struct FanInSequence {
    items: Vec<FanInItem>,
}

impl FanInSequence {
    /// Build a sequence from ordered members.
    #[must_use]
    pub fn new(items: Vec<FanInItem>) -> Self {
        Self { items }
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when the sequence has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate the members without resolving blobs.
    pub fn iter(&self) -> impl Iterator<Item = &FanInItem> {
        self.items.iter()
    }

    /// Resolve every member against the blob source, in order.
    ///
    /// Members without a blob (skipped upstream) are dropped rather than
    /// failing the whole sequence.
    ///
    /// # Errors
    ///
    /// Propagates the first fetch failure.
    pub fn resolve(&self, source: &dyn BlobSource) -> Result<Vec<ArtifactValue>, ForgeError> {
        let mut out = Vec::with_capacity(self.items.len());
        for item in &self.items {
            let Some(blob) = &item.blob else { continue };
            let bytes = source.fetch(blob).map_err(|e| {
                ForgeError::new(e.code, e.message).with_context("member", item.id.to_string())
            })?;
            out.push(ArtifactValue::from_blob(bytes, &blob.mime_type));
        }
        Ok(out)
    }

    /// Resolve to a JSON array for payload assembly.
    ///
    /// # Errors
    ///
    /// Propagates the first fetch failure.
    pub fn resolve_json(&self, source: &dyn BlobSource) -> Result<Value, ForgeError> {
        let values = self.resolve(source)?;
        Ok(Value::Array(values.iter().map(ArtifactValue::to_json).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reel_error::ErrorCode;
    use std::collections::BTreeMap;

    struct MapSource(BTreeMap<String, Vec<u8>>);

    impl BlobSource for MapSource {
        fn fetch(&self, blob: &BlobRef) -> Result<Vec<u8>, ForgeError> {
            self.0
                .get(&blob.hash)
                .cloned()
                .ok_or_else(|| ForgeError::new(ErrorCode::StorageNotFound, "missing blob"))
        }
    }

    fn text_blob(hash: &str) -> BlobRef {
        BlobRef {
            hash: hash.into(),
            size: 0,
            mime_type: "text/plain".into(),
        }
    }

    #[test]
    fn emptiness_follows_the_variant() {
        assert!(ArtifactValue::Text(String::new()).is_empty());
        assert!(!ArtifactValue::Text("x".into()).is_empty());
        assert!(ArtifactValue::JsonArray(vec![]).is_empty());
        assert!(ArtifactValue::JsonScalar(serde_json::Value::Null).is_empty());
        assert!(!ArtifactValue::JsonScalar(serde_json::json!(0)).is_empty());
    }

    #[test]
    fn from_blob_dispatches_on_mime() {
        let v = ArtifactValue::from_blob(b"hello".to_vec(), "text/plain");
        assert_eq!(v, ArtifactValue::Text("hello".into()));

        let v = ArtifactValue::from_blob(br#"{"a":1}"#.to_vec(), "application/json");
        assert!(matches!(v, ArtifactValue::JsonObject(_)));

        let v = ArtifactValue::from_blob(vec![0x89, 0x50], "image/png");
        assert!(matches!(v, ArtifactValue::Bytes { .. }));
    }

    #[test]
    fn sequence_is_restartable_and_ordered() {
        let mut blobs = BTreeMap::new();
        blobs.insert("h1".to_string(), b"one".to_vec());
        blobs.insert("h2".to_string(), b"two".to_vec());
        let source = MapSource(blobs);

        let seq = FanInSequence::new(vec![
            FanInItem {
                id: "Artifact:A.Out[0]".parse().unwrap(),
                group: "0".into(),
                blob: Some(text_blob("h1")),
            },
            FanInItem {
                id: "Artifact:A.Out[1]".parse().unwrap(),
                group: "1".into(),
                blob: Some(text_blob("h2")),
            },
            FanInItem {
                id: "Artifact:B.Out".parse().unwrap(),
                group: "1".into(),
                blob: None,
            },
        ]);

        let first = seq.resolve(&source).unwrap();
        let second = seq.resolve(&source).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            first,
            vec![
                ArtifactValue::Text("one".into()),
                ArtifactValue::Text("two".into())
            ]
        );
    }
}
