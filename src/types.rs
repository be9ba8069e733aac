//! Core types for the stream watcher.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A document as stored in a watched collection.
pub type Document = serde_json::Map<String, Value>;

/// Fully-qualified collection name.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Namespace({}.{})", self.db, self.coll)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

/// Key identifying a document, at minimum its `_id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentKey(pub Document);

impl DocumentKey {
    /// Key made of a single `_id` field.
    pub fn from_id(id: Value) -> Self {
        let mut key = Document::new();
        key.insert("_id".to_string(), id);
        DocumentKey(key)
    }

    /// The `_id` component of the key, if present.
    pub fn id(&self) -> Option<&Value> {
        self.0.get("_id")
    }
}

/// Opaque position marker attached to each notification by the source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(pub Value);

/// Operation tag carried by a raw notification.
///
/// Tags the watcher does not act on are kept verbatim in `Other`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
    Drop,
    Rename,
    Invalidate,
    Other(String),
}

impl OperationType {
    pub fn as_str(&self) -> &str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Replace => "replace",
            OperationType::Delete => "delete",
            OperationType::Drop => "drop",
            OperationType::Rename => "rename",
            OperationType::Invalidate => "invalidate",
            OperationType::Other(tag) => tag,
        }
    }
}

impl From<String> for OperationType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "insert" => OperationType::Insert,
            "update" => OperationType::Update,
            "replace" => OperationType::Replace,
            "delete" => OperationType::Delete,
            "drop" => OperationType::Drop,
            "rename" => OperationType::Rename,
            "invalidate" => OperationType::Invalidate,
            _ => OperationType::Other(tag),
        }
    }
}

impl From<&str> for OperationType {
    fn from(tag: &str) -> Self {
        OperationType::from(tag.to_string())
    }
}

impl From<OperationType> for String {
    fn from(op: OperationType) -> Self {
        op.as_str().to_string()
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field-level description of an update.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDescription {
    #[serde(default)]
    pub updated_fields: Document,
    #[serde(default)]
    pub removed_fields: Vec<String>,
}

/// A change notification as delivered by the source, before classification.
///
/// Field names follow the change-stream document shape so notifications can
/// be decoded straight from JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawNotification {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<ResumeToken>,

    pub operation_type: OperationType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ns: Option<Namespace>,

    /// Post-change document. Only present for updates when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_document: Option<Document>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_key: Option<DocumentKey>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_description: Option<UpdateDescription>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_time: Option<u64>,
}

impl RawNotification {
    /// Bare notification with only an operation tag.
    pub fn new(operation_type: impl Into<OperationType>) -> Self {
        Self {
            resume_token: None,
            operation_type: operation_type.into(),
            ns: None,
            full_document: None,
            document_key: None,
            update_description: None,
            cluster_time: None,
        }
    }

    pub fn insert(document: Document) -> Self {
        let document_key = document.get("_id").cloned().map(DocumentKey::from_id);
        Self {
            full_document: Some(document),
            document_key,
            ..Self::new(OperationType::Insert)
        }
    }

    pub fn update(document: Document) -> Self {
        Self {
            operation_type: OperationType::Update,
            ..Self::insert(document)
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Self {
            document_key: Some(key),
            ..Self::new(OperationType::Delete)
        }
    }

    /// Decode a notification from its JSON form.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Kind of event the watcher emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
    Error,
}

impl EventKind {
    pub const CHANGES: [EventKind; 3] = [EventKind::Insert, EventKind::Update, EventKind::Delete];

    /// Event name on the generic channel.
    pub fn name(self) -> &'static str {
        match self {
            EventKind::Insert => "insert",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
            EventKind::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A normalized change event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum ChangeEvent {
    /// A document was inserted.
    Insert(Document),
    /// A document was updated. Carries the full post-update state, or only
    /// the key and updated fields when the document was gone by lookup time.
    Update(Document),
    /// A document was deleted. Carries only its key.
    Delete(DocumentKey),
}

impl ChangeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChangeEvent::Insert(_) => EventKind::Insert,
            ChangeEvent::Update(_) => EventKind::Update,
            ChangeEvent::Delete(_) => EventKind::Delete,
        }
    }

    /// Translate a raw notification into an event.
    ///
    /// Returns `None` for operations the watcher does not emit, and for
    /// notifications missing the payload their kind needs. An update whose
    /// post-image lookup came back empty (the document was deleted first)
    /// still produces an event, built by [`partial_update`].
    pub fn classify(raw: RawNotification) -> Option<Self> {
        match raw.operation_type {
            OperationType::Insert => raw.full_document.map(ChangeEvent::Insert),
            OperationType::Update => match raw.full_document {
                Some(document) => Some(ChangeEvent::Update(document)),
                None => partial_update(raw.document_key, raw.update_description)
                    .map(ChangeEvent::Update),
            },
            OperationType::Delete => raw.document_key.map(ChangeEvent::Delete),
            _ => None,
        }
    }
}

/// The fields known about an updated document without its post-image: the
/// key merged with the updated fields. `None` if neither is present.
fn partial_update(
    key: Option<DocumentKey>,
    description: Option<UpdateDescription>,
) -> Option<Document> {
    if key.is_none() && description.is_none() {
        return None;
    }
    let mut document = key.map(|k| k.0).unwrap_or_default();
    if let Some(description) = description {
        for (field, value) in description.updated_fields {
            document.entry(field).or_insert(value);
        }
    }
    Some(document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_decode_change_stream_json() {
        let raw = RawNotification::from_json(
            br#"{
                "_id": {"_data": "0001"},
                "operationType": "update",
                "ns": {"db": "test", "coll": "documents"},
                "documentKey": {"_id": "abc"},
                "updateDescription": {"updatedFields": {"status": "done"}, "removedFields": []},
                "fullDocument": {"_id": "abc", "name": "A", "status": "done"}
            }"#,
        )
        .unwrap();

        assert_eq!(raw.operation_type, OperationType::Update);
        assert_eq!(raw.ns, Some(Namespace::new("test", "documents")));
        assert_eq!(raw.document_key.as_ref().unwrap().id(), Some(&json!("abc")));
        assert_eq!(
            raw.update_description.as_ref().unwrap().updated_fields["status"],
            "done"
        );

        match ChangeEvent::classify(raw) {
            Some(ChangeEvent::Update(document)) => {
                assert_eq!(document["name"], "A");
                assert_eq!(document["status"], "done");
            }
            other => panic!("Expected Update, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_operation_kept_verbatim() {
        let raw = RawNotification::from_json(br#"{"operationType": "shardCollection"}"#).unwrap();
        assert_eq!(
            raw.operation_type,
            OperationType::Other("shardCollection".to_string())
        );
        assert_eq!(raw.operation_type.to_string(), "shardCollection");
        assert!(ChangeEvent::classify(raw).is_none());
    }

    #[test]
    fn test_classify_known_operations() {
        let document = doc(json!({"_id": 1, "name": "A"}));

        let insert = ChangeEvent::classify(RawNotification::insert(document.clone())).unwrap();
        assert_eq!(insert.kind(), EventKind::Insert);

        let update = ChangeEvent::classify(RawNotification::update(document)).unwrap();
        assert_eq!(update.kind(), EventKind::Update);

        let delete =
            ChangeEvent::classify(RawNotification::delete(DocumentKey::from_id(json!(1)))).unwrap();
        assert_eq!(delete, ChangeEvent::Delete(DocumentKey::from_id(json!(1))));
    }

    #[test]
    fn test_classify_ignores_non_emitted_operations() {
        for tag in ["replace", "drop", "rename", "invalidate"] {
            let mut raw = RawNotification::new(tag);
            raw.full_document = Some(doc(json!({"_id": 1})));
            assert!(ChangeEvent::classify(raw).is_none(), "{} should be dropped", tag);
        }
    }

    #[test]
    fn test_update_without_post_image_uses_key_and_fields() {
        let mut raw = RawNotification::new("update");
        raw.document_key = Some(DocumentKey::from_id(json!(1)));
        raw.update_description = Some(UpdateDescription {
            updated_fields: doc(json!({"status": "done", "_id": 99})),
            removed_fields: vec!["draft".to_string()],
        });

        // The key wins over an `_id` in the updated fields
        assert_eq!(
            ChangeEvent::classify(raw),
            Some(ChangeEvent::Update(doc(json!({"_id": 1, "status": "done"}))))
        );

        // Nothing at all to report
        assert!(ChangeEvent::classify(RawNotification::new("update")).is_none());
    }

    #[test]
    fn test_delete_payload_is_key_only() {
        let raw = RawNotification::from_json(
            br#"{"operationType": "delete", "documentKey": {"_id": 7}}"#,
        )
        .unwrap();
        match ChangeEvent::classify(raw).unwrap() {
            ChangeEvent::Delete(key) => {
                assert_eq!(key.0.len(), 1);
                assert_eq!(key.id(), Some(&json!(7)));
            }
            other => panic!("Expected Delete, got {:?}", other),
        }
    }
}
