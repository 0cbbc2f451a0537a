//! Decrypted item content: a references list plus free-form data.

use crate::content_type::ContentType;
use crate::error::ModelError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A directed edge from the owning item to another item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentReference {
    pub uuid: String,
    pub content_type: ContentType,
}

/// The decoded object carried by a decrypted payload.
///
/// `references` is the only structured field; everything else (note text,
/// tag title, preference maps) lives in `extra` untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemContent {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<ContentReference>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ItemContent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a bare object, validating that `references`, when present,
    /// is a list of well-formed `{uuid, content_type}` entries.
    pub fn from_value(value: &Value) -> Result<Self, ModelError> {
        if !value.is_object() {
            return Err(ModelError::MalformedContent(
                "content must be an object".into(),
            ));
        }
        serde_json::from_value(value.clone())
            .map_err(|e| ModelError::MalformedContent(e.to_string()))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn references_uuid(&self, uuid: &str) -> bool {
        self.references.iter().any(|r| r.uuid == uuid)
    }

    /// Structural equality: reference order and object key order are
    /// insignificant; everything else must match exactly.
    pub fn structurally_equals(&self, other: &ItemContent) -> bool {
        normalized(self) == normalized(other)
    }

    /// A copy with `reference` appended, if not already present.
    pub fn with_reference(&self, reference: ContentReference) -> ItemContent {
        let mut copy = self.clone();
        if !copy.references_uuid(&reference.uuid) {
            copy.references.push(reference);
        }
        copy
    }

    /// A copy with every reference to `old_uuid` retargeted at `new_uuid`.
    pub fn with_reference_retargeted(&self, old_uuid: &str, new_uuid: &str) -> ItemContent {
        let mut copy = self.clone();
        for r in &mut copy.references {
            if r.uuid == old_uuid {
                r.uuid = new_uuid.to_string();
            }
        }
        copy
    }

    /// A copy with every reference to `uuid` removed.
    pub fn without_reference(&self, uuid: &str) -> ItemContent {
        let mut copy = self.clone();
        copy.references.retain(|r| r.uuid != uuid);
        copy
    }
}

fn normalized(content: &ItemContent) -> Value {
    let mut copy = content.clone();
    copy.references
        .sort_by(|a, b| a.uuid.cmp(&b.uuid).then(a.content_type.cmp(&b.content_type)));
    copy.to_value()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn content(v: Value) -> ItemContent {
        ItemContent::from_value(&v).unwrap()
    }

    #[test]
    fn parses_references() {
        let c = content(json!({
            "title": "groceries",
            "references": [{"uuid": "a", "content_type": "Note"}]
        }));
        assert_eq!(c.references.len(), 1);
        assert_eq!(c.references[0].content_type, ContentType::Note);
        assert_eq!(c.extra.get("title"), Some(&json!("groceries")));
    }

    #[test]
    fn rejects_non_object_content() {
        assert!(ItemContent::from_value(&json!("a string")).is_err());
        assert!(ItemContent::from_value(&json!(42)).is_err());
    }

    #[test]
    fn rejects_malformed_references() {
        assert!(ItemContent::from_value(&json!({
            "references": [{"uuid": "a"}]
        }))
        .is_err());
    }

    #[test]
    fn equality_ignores_reference_order() {
        let a = content(json!({
            "references": [
                {"uuid": "1", "content_type": "Note"},
                {"uuid": "2", "content_type": "Tag"}
            ]
        }));
        let b = content(json!({
            "references": [
                {"uuid": "2", "content_type": "Tag"},
                {"uuid": "1", "content_type": "Note"}
            ]
        }));
        assert!(a.structurally_equals(&b));
    }

    #[test]
    fn equality_sees_value_changes() {
        let a = content(json!({"text": "hello"}));
        let b = content(json!({"text": "hello!"}));
        assert!(!a.structurally_equals(&b));
    }

    #[test]
    fn retargeting_rewrites_only_matching_edges() {
        let c = content(json!({
            "references": [
                {"uuid": "old", "content_type": "Note"},
                {"uuid": "other", "content_type": "Note"}
            ]
        }));
        let r = c.with_reference_retargeted("old", "new");
        assert!(r.references_uuid("new"));
        assert!(r.references_uuid("other"));
        assert!(!r.references_uuid("old"));
    }
}
