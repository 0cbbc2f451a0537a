//! The payload: an immutable, field-masked record that travels between the
//! server, the crypto operators, and the item graph.
//!
//! A payload is never mutated after construction. Every "change" is a
//! builder-style derivation ([`Payload::copy_with`]) that produces a new
//! payload whose `fields` set is the union of base and override.

pub mod fields;
pub mod format;
pub mod source;

use crate::content::ItemContent;
use crate::content_type::ContentType;
use crate::error::ModelError;
use chrono::{DateTime, Utc};
use fields::{FieldSet, PayloadField};
use format::{PayloadFormat, ProtocolVersion, BASE64_PREFIX};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use source::PayloadSource;

// ---------------------------------------------------------------------------
// Content variants
// ---------------------------------------------------------------------------

/// What a payload's `content` slot holds. The variant decides the payload's
/// [`PayloadFormat`].
#[derive(Clone, Debug, PartialEq)]
pub enum PayloadContent {
    /// A version-prefixed encrypted wire string (`"004:..."`).
    Encrypted(String),
    /// A decrypted bare object.
    Decrypted(ItemContent),
    /// A `000`-prefixed base64 armor of the decrypted object.
    Base64(String),
}

impl PayloadContent {
    /// Interprets a raw JSON content value. `null` maps to `None`.
    pub fn from_value(value: &Value) -> Result<Option<Self>, ModelError> {
        match value {
            Value::Null => Ok(None),
            Value::String(s) => {
                if s.starts_with(BASE64_PREFIX) {
                    Ok(Some(PayloadContent::Base64(s.clone())))
                } else if ProtocolVersion::from_encrypted_string(s).is_some() {
                    Ok(Some(PayloadContent::Encrypted(s.clone())))
                } else {
                    Err(ModelError::MalformedPayload(format!(
                        "content string has unknown prefix: {:?}",
                        &s[..s.len().min(3)]
                    )))
                }
            }
            Value::Object(_) => Ok(Some(PayloadContent::Decrypted(ItemContent::from_value(
                value,
            )?))),
            other => Err(ModelError::MalformedPayload(format!(
                "content must be a string, object or null, got {}",
                other
            ))),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            PayloadContent::Encrypted(s) | PayloadContent::Base64(s) => Value::String(s.clone()),
            PayloadContent::Decrypted(c) => c.to_value(),
        }
    }

    pub fn as_decrypted(&self) -> Option<&ItemContent> {
        match self {
            PayloadContent::Decrypted(c) => Some(c),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw (wire/storage) record
// ---------------------------------------------------------------------------

/// The serde mirror of a payload as it appears on the wire or in the local
/// store. All fields optional except identity.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RawPayload {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enc_item_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dirty: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dirtied_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Immutable typed record. Fields are private; accessors expose them and the
/// `fields` mask records which are meaningful for this payload class.
#[derive(Clone, Debug, PartialEq)]
pub struct Payload {
    uuid: String,
    content_type: ContentType,
    content: Option<PayloadContent>,
    enc_item_key: Option<String>,
    items_key_id: Option<String>,
    auth_hash: Option<String>,
    deleted: bool,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    dirty: bool,
    dirtied_at: Option<DateTime<Utc>>,
    error_decrypting: bool,
    error_decrypting_changed: bool,
    waiting_for_key: bool,
    last_sync_began: Option<DateTime<Utc>>,
    last_sync_end: Option<DateTime<Utc>>,
    source: PayloadSource,
    fields: FieldSet,
}

/// Override set for [`Payload::copy_with`]. `Some(..)` overrides the base and
/// adds the field to the derived payload's mask. Clearable slots use a nested
/// `Option` so "set to absent" is expressible.
#[derive(Clone, Debug, Default)]
pub struct PayloadOverride {
    pub uuid: Option<String>,
    pub content: Option<Option<PayloadContent>>,
    pub enc_item_key: Option<Option<String>>,
    pub items_key_id: Option<Option<String>>,
    pub auth_hash: Option<Option<String>>,
    pub deleted: Option<bool>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<Option<DateTime<Utc>>>,
    pub dirty: Option<bool>,
    pub dirtied_at: Option<Option<DateTime<Utc>>>,
    pub error_decrypting: Option<bool>,
    pub error_decrypting_changed: Option<bool>,
    pub waiting_for_key: Option<bool>,
    pub last_sync_began: Option<Option<DateTime<Utc>>>,
    pub last_sync_end: Option<Option<DateTime<Utc>>>,
    pub source: Option<PayloadSource>,
}

impl Payload {
    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    /// Builds a payload from a raw record, taking only the fields named by
    /// `mask`. The uuid is required whenever `Uuid` is in the mask.
    pub fn from_raw(
        raw: &RawPayload,
        source: PayloadSource,
        mask: FieldSet,
    ) -> Result<Payload, ModelError> {
        if mask.contains(&PayloadField::Uuid) && raw.uuid.is_empty() {
            return Err(ModelError::MissingUuid);
        }
        let has = |f: PayloadField| mask.contains(&f);
        let content = if has(PayloadField::Content) {
            match &raw.content {
                Some(v) => PayloadContent::from_value(v)?,
                None => None,
            }
        } else {
            None
        };
        Ok(Payload {
            uuid: raw.uuid.clone(),
            content_type: ContentType::from_wire(&raw.content_type),
            content,
            enc_item_key: has(PayloadField::EncItemKey)
                .then(|| raw.enc_item_key.clone())
                .flatten(),
            items_key_id: has(PayloadField::ItemsKeyId)
                .then(|| raw.items_key_id.clone())
                .flatten(),
            auth_hash: has(PayloadField::AuthHash)
                .then(|| raw.auth_hash.clone())
                .flatten(),
            deleted: has(PayloadField::Deleted) && raw.deleted.unwrap_or(false),
            created_at: has(PayloadField::CreatedAt)
                .then_some(raw.created_at)
                .flatten(),
            updated_at: has(PayloadField::UpdatedAt)
                .then_some(raw.updated_at)
                .flatten(),
            dirty: has(PayloadField::Dirty) && raw.dirty.unwrap_or(false),
            dirtied_at: has(PayloadField::DirtiedAt)
                .then_some(raw.dirtied_at)
                .flatten(),
            error_decrypting: false,
            error_decrypting_changed: false,
            waiting_for_key: false,
            last_sync_began: None,
            last_sync_end: None,
            source,
            fields: mask,
        })
    }

    /// All-fields payload; the working-copy class.
    pub fn max_from_raw(raw: &RawPayload, source: PayloadSource) -> Result<Payload, ModelError> {
        Self::from_raw(raw, source, fields::max_fields())
    }

    /// Server `retrieved_items` / `conflicts` class.
    pub fn server_from_raw(raw: &RawPayload) -> Result<Payload, ModelError> {
        Self::from_raw(raw, PayloadSource::RemoteRetrieved, fields::server_fields())
    }

    /// Server `saved_items` class: acknowledgement without content.
    pub fn server_saved_from_raw(raw: &RawPayload) -> Result<Payload, ModelError> {
        Self::from_raw(raw, PayloadSource::RemoteSaved, fields::server_saved_fields())
    }

    /// Local persistent store class.
    pub fn storage_from_raw(raw: &RawPayload) -> Result<Payload, ModelError> {
        Self::from_raw(raw, PayloadSource::LocalRetrieved, fields::storage_fields())
    }

    /// Backup file import class.
    pub fn import_from_raw(raw: &RawPayload) -> Result<Payload, ModelError> {
        Self::from_raw(raw, PayloadSource::FileImport, fields::file_import_fields())
    }

    /// A fresh decrypted payload built by application code.
    pub fn from_content(
        uuid: String,
        content_type: ContentType,
        content: ItemContent,
    ) -> Payload {
        Payload {
            uuid,
            content_type,
            content: Some(PayloadContent::Decrypted(content)),
            enc_item_key: None,
            items_key_id: None,
            auth_hash: None,
            deleted: false,
            created_at: Some(Utc::now()),
            updated_at: None,
            dirty: false,
            dirtied_at: None,
            error_decrypting: false,
            error_decrypting_changed: false,
            waiting_for_key: false,
            last_sync_began: None,
            last_sync_end: None,
            source: PayloadSource::Constructor,
            fields: fields::max_fields(),
        }
    }

    // -----------------------------------------------------------------------
    // Derivation
    // -----------------------------------------------------------------------

    /// The only way to "change" a payload: derive a new one. Overridden
    /// fields join the derived payload's mask.
    pub fn copy_with(&self, over: PayloadOverride) -> Payload {
        let mut out = self.clone();
        if let Some(uuid) = over.uuid {
            out.uuid = uuid;
            out.fields.insert(PayloadField::Uuid);
        }
        if let Some(content) = over.content {
            out.content = content;
            out.fields.insert(PayloadField::Content);
        }
        if let Some(v) = over.enc_item_key {
            out.enc_item_key = v;
            out.fields.insert(PayloadField::EncItemKey);
        }
        if let Some(v) = over.items_key_id {
            out.items_key_id = v;
            out.fields.insert(PayloadField::ItemsKeyId);
        }
        if let Some(v) = over.auth_hash {
            out.auth_hash = v;
            out.fields.insert(PayloadField::AuthHash);
        }
        if let Some(v) = over.deleted {
            out.deleted = v;
            out.fields.insert(PayloadField::Deleted);
        }
        if let Some(v) = over.created_at {
            out.created_at = Some(v);
            out.fields.insert(PayloadField::CreatedAt);
        }
        if let Some(v) = over.updated_at {
            out.updated_at = v;
            out.fields.insert(PayloadField::UpdatedAt);
        }
        if let Some(v) = over.dirty {
            out.dirty = v;
            out.fields.insert(PayloadField::Dirty);
        }
        if let Some(v) = over.dirtied_at {
            out.dirtied_at = v;
            out.fields.insert(PayloadField::DirtiedAt);
        }
        if let Some(v) = over.error_decrypting {
            out.error_decrypting = v;
            out.fields.insert(PayloadField::ErrorDecrypting);
        }
        if let Some(v) = over.error_decrypting_changed {
            out.error_decrypting_changed = v;
            out.fields.insert(PayloadField::ErrorDecryptingChanged);
        }
        if let Some(v) = over.waiting_for_key {
            out.waiting_for_key = v;
            out.fields.insert(PayloadField::WaitingForKey);
        }
        if let Some(v) = over.last_sync_began {
            out.last_sync_began = v;
            out.fields.insert(PayloadField::LastSyncBegan);
        }
        if let Some(v) = over.last_sync_end {
            out.last_sync_end = v;
            out.fields.insert(PayloadField::LastSyncEnd);
        }
        if let Some(v) = over.source {
            out.source = v;
        }
        out
    }

    /// Merge of two payloads for the same uuid: every field present in
    /// `newer` wins; the mask is the union.
    pub fn merged_with(&self, newer: &Payload) -> Payload {
        let mut out = self.clone();
        for field in &newer.fields {
            match field {
                PayloadField::Uuid => out.uuid = newer.uuid.clone(),
                PayloadField::ContentType => out.content_type = newer.content_type.clone(),
                PayloadField::Content => out.content = newer.content.clone(),
                PayloadField::EncItemKey => out.enc_item_key = newer.enc_item_key.clone(),
                PayloadField::ItemsKeyId => out.items_key_id = newer.items_key_id.clone(),
                PayloadField::AuthHash => out.auth_hash = newer.auth_hash.clone(),
                PayloadField::Deleted => out.deleted = newer.deleted,
                PayloadField::CreatedAt => out.created_at = newer.created_at,
                PayloadField::UpdatedAt => out.updated_at = newer.updated_at,
                PayloadField::Dirty => out.dirty = newer.dirty,
                PayloadField::DirtiedAt => out.dirtied_at = newer.dirtied_at,
                PayloadField::ErrorDecrypting => out.error_decrypting = newer.error_decrypting,
                PayloadField::ErrorDecryptingChanged => {
                    out.error_decrypting_changed = newer.error_decrypting_changed
                }
                PayloadField::WaitingForKey => out.waiting_for_key = newer.waiting_for_key,
                PayloadField::LastSyncBegan => out.last_sync_began = newer.last_sync_began,
                PayloadField::LastSyncEnd => out.last_sync_end = newer.last_sync_end,
            }
            out.fields.insert(*field);
        }
        out.source = newer.source;
        out
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn content_type(&self) -> &ContentType {
        &self.content_type
    }

    pub fn content(&self) -> Option<&PayloadContent> {
        self.content.as_ref()
    }

    pub fn decrypted_content(&self) -> Option<&ItemContent> {
        self.content.as_ref().and_then(|c| c.as_decrypted())
    }

    pub fn enc_item_key(&self) -> Option<&str> {
        self.enc_item_key.as_deref()
    }

    pub fn items_key_id(&self) -> Option<&str> {
        self.items_key_id.as_deref()
    }

    pub fn auth_hash(&self) -> Option<&str> {
        self.auth_hash.as_deref()
    }

    pub fn deleted(&self) -> bool {
        self.deleted
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }

    pub fn dirtied_at(&self) -> Option<DateTime<Utc>> {
        self.dirtied_at
    }

    pub fn error_decrypting(&self) -> bool {
        self.error_decrypting
    }

    pub fn error_decrypting_changed(&self) -> bool {
        self.error_decrypting_changed
    }

    pub fn waiting_for_key(&self) -> bool {
        self.waiting_for_key
    }

    pub fn last_sync_began(&self) -> Option<DateTime<Utc>> {
        self.last_sync_began
    }

    pub fn last_sync_end(&self) -> Option<DateTime<Utc>> {
        self.last_sync_end
    }

    pub fn source(&self) -> PayloadSource {
        self.source
    }

    pub fn fields(&self) -> &FieldSet {
        &self.fields
    }

    // -----------------------------------------------------------------------
    // Derived properties
    // -----------------------------------------------------------------------

    /// Format, derived from the content variant and tombstone flag.
    pub fn format(&self) -> PayloadFormat {
        match &self.content {
            None => PayloadFormat::Deleted,
            Some(PayloadContent::Encrypted(_)) => PayloadFormat::EncryptedString,
            Some(PayloadContent::Decrypted(_)) => PayloadFormat::DecryptedBareObject,
            Some(PayloadContent::Base64(_)) => PayloadFormat::DecryptedBase64String,
        }
    }

    /// The protocol tag at the head of an encrypted content string.
    pub fn version(&self) -> Option<ProtocolVersion> {
        match &self.content {
            Some(PayloadContent::Encrypted(s)) => ProtocolVersion::from_encrypted_string(s),
            _ => None,
        }
    }

    /// Deleted and already acknowledged: safe to evict from the store.
    pub fn discardable(&self) -> bool {
        self.deleted && !self.dirty
    }

    // -----------------------------------------------------------------------
    // Ejection (wire projection)
    // -----------------------------------------------------------------------

    /// The wire projection: every present field except the non-persistable
    /// set. `deleted` and legacy `auth_hash` are omitted when null.
    pub fn ejected(&self) -> Value {
        let mut map = Map::new();
        for field in &self.fields {
            if field.is_non_persistable() {
                continue;
            }
            match field {
                PayloadField::Uuid => {
                    map.insert("uuid".into(), Value::String(self.uuid.clone()));
                }
                PayloadField::ContentType => {
                    map.insert(
                        "content_type".into(),
                        Value::String(self.content_type.as_str().to_string()),
                    );
                }
                PayloadField::Content => {
                    map.insert(
                        "content".into(),
                        self.content.as_ref().map(|c| c.to_value()).unwrap_or(Value::Null),
                    );
                }
                PayloadField::EncItemKey => {
                    if let Some(k) = &self.enc_item_key {
                        map.insert("enc_item_key".into(), Value::String(k.clone()));
                    }
                }
                PayloadField::ItemsKeyId => {
                    if let Some(id) = &self.items_key_id {
                        map.insert("items_key_id".into(), Value::String(id.clone()));
                    }
                }
                PayloadField::AuthHash => {
                    if let Some(h) = &self.auth_hash {
                        map.insert("auth_hash".into(), Value::String(h.clone()));
                    }
                }
                PayloadField::Deleted => {
                    if self.deleted {
                        map.insert("deleted".into(), Value::Bool(true));
                    }
                }
                PayloadField::CreatedAt => {
                    if let Some(t) = self.created_at {
                        map.insert("created_at".into(), timestamp_value(t));
                    }
                }
                PayloadField::UpdatedAt => {
                    if let Some(t) = self.updated_at {
                        map.insert("updated_at".into(), timestamp_value(t));
                    }
                }
                PayloadField::Dirty => {
                    map.insert("dirty".into(), Value::Bool(self.dirty));
                }
                _ => {}
            }
        }
        Value::Object(map)
    }
}

fn timestamp_value(t: DateTime<Utc>) -> Value {
    serde_json::to_value(t).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw_note(uuid: &str) -> RawPayload {
        RawPayload {
            uuid: uuid.into(),
            content_type: "Note".into(),
            content: Some(json!({"title": "a", "references": []})),
            ..Default::default()
        }
    }

    #[test]
    fn uuid_required_when_masked() {
        let raw = RawPayload {
            content_type: "Note".into(),
            ..Default::default()
        };
        assert!(matches!(
            Payload::max_from_raw(&raw, PayloadSource::Constructor),
            Err(ModelError::MissingUuid)
        ));
    }

    #[test]
    fn format_follows_content_shape() {
        let p = Payload::max_from_raw(&raw_note("u1"), PayloadSource::Constructor).unwrap();
        assert_eq!(p.format(), PayloadFormat::DecryptedBareObject);
        assert_eq!(p.version(), None);

        let enc = p.copy_with(PayloadOverride {
            content: Some(Some(PayloadContent::Encrypted("004:a:b:c".into()))),
            ..Default::default()
        });
        assert_eq!(enc.format(), PayloadFormat::EncryptedString);
        assert_eq!(enc.version(), Some(ProtocolVersion::V004));

        let b64 = p.copy_with(PayloadOverride {
            content: Some(Some(PayloadContent::Base64("000eyJ9".into()))),
            ..Default::default()
        });
        assert_eq!(b64.format(), PayloadFormat::DecryptedBase64String);

        let gone = p.copy_with(PayloadOverride {
            content: Some(None),
            deleted: Some(true),
            ..Default::default()
        });
        assert_eq!(gone.format(), PayloadFormat::Deleted);
    }

    #[test]
    fn unknown_content_prefix_is_rejected() {
        let raw = RawPayload {
            uuid: "u1".into(),
            content_type: "Note".into(),
            content: Some(json!("999:nope")),
            ..Default::default()
        };
        assert!(Payload::max_from_raw(&raw, PayloadSource::Constructor).is_err());
    }

    #[test]
    fn copy_with_unions_fields() {
        let raw = raw_note("u1");
        let p = Payload::server_from_raw(&raw).unwrap();
        assert!(!p.fields().contains(&PayloadField::Dirty));

        let dirtied = p.copy_with(PayloadOverride {
            dirty: Some(true),
            dirtied_at: Some(Some(Utc::now())),
            ..Default::default()
        });
        assert!(dirtied.dirty());
        assert!(dirtied.fields().contains(&PayloadField::Dirty));
        assert!(dirtied.fields().contains(&PayloadField::DirtiedAt));
        // The original is untouched.
        assert!(!p.dirty());
    }

    #[test]
    fn discardable_requires_acknowledged_tombstone() {
        let p = Payload::max_from_raw(&raw_note("u1"), PayloadSource::Constructor).unwrap();
        let deleted_dirty = p.copy_with(PayloadOverride {
            deleted: Some(true),
            dirty: Some(true),
            ..Default::default()
        });
        assert!(!deleted_dirty.discardable());
        let acked = deleted_dirty.copy_with(PayloadOverride {
            dirty: Some(false),
            ..Default::default()
        });
        assert!(acked.discardable());
    }

    #[test]
    fn ejected_strips_session_fields() {
        let p = Payload::max_from_raw(&raw_note("u1"), PayloadSource::Constructor).unwrap();
        let p = p.copy_with(PayloadOverride {
            error_decrypting: Some(true),
            waiting_for_key: Some(true),
            last_sync_end: Some(Some(Utc::now())),
            dirtied_at: Some(Some(Utc::now())),
            ..Default::default()
        });
        let ejected = p.ejected();
        let obj = ejected.as_object().unwrap();
        assert!(obj.contains_key("uuid"));
        assert!(obj.contains_key("content"));
        assert!(!obj.contains_key("errorDecrypting"));
        assert!(!obj.contains_key("error_decrypting"));
        assert!(!obj.contains_key("waiting_for_key"));
        assert!(!obj.contains_key("last_sync_end"));
        assert!(!obj.contains_key("dirtied_at"));
        // deleted=false and absent auth_hash are omitted entirely
        assert!(!obj.contains_key("deleted"));
        assert!(!obj.contains_key("auth_hash"));
    }

    #[test]
    fn merged_with_takes_newer_fields_only() {
        let base = Payload::max_from_raw(&raw_note("u1"), PayloadSource::Constructor).unwrap();
        let saved_raw = RawPayload {
            uuid: "u1".into(),
            content_type: "Note".into(),
            updated_at: Some(Utc::now()),
            ..Default::default()
        };
        let ack = Payload::server_saved_from_raw(&saved_raw).unwrap();
        let merged = base.merged_with(&ack);
        // content survives (ack class carries no Content field)
        assert!(merged.decrypted_content().is_some());
        assert_eq!(merged.updated_at(), ack.updated_at());
        assert_eq!(merged.source(), PayloadSource::RemoteSaved);
    }
}
