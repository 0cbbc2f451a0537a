//! Items: the live object view over decrypted payloads.

use crate::content::{ContentReference, ItemContent};
use crate::content_type::ContentType;
use crate::payload::Payload;
use chrono::{DateTime, Utc};

/// A mutable object mirroring the latest payload mapped for a uuid.
///
/// Items do not own pointers to one another; both directions of the
/// reference graph go through the model manager's indexes.
#[derive(Clone, Debug)]
pub struct Item {
    payload: Payload,
    dummy: bool,
}

impl Item {
    pub fn from_payload(payload: Payload) -> Self {
        Self {
            payload,
            dummy: false,
        }
    }

    /// Placeholder for a referenced uuid whose payload has not arrived yet.
    pub fn dummy(uuid: String, content_type: ContentType) -> Self {
        Self {
            payload: Payload::from_content(uuid, content_type, ItemContent::new()),
            dummy: true,
        }
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub(crate) fn set_payload(&mut self, payload: Payload) {
        self.payload = payload;
    }

    pub(crate) fn promote(&mut self, payload: Payload) {
        self.payload = payload;
        self.dummy = false;
    }

    pub fn is_dummy(&self) -> bool {
        self.dummy
    }

    pub fn uuid(&self) -> &str {
        self.payload.uuid()
    }

    pub fn content_type(&self) -> &ContentType {
        self.payload.content_type()
    }

    pub fn content(&self) -> Option<&ItemContent> {
        self.payload.decrypted_content()
    }

    pub fn references(&self) -> &[ContentReference] {
        self.content().map(|c| c.references.as_slice()).unwrap_or(&[])
    }

    pub fn deleted(&self) -> bool {
        self.payload.deleted()
    }

    pub fn dirty(&self) -> bool {
        self.payload.dirty()
    }

    pub fn error_decrypting(&self) -> bool {
        self.payload.error_decrypting()
    }

    pub fn waiting_for_key(&self) -> bool {
        self.payload.waiting_for_key()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.payload.created_at()
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.payload.updated_at()
    }

    /// Millisecond timestamp used by the integrity hash. Items never synced
    /// report zero.
    pub fn updated_at_timestamp(&self) -> i64 {
        self.payload
            .updated_at()
            .map(|t| t.timestamp_millis())
            .unwrap_or(0)
    }
}
