//! Typed view over a raw sync response.

use crate::api::RawSyncResponse;
use crate::error::SyncError;
use coffer_model::Payload;

/// One round's response, parsed into payload classes.
#[derive(Clone, Debug)]
pub struct SyncResponse {
    raw: RawSyncResponse,
}

impl SyncResponse {
    pub fn new(raw: RawSyncResponse) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &RawSyncResponse {
        &self.raw
    }

    /// Encrypted payloads the server returned in `retrieved_items`.
    pub fn retrieved_payloads(&self) -> Result<Vec<Payload>, SyncError> {
        self.raw
            .retrieved_items
            .iter()
            .map(|raw| {
                Payload::server_from_raw(raw)
                    .map_err(|e| SyncError::MalformedResponse(e.to_string()))
            })
            .collect()
    }

    /// Save acknowledgements (no content field).
    pub fn saved_payloads(&self) -> Result<Vec<Payload>, SyncError> {
        self.raw
            .saved_items
            .iter()
            .map(|raw| {
                Payload::server_saved_from_raw(raw)
                    .map_err(|e| SyncError::MalformedResponse(e.to_string()))
            })
            .collect()
    }

    /// The server's versions of conflicted uuids.
    pub fn conflict_payloads(&self) -> Result<Vec<Payload>, SyncError> {
        self.raw
            .conflicts
            .iter()
            .map(|conflict| {
                Payload::server_from_raw(&conflict.server_item)
                    .map_err(|e| SyncError::MalformedResponse(e.to_string()))
            })
            .collect()
    }

    pub fn sync_token(&self) -> Option<&str> {
        self.raw.sync_token.as_deref()
    }

    pub fn cursor_token(&self) -> Option<&str> {
        self.raw.cursor_token.as_deref()
    }

    pub fn integrity_hash(&self) -> Option<&str> {
        self.raw.integrity_hash.as_deref()
    }

    /// Drives the major-change threshold on completion.
    pub fn number_of_items_involved(&self) -> usize {
        self.raw.retrieved_items.len() + self.raw.saved_items.len() + self.raw.conflicts.len()
    }
}
