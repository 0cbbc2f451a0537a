//! Payload provenance: where a payload came from governs how it merges.

use serde::{Deserialize, Serialize};

/// Which code path produced a payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadSource {
    /// Built directly by application code.
    Constructor,
    /// Loaded from the local persistent store at startup.
    LocalRetrieved,
    /// Written back to the local persistent store.
    LocalSaved,
    /// Returned by the server in `retrieved_items`.
    RemoteRetrieved,
    /// Returned by the server in `saved_items` (no content field).
    RemoteSaved,
    /// Returned by the server in `conflicts`.
    RemoteConflict,
    /// Locally mutated and stamped dirty.
    LocalDirtied,
    /// Handed over by an extension/component host.
    ComponentRetrieved,
    /// Imported from a backup file.
    FileImport,
}

impl PayloadSource {
    /// Sources whose payloads carry server-authoritative timestamps.
    pub fn is_from_server(&self) -> bool {
        matches!(
            self,
            PayloadSource::RemoteRetrieved
                | PayloadSource::RemoteSaved
                | PayloadSource::RemoteConflict
        )
    }
}
