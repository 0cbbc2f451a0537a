//! The sync-endpoint port and its wire shapes.

use crate::error::ApiError;
use async_trait::async_trait;
use coffer_model::RawPayload;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The API revision this client speaks.
pub const SYNC_API_VERSION: &str = "20200115";

/// Default per-round upload/download limit.
pub const DEFAULT_LIMIT: usize = 150;

/// POST body of one sync round.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncRequest {
    pub api: String,
    /// Wire-projected payloads ([`coffer_model::Payload::ejected`]).
    pub items: Vec<Value>,
    pub sync_token: Option<String>,
    pub cursor_token: Option<String>,
    pub limit: usize,
    pub compute_integrity: bool,
}

impl SyncRequest {
    pub fn new(items: Vec<Value>, sync_token: Option<String>, cursor_token: Option<String>) -> Self {
        Self {
            api: SYNC_API_VERSION.to_string(),
            items,
            sync_token,
            cursor_token,
            limit: DEFAULT_LIMIT,
            compute_integrity: false,
        }
    }

    pub fn with_integrity(mut self, compute: bool) -> Self {
        self.compute_integrity = compute;
        self
    }
}

/// A server-reported conflict entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawConflict {
    /// The server's record for the contested uuid.
    pub server_item: RawPayload,
}

/// Body of one sync response.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RawSyncResponse {
    #[serde(default)]
    pub retrieved_items: Vec<RawPayload>,
    #[serde(default)]
    pub saved_items: Vec<RawPayload>,
    #[serde(default)]
    pub conflicts: Vec<RawConflict>,
    pub sync_token: Option<String>,
    pub cursor_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity_hash: Option<String>,
}

/// The HTTP collaborator. Transport details (retries, TLS, headers) live
/// behind this seam; the engine only sees typed results.
#[async_trait]
pub trait SyncApi: Send + Sync {
    async fn sync(&self, request: SyncRequest) -> Result<RawSyncResponse, ApiError>;
}
