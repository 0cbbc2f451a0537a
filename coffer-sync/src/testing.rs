//! An in-memory sync server implementing the API contract: server-assigned
//! timestamps, sync/cursor tokens, conflict detection, and server-side
//! integrity hashes. Used by the test suites and by hosts that want a
//! loopback target.

use crate::api::{RawConflict, RawSyncResponse, SyncApi, SyncRequest};
use crate::error::ApiError;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use coffer_model::RawPayload;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;

/// Injectable failure for the next `sync` call(s).
#[derive(Clone, Copy, Debug)]
pub enum FailureMode {
    Unauthorized,
    Transport,
}

#[derive(Clone, Debug)]
struct StoredItem {
    raw: RawPayload,
}

struct ServerState {
    items: HashMap<String, StoredItem>,
    /// Strictly increasing server clock, in milliseconds.
    clock_ms: i64,
    key_params: Option<Value>,
    failure: Option<(FailureMode, u32)>,
}

/// The loopback sync server.
pub struct MockSyncServer {
    state: Mutex<ServerState>,
}

impl MockSyncServer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServerState {
                items: HashMap::new(),
                clock_ms: Utc::now().timestamp_millis(),
                key_params: None,
                failure: None,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Account emulation
    // -----------------------------------------------------------------------

    pub fn set_key_params(&self, params: Value) {
        self.state.lock().unwrap().key_params = Some(params);
    }

    pub fn key_params(&self) -> Option<Value> {
        self.state.lock().unwrap().key_params.clone()
    }

    // -----------------------------------------------------------------------
    // Test controls
    // -----------------------------------------------------------------------

    /// Makes the next `count` sync calls fail.
    pub fn fail_next(&self, mode: FailureMode, count: u32) {
        self.state.lock().unwrap().failure = Some((mode, count));
    }

    /// Seeds a server-side record directly (bypassing a client upload).
    pub fn seed_item(&self, mut raw: RawPayload) {
        let mut state = self.state.lock().unwrap();
        let now = tick(&mut state);
        if raw.created_at.is_none() {
            raw.created_at = Some(now);
        }
        raw.updated_at = Some(now);
        state.items.insert(raw.uuid.clone(), StoredItem { raw });
    }

    /// Seeds a record with an explicit (typically back-dated) timestamp.
    /// A stamp older than a client's sync token never reaches that client
    /// through incremental retrieval, which is how integrity drift happens
    /// in the wild.
    pub fn seed_item_with_stamp(&self, mut raw: RawPayload, stamp: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        if raw.created_at.is_none() {
            raw.created_at = Some(stamp);
        }
        raw.updated_at = Some(stamp);
        state.items.insert(raw.uuid.clone(), StoredItem { raw });
    }

    pub fn item_count(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn item(&self, uuid: &str) -> Option<RawPayload> {
        self.state
            .lock()
            .unwrap()
            .items
            .get(uuid)
            .map(|i| i.raw.clone())
    }

    pub fn non_deleted_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .items
            .values()
            .filter(|i| !i.raw.deleted.unwrap_or(false))
            .count()
    }

    /// The server-side integrity hash: SHA-256 hex over the comma-joined
    /// `updated_at` millisecond stamps of non-deleted items, descending.
    pub fn integrity_hash(&self) -> String {
        let state = self.state.lock().unwrap();
        integrity_hash_of(&state)
    }
}

impl Default for MockSyncServer {
    fn default() -> Self {
        Self::new()
    }
}

fn tick(state: &mut ServerState) -> DateTime<Utc> {
    state.clock_ms += 1;
    Utc.timestamp_millis_opt(state.clock_ms)
        .single()
        .unwrap_or_else(Utc::now)
}

fn integrity_hash_of(state: &ServerState) -> String {
    let mut stamps: Vec<i64> = state
        .items
        .values()
        .filter(|i| !i.raw.deleted.unwrap_or(false))
        .map(|i| i.raw.updated_at.map(|t| t.timestamp_millis()).unwrap_or(0))
        .collect();
    stamps.sort_unstable_by(|a, b| b.cmp(a));
    let joined = stamps
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(",");
    hex::encode(Sha256::digest(joined.as_bytes()))
}

fn parse_uploaded(value: &Value) -> Result<RawPayload, ApiError> {
    serde_json::from_value(value.clone()).map_err(|e| ApiError::Server {
        status: 400,
        message: format!("unreadable item: {}", e),
    })
}

#[async_trait]
impl SyncApi for MockSyncServer {
    async fn sync(&self, request: SyncRequest) -> Result<RawSyncResponse, ApiError> {
        let mut state = self.state.lock().unwrap();

        if let Some((mode, count)) = state.failure {
            let remaining = count.saturating_sub(1);
            state.failure = (remaining > 0).then_some((mode, remaining));
            return Err(match mode {
                FailureMode::Unauthorized => ApiError::Unauthorized,
                FailureMode::Transport => ApiError::Transport("connection refused".into()),
            });
        }

        let since_ms: Option<i64> = request
            .sync_token
            .as_deref()
            .and_then(|t| t.parse::<i64>().ok());
        let cursor_offset: usize = request
            .cursor_token
            .as_deref()
            .and_then(|t| t.parse::<usize>().ok())
            .unwrap_or(0);

        // Save uploads, detecting conflicts: an upload whose base
        // `updated_at` no longer matches the server record has raced
        // another client.
        let mut saved_items = Vec::new();
        let mut conflicts = Vec::new();
        let mut touched: Vec<String> = Vec::new();
        for value in &request.items {
            let incoming = parse_uploaded(value)?;
            if incoming.uuid.is_empty() {
                return Err(ApiError::Server {
                    status: 400,
                    message: "item without uuid".into(),
                });
            }
            if let Some(existing) = state.items.get(&incoming.uuid) {
                let server_stamp = existing.raw.updated_at.map(|t| t.timestamp_millis());
                let client_stamp = incoming.updated_at.map(|t| t.timestamp_millis());
                if server_stamp != client_stamp {
                    conflicts.push(RawConflict {
                        server_item: existing.raw.clone(),
                    });
                    continue;
                }
            }
            let now = tick(&mut state);
            let mut stored = incoming.clone();
            stored.dirty = None;
            stored.updated_at = Some(now);
            if stored.created_at.is_none() {
                stored.created_at = state
                    .items
                    .get(&incoming.uuid)
                    .and_then(|i| i.raw.created_at)
                    .or(Some(now));
            }
            let ack = RawPayload {
                uuid: stored.uuid.clone(),
                content_type: stored.content_type.clone(),
                deleted: stored.deleted,
                created_at: stored.created_at,
                updated_at: stored.updated_at,
                ..Default::default()
            };
            touched.push(stored.uuid.clone());
            state
                .items
                .insert(stored.uuid.clone(), StoredItem { raw: stored });
            saved_items.push(ack);
        }

        // Retrieval: everything changed since the sync token, excluding
        // what this very request just wrote.
        let mut candidates: Vec<RawPayload> = state
            .items
            .values()
            .map(|i| i.raw.clone())
            .filter(|raw| match since_ms {
                Some(since) => raw
                    .updated_at
                    .map(|t| t.timestamp_millis() > since)
                    .unwrap_or(false),
                None => true,
            })
            .filter(|raw| !touched.contains(&raw.uuid))
            .collect();
        candidates.sort_by_key(|raw| {
            (
                raw.updated_at.map(|t| t.timestamp_millis()).unwrap_or(0),
                raw.uuid.clone(),
            )
        });

        let page_size = request.limit.max(1);
        let page: Vec<RawPayload> = candidates
            .iter()
            .skip(cursor_offset)
            .take(page_size)
            .cloned()
            .collect();
        let next_offset = cursor_offset + page.len();
        let cursor_token = (next_offset < candidates.len()).then(|| next_offset.to_string());

        let integrity_hash = request
            .compute_integrity
            .then(|| integrity_hash_of(&state));

        Ok(RawSyncResponse {
            retrieved_items: page,
            saved_items,
            conflicts,
            sync_token: Some(state.clock_ms.to_string()),
            cursor_token,
            integrity_hash,
        })
    }
}
