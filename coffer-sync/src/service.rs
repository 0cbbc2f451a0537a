//! The sync service: operation state machine, queue serialization, response
//! resolution, integrity tracking, and out-of-sync recovery.

use crate::api::{SyncApi, SyncRequest};
use crate::error::{ApiError, SyncError};
use crate::events::{EventRegistry, SyncEvent, SyncEventSink};
use crate::operation::SyncOperation;
use crate::resolver::ResponseResolver;
use crate::response::SyncResponse;
use crate::state::{IntegrityOutcome, SyncState};
use crate::storage::{keys as storage_keys, StoragePort};
use chrono::Utc;
use coffer_model::singleton::{self, SingletonPredicate};
use coffer_model::{
    ContentType, DeltaOutOfSync, ModelManager, Payload, PayloadCollection, PayloadOverride,
    PayloadSource,
};
use coffer_protocol::{EncryptionIntent, ItemsKey, ProtocolManager};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{oneshot, Mutex as AsyncMutex};

/// Responses touching at least this many items emit `MajorDataChange`.
pub const MAJOR_CHANGE_THRESHOLD: usize = 15;

/// How a `sync()` call behaves when a sync is already in progress.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncTimingStrategy {
    /// Join the resolve queue; resolved together when the in-flight sync
    /// (or the one after, for mid-round callers) completes.
    #[default]
    ResolveOnNext,
    /// Join the spawn queue; a dedicated sync round runs for each entry,
    /// popped one at a time.
    ForceSpawnNew,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SyncOptions {
    pub check_integrity: bool,
    pub timing: SyncTimingStrategy,
}

struct QueueState {
    in_progress: bool,
    resolve_queue: Vec<oneshot::Sender<()>>,
    spawn_queue: VecDeque<(SyncOptions, oneshot::Sender<()>)>,
    last_error: Option<String>,
}

enum SyncEntry {
    Run,
    Wait(oneshot::Receiver<()>),
}

/// Drives the whole data flow: dirty items out, server responses resolved
/// into the item graph, encrypted copies persisted locally.
pub struct SyncService {
    storage: Arc<dyn StoragePort>,
    api: Arc<dyn SyncApi>,
    protocol: Arc<ProtocolManager>,
    models: Arc<AsyncMutex<ModelManager>>,
    state: StdMutex<SyncState>,
    events: EventRegistry,
    queue: StdMutex<QueueState>,
    database_loaded: AtomicBool,
    cancel_requested: AtomicBool,
    followup_requested: AtomicBool,
}

impl SyncService {
    pub fn new(
        storage: Arc<dyn StoragePort>,
        api: Arc<dyn SyncApi>,
        protocol: Arc<ProtocolManager>,
    ) -> Self {
        Self {
            storage,
            api,
            protocol,
            models: Arc::new(AsyncMutex::new(ModelManager::new())),
            state: StdMutex::new(SyncState::new()),
            events: EventRegistry::new(),
            queue: StdMutex::new(QueueState {
                in_progress: false,
                resolve_queue: Vec::new(),
                spawn_queue: VecDeque::new(),
                last_error: None,
            }),
            database_loaded: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            followup_requested: AtomicBool::new(false),
        }
    }

    pub fn models(&self) -> &Arc<AsyncMutex<ModelManager>> {
        &self.models
    }

    pub fn protocol(&self) -> &Arc<ProtocolManager> {
        &self.protocol
    }

    pub fn add_event_observer(&self, name: &str, sink: Arc<dyn SyncEventSink>) {
        self.events.add(name, sink);
    }

    pub fn remove_event_observer(&self, name: &str) {
        self.events.remove(name);
    }

    pub fn last_error(&self) -> Option<String> {
        self.queue.lock().unwrap().last_error.clone()
    }

    pub fn is_out_of_sync(&self) -> bool {
        self.state.lock().unwrap().is_out_of_sync()
    }

    /// Requests cancellation of the running operation. Takes effect at the
    /// next round boundary; a round in flight always completes.
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    // -----------------------------------------------------------------------
    // Database load
    // -----------------------------------------------------------------------

    /// Loads, decrypts, and maps every stored payload. Items-keys load
    /// before everything else; the rest follow in `updated_at` descending
    /// order. Loading twice is a programmer error.
    pub async fn load_database(&self) -> Result<usize, SyncError> {
        assert!(
            !self.database_loaded.swap(true, Ordering::SeqCst),
            "local database loaded twice"
        );
        let raws = self.storage.get_all_raw_payloads().await?;
        let mut payloads = Vec::with_capacity(raws.len());
        for raw in &raws {
            match Payload::storage_from_raw(raw) {
                Ok(payload) => payloads.push(payload),
                Err(e) => {
                    tracing::warn!(uuid = %raw.uuid, error = %e, "skipping corrupt stored payload")
                }
            }
        }
        payloads.sort_by(|a, b| {
            a.content_type()
                .load_priority()
                .cmp(&b.content_type().load_priority())
                .then_with(|| b.updated_at().cmp(&a.updated_at()))
        });

        let decrypted = self.decrypt_with_key_priority(&payloads);
        let count = decrypted.len();
        {
            let mut models = self.models.lock().await;
            models.map_payloads_to_local_items(decrypted, PayloadSource::LocalRetrieved);
        }
        tracing::info!(payloads = count, "database loaded");
        self.events
            .notify(&SyncEvent::DatabaseLoaded { payload_count: count });
        self.flush_queued_syncs().await;
        Ok(count)
    }

    pub fn is_database_loaded(&self) -> bool {
        self.database_loaded.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Sync entry point & queue serialization
    // -----------------------------------------------------------------------

    /// Runs a sync, or queues the call per its timing strategy when one is
    /// already in progress (or the database has not loaded yet).
    pub async fn sync(&self, options: SyncOptions) -> Result<(), SyncError> {
        let entry = {
            let mut queue = self.queue.lock().unwrap();
            if queue.in_progress || !self.is_database_loaded() {
                let (tx, rx) = oneshot::channel();
                match options.timing {
                    SyncTimingStrategy::ResolveOnNext => queue.resolve_queue.push(tx),
                    SyncTimingStrategy::ForceSpawnNew => {
                        queue.spawn_queue.push_back((options, tx))
                    }
                }
                SyncEntry::Wait(rx)
            } else {
                queue.in_progress = true;
                SyncEntry::Run
            }
        };
        match entry {
            SyncEntry::Wait(rx) => {
                let _ = rx.await;
                Ok(())
            }
            SyncEntry::Run => self.run_sync_loop(options).await,
        }
    }

    async fn flush_queued_syncs(&self) {
        let has_queued = {
            let queue = self.queue.lock().unwrap();
            !queue.resolve_queue.is_empty() || !queue.spawn_queue.is_empty()
        };
        if has_queued {
            if let Err(e) = self.sync(SyncOptions::default()).await {
                tracing::warn!(error = %e, "queued sync after database load failed");
            }
        }
    }

    async fn run_sync_loop(&self, first: SyncOptions) -> Result<(), SyncError> {
        let mut round: Option<(SyncOptions, Option<oneshot::Sender<()>>)> = Some((first, None));
        while let Some((options, notify)) = round.take() {
            // Snapshot before the round begins: callers that enqueue while
            // it runs are deferred to the next round, never starved by
            // self-retrigger.
            let snapshot: Vec<oneshot::Sender<()>> = {
                std::mem::take(&mut self.queue.lock().unwrap().resolve_queue)
            };

            let result = self.perform_sync(&options).await;

            for tx in snapshot {
                let _ = tx.send(());
            }
            if let Some(tx) = notify {
                let _ = tx.send(());
            }

            if let Err(e) = result {
                let (resolvers, spawners) = {
                    let mut queue = self.queue.lock().unwrap();
                    queue.in_progress = false;
                    queue.last_error = Some(e.to_string());
                    (
                        std::mem::take(&mut queue.resolve_queue),
                        std::mem::take(&mut queue.spawn_queue),
                    )
                };
                for tx in resolvers {
                    let _ = tx.send(());
                }
                for (_, tx) in spawners {
                    let _ = tx.send(());
                }
                return Err(e);
            }

            let mut queue = self.queue.lock().unwrap();
            if let Some((opts, tx)) = queue.spawn_queue.pop_front() {
                round = Some((opts, Some(tx)));
            } else if !queue.resolve_queue.is_empty()
                || self.followup_requested.swap(false, Ordering::SeqCst)
            {
                round = Some((SyncOptions::default(), None));
            } else {
                queue.in_progress = false;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // One sync operation
    // -----------------------------------------------------------------------

    async fn perform_sync(&self, options: &SyncOptions) -> Result<(), SyncError> {
        self.pre_sync_save().await?;

        let now = Utc::now();
        let dirty = { self.models.lock().await.dirty_payloads() };
        let marked: Vec<Payload> = dirty
            .iter()
            .map(|p| {
                p.copy_with(PayloadOverride {
                    last_sync_began: Some(Some(now)),
                    ..Default::default()
                })
            })
            .collect();

        if !self.protocol.key_manager().has_root_key() {
            return self.perform_offline_sync(marked).await;
        }

        // A record that cannot be projected is skipped with a warning; it
        // stays dirty and gets another attempt next sync.
        let mut encrypted = Vec::with_capacity(marked.len());
        for payload in &marked {
            match self
                .protocol
                .payload_by_encrypting(payload, EncryptionIntent::Sync)
            {
                Ok(projected) => encrypted.push(projected),
                Err(e) => {
                    tracing::warn!(uuid = %payload.uuid(), error = %e, "skipping unencryptable payload")
                }
            }
        }

        let mut operation = SyncOperation::account(encrypted);
        let mut total_involved = 0usize;

        loop {
            operation.lock_cancelation();
            let batch = operation.pop_payloads();
            let sync_token = self.stored_string(storage_keys::LAST_SYNC_TOKEN).await?;
            let cursor_token = self.stored_string(storage_keys::PAGINATION_TOKEN).await?;
            let request = SyncRequest::new(
                batch.iter().map(|p| p.ejected()).collect(),
                sync_token,
                cursor_token,
            )
            .with_integrity(options.check_integrity);
            tracing::debug!(
                uploads = batch.len(),
                pending = operation.pending_upload_count(),
                "sync round"
            );

            let raw = self.call_api(request).await?;
            let response = SyncResponse::new(raw);

            if let Some(token) = response.sync_token() {
                self.storage
                    .set_value(storage_keys::LAST_SYNC_TOKEN, json!(token))
                    .await?;
            }
            match response.cursor_token() {
                Some(token) => {
                    self.storage
                        .set_value(storage_keys::PAGINATION_TOKEN, json!(token))
                        .await?
                }
                None => {
                    self.storage
                        .remove_value(storage_keys::PAGINATION_TOKEN)
                        .await?
                }
            }

            total_involved += response.number_of_items_involved();
            self.handle_response(&response, &batch).await?;

            if let Some(server_hash) = response.integrity_hash() {
                self.check_integrity(server_hash).await;
            }

            operation.unlock_cancelation();
            if self.cancel_requested.swap(false, Ordering::SeqCst) {
                operation.try_cancel();
            }
            if operation.is_cancelled() {
                tracing::info!("sync operation cancelled between rounds");
                break;
            }

            let has_cursor = self
                .stored_string(storage_keys::PAGINATION_TOKEN)
                .await?
                .is_some();
            if operation.pending_upload_count() == 0 && !has_cursor {
                break;
            }
        }

        if self.resolve_singletons().await? {
            self.followup_requested.store(true, Ordering::SeqCst);
        }

        if total_involved >= MAJOR_CHANGE_THRESHOLD {
            self.events.notify(&SyncEvent::MajorDataChange);
        }
        self.events.notify(&SyncEvent::FullSyncCompleted {
            items_involved: total_involved,
        });
        Ok(())
    }

    /// No account: encrypt under the local-prefer intent, persist, clear
    /// dirty. Runs through the same batching discipline as the online path.
    async fn perform_offline_sync(&self, marked: Vec<Payload>) -> Result<(), SyncError> {
        let mut operation = SyncOperation::offline(marked);
        let mut total = 0usize;
        loop {
            let batch = operation.pop_payloads();
            if batch.is_empty() {
                break;
            }
            total += batch.len();
            let now = Utc::now();
            let cleaned: Vec<Payload> = batch
                .iter()
                .map(|p| {
                    p.copy_with(PayloadOverride {
                        dirty: Some(false),
                        last_sync_end: Some(Some(now)),
                        ..Default::default()
                    })
                })
                .collect();
            let mapped = {
                let mut models = self.models.lock().await;
                models.map_payloads_to_local_items(cleaned, PayloadSource::LocalSaved)
            };
            self.persist_payloads(&mapped).await?;
        }
        if total >= MAJOR_CHANGE_THRESHOLD {
            self.events.notify(&SyncEvent::MajorDataChange);
        }
        self.events.notify(&SyncEvent::FullSyncCompleted {
            items_involved: total,
        });
        Ok(())
    }

    async fn call_api(&self, request: SyncRequest) -> Result<crate::api::RawSyncResponse, SyncError> {
        match self.api.sync(request).await {
            Ok(raw) => Ok(raw),
            Err(ApiError::Unauthorized) => {
                self.events.notify(&SyncEvent::InvalidSession);
                Err(SyncError::AuthFailure)
            }
            Err(other) => {
                let message = other.to_string();
                self.queue.lock().unwrap().last_error = Some(message.clone());
                self.events.notify(&SyncEvent::SyncError { message });
                Err(SyncError::from(other))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Response handling
    // -----------------------------------------------------------------------

    async fn handle_response(
        &self,
        response: &SyncResponse,
        batch: &[Payload],
    ) -> Result<(), SyncError> {
        let retrieved = response.retrieved_payloads()?;
        let decrypted_retrieved = self.decrypt_with_key_priority(&retrieved);
        let conflicts = response.conflict_payloads()?;
        let decrypted_conflicts = self.decrypt_with_key_priority(&conflicts);

        let all_mapped = {
            let mut models = self.models.lock().await;
            // The base collection is the local snapshot at response time;
            // every category resolves against it.
            let base = models.master_collection(PayloadSource::LocalRetrieved);
            let resolver = ResponseResolver::new(
                response,
                decrypted_retrieved,
                decrypted_conflicts,
                batch,
                &base,
            );
            let mut all_mapped = Vec::new();
            for collection in resolver.collections()? {
                let source = collection.source();
                let mapped =
                    models.map_payloads_to_local_items(collection.all().to_vec(), source);
                all_mapped.extend(mapped);
            }
            all_mapped
        };

        self.persist_payloads(&all_mapped).await?;
        self.redecrypt_waiting().await?;
        Ok(())
    }

    /// Decrypts a batch preserving order, but items-keys first: their
    /// material registers with the key manager so the rest of the batch can
    /// resolve its wraps in the same pass.
    fn decrypt_with_key_priority(&self, payloads: &[Payload]) -> Vec<Payload> {
        let mut out: Vec<Option<Payload>> = vec![None; payloads.len()];
        for (i, payload) in payloads.iter().enumerate() {
            if payload.content_type() == &ContentType::ItemsKey {
                let decrypted = self.protocol.payload_by_decrypting(payload);
                self.ingest_items_keys(std::slice::from_ref(&decrypted));
                out[i] = Some(decrypted);
            }
        }
        for (i, payload) in payloads.iter().enumerate() {
            if out[i].is_none() {
                out[i] = Some(self.protocol.payload_by_decrypting(payload));
            }
        }
        out.into_iter().flatten().collect()
    }

    /// Registers any decrypted items-keys with the key manager.
    fn ingest_items_keys(&self, payloads: &[Payload]) {
        for payload in payloads {
            if payload.content_type() != &ContentType::ItemsKey
                || payload.deleted()
                || payload.decrypted_content().is_none()
            {
                continue;
            }
            match ItemsKey::from_payload(payload) {
                Ok(key) => self.protocol.key_manager().add_items_key(key),
                Err(e) => {
                    tracing::warn!(uuid = %payload.uuid(), error = %e, "unreadable items-key")
                }
            }
        }
    }

    /// Retries payloads stalled on a missing items-key; maps and persists
    /// whichever ones now decrypt.
    async fn redecrypt_waiting(&self) -> Result<(), SyncError> {
        let waiting = { self.models.lock().await.payloads_waiting_for_key() };
        if waiting.is_empty() {
            return Ok(());
        }
        let progressed: Vec<Payload> = waiting
            .iter()
            .map(|p| self.protocol.payload_by_decrypting(p))
            .filter(|p| !p.waiting_for_key())
            .collect();
        if progressed.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = progressed.len(), "re-decrypted waiting payloads");
        let mapped = {
            let mut models = self.models.lock().await;
            models.map_payloads_to_local_items(progressed, PayloadSource::LocalRetrieved)
        };
        self.persist_payloads(&mapped).await
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Before any upload: persist everything dirtied since the last
    /// pre-sync save, so an interrupted upload cannot lose local edits.
    async fn pre_sync_save(&self) -> Result<(), SyncError> {
        let cutoff = { self.state.lock().unwrap().last_pre_sync_save() };
        let dirty = { self.models.lock().await.dirty_payloads() };
        let to_save: Vec<Payload> = dirty
            .into_iter()
            .filter(|p| match (p.dirtied_at(), cutoff) {
                (Some(dirtied), Some(cutoff)) => dirtied > cutoff,
                _ => true,
            })
            .collect();
        if !to_save.is_empty() {
            tracing::debug!(count = to_save.len(), "pre-sync save");
            self.persist_payloads(&to_save).await?;
        }
        self.state.lock().unwrap().mark_pre_sync_save(Utc::now());
        Ok(())
    }

    /// Persists payloads, encrypted when possible. Acknowledged tombstones
    /// are evicted instead.
    async fn persist_payloads(&self, payloads: &[Payload]) -> Result<(), SyncError> {
        let mut to_save = Vec::new();
        for payload in payloads {
            if payload.discardable() {
                self.storage.delete_payload(payload.uuid()).await?;
                continue;
            }
            let projected = if payload.decrypted_content().is_some() {
                match self
                    .protocol
                    .payload_by_encrypting(payload, EncryptionIntent::LocalStoragePreferEncrypted)
                {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(uuid = %payload.uuid(), error = %e, "storing unencrypted");
                        payload.clone()
                    }
                }
            } else {
                // Already encrypted (or an error-marked record): store as-is.
                payload.clone()
            };
            to_save.push(projected.ejected());
        }
        if !to_save.is_empty() {
            self.storage.save_payloads(&to_save).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Integrity
    // -----------------------------------------------------------------------

    /// SHA-256 hex over the comma-joined `updated_at` timestamps of all
    /// non-deleted, non-dummy items, sorted descending.
    pub async fn compute_client_integrity_hash(&self) -> String {
        let models = self.models.lock().await;
        let mut stamps: Vec<i64> = models
            .non_deleted_items()
            .map(|item| item.updated_at_timestamp())
            .collect();
        stamps.sort_unstable_by(|a, b| b.cmp(a));
        let joined = stamps
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(",");
        hex::encode(Sha256::digest(joined.as_bytes()))
    }

    async fn check_integrity(&self, server_hash: &str) {
        let client_hash = self.compute_client_integrity_hash().await;
        let outcome = {
            self.state
                .lock()
                .unwrap()
                .update_integrity(&client_hash, server_hash)
        };
        match outcome {
            IntegrityOutcome::EnteredOutOfSync => {
                tracing::warn!("entering out-of-sync");
                self.events.notify(&SyncEvent::EnterOutOfSync);
            }
            IntegrityOutcome::ExitedOutOfSync => {
                tracing::info!("exited out-of-sync");
                self.events.notify(&SyncEvent::ExitOutOfSync);
            }
            IntegrityOutcome::Discordant(count) => {
                tracing::warn!(discordance = count, "integrity hash mismatch");
            }
            IntegrityOutcome::InSync | IntegrityOutcome::StillOutOfSync => {}
        }
    }

    // -----------------------------------------------------------------------
    // Out-of-sync recovery
    // -----------------------------------------------------------------------

    /// Downloads every server payload, duplicates local divergence, adopts
    /// remote state, then re-syncs with an integrity check.
    pub async fn resolve_out_of_sync(&self) -> Result<(), SyncError> {
        tracing::info!("resolving out-of-sync");
        let mut downloaded: Vec<Payload> = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let request = SyncRequest::new(Vec::new(), None, cursor.clone());
            let raw = self.call_api(request).await?;
            let response = SyncResponse::new(raw);
            downloaded.extend(response.retrieved_payloads()?);
            cursor = response.cursor_token().map(String::from);
            if cursor.is_none() {
                break;
            }
        }

        let decrypted = self.decrypt_with_key_priority(&downloaded);
        let mapped = {
            let mut models = self.models.lock().await;
            let base = models.master_collection(PayloadSource::LocalRetrieved);
            let apply =
                PayloadCollection::from_payloads(decrypted, PayloadSource::RemoteRetrieved);
            let result = DeltaOutOfSync {
                base: &base,
                apply: &apply,
            }
            .resulting_collection();
            models.map_payloads_to_local_items(result.all().to_vec(), result.source())
        };
        self.persist_payloads(&mapped).await?;

        self.sync(SyncOptions {
            check_integrity: true,
            timing: SyncTimingStrategy::ResolveOnNext,
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Singletons
    // -----------------------------------------------------------------------

    /// Enforces singleton uniqueness after each sync; returns whether any
    /// extra instances were marked for deletion (they upload on the
    /// follow-up round).
    async fn resolve_singletons(&self) -> Result<bool, SyncError> {
        let newly_dirty = {
            let mut models = self.models.lock().await;
            let before: BTreeSet<String> = models
                .dirty_payloads()
                .iter()
                .map(|p| p.uuid().to_string())
                .collect();
            for content_type in [ContentType::Privileges, ContentType::UserPreferences] {
                let predicate = SingletonPredicate::for_content_type(content_type);
                let _ = singleton::resolve(&mut models, &predicate);
            }
            models
                .dirty_payloads()
                .into_iter()
                .filter(|p| !before.contains(p.uuid()))
                .collect::<Vec<_>>()
        };
        if newly_dirty.is_empty() {
            return Ok(false);
        }
        self.persist_payloads(&newly_dirty).await?;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Dirty helpers & session teardown
    // -----------------------------------------------------------------------

    /// Stamps every item dirty (credential rotation re-upload).
    pub async fn mark_all_items_as_needing_sync(&self) -> usize {
        let mapped = { self.models.lock().await.mark_all_items_dirty() };
        mapped.len()
    }

    /// Drops keys, the item graph, local payload copies, and sync tokens.
    pub async fn sign_out(&self) -> Result<(), SyncError> {
        self.protocol.key_manager().clear();
        {
            self.models.lock().await.clear_all();
        }
        for raw in self.storage.get_all_raw_payloads().await? {
            self.storage.delete_payload(&raw.uuid).await?;
        }
        self.storage
            .remove_value(storage_keys::LAST_SYNC_TOKEN)
            .await?;
        self.storage
            .remove_value(storage_keys::PAGINATION_TOKEN)
            .await?;
        self.database_loaded.store(false, Ordering::SeqCst);
        tracing::info!("signed out");
        Ok(())
    }

    async fn stored_string(&self, key: &str) -> Result<Option<String>, SyncError> {
        Ok(self
            .storage
            .get_value(key)
            .await?
            .and_then(|v| v.as_str().map(String::from)))
    }
}
