//! The model manager: authoritative item map, inverse reference index,
//! dirty set, and mapping observers.

use crate::collection::PayloadCollection;
use crate::content::ItemContent;
use crate::content_type::ContentType;
use crate::error::ModelError;
use crate::item::Item;
use crate::payload::source::PayloadSource;
use crate::payload::{Payload, PayloadContent, PayloadOverride};
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Notified after a batch of payloads has been applied to the item graph.
pub trait MappingObserver: Send + Sync {
    fn handle_mapped(&self, mapped: &[Payload], source: PayloadSource);
}

/// Owns the live item graph. All mutation of items funnels through here so
/// the inverse index and dirty set stay consistent with the graph.
pub struct ModelManager {
    items: HashMap<String, Item>,
    insertion: Vec<String>,
    /// target uuid -> uuids of items whose content references the target.
    inverse_refs: HashMap<String, BTreeSet<String>>,
    dirty: BTreeSet<String>,
    observers: Vec<(String, Arc<dyn MappingObserver>)>,
}

impl ModelManager {
    pub fn new() -> Self {
        Self {
            items: HashMap::new(),
            insertion: Vec::new(),
            inverse_refs: HashMap::new(),
            dirty: BTreeSet::new(),
            observers: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Observers
    // -----------------------------------------------------------------------

    /// Registers an observer under a stable name, replacing any previous
    /// registration with that name.
    pub fn add_mapping_observer(&mut self, name: &str, observer: Arc<dyn MappingObserver>) {
        self.remove_mapping_observer(name);
        self.observers.push((name.to_string(), observer));
    }

    pub fn remove_mapping_observer(&mut self, name: &str) {
        self.observers.retain(|(n, _)| n != name);
    }

    // -----------------------------------------------------------------------
    // Mapping
    // -----------------------------------------------------------------------

    /// Applies a batch of payloads to the item graph: create-or-update per
    /// payload, dummy promotion, inverse-index upkeep, dirty-set upkeep.
    /// Returns the payloads as applied (merged with prior item state), which
    /// is what the caller persists.
    pub fn map_payloads_to_local_items(
        &mut self,
        payloads: Vec<Payload>,
        source: PayloadSource,
    ) -> Vec<Payload> {
        let mut mapped = Vec::with_capacity(payloads.len());

        for payload in payloads {
            let uuid = payload.uuid().to_string();

            if payload.discardable() {
                self.remove_item(&uuid);
                mapped.push(payload);
                continue;
            }

            let merged = match self.items.get(&uuid) {
                Some(existing) if !existing.is_dummy() => {
                    existing.payload().merged_with(&payload)
                }
                _ => payload,
            };

            let old_refs = self.reference_targets(&uuid);
            match self.items.get_mut(&uuid) {
                Some(item) => {
                    if item.is_dummy() {
                        item.promote(merged.clone());
                    } else {
                        item.set_payload(merged.clone());
                    }
                }
                None => {
                    self.items.insert(uuid.clone(), Item::from_payload(merged.clone()));
                    self.insertion.push(uuid.clone());
                }
            }

            let new_refs = self.reference_targets(&uuid);
            self.reindex(&uuid, &old_refs, &new_refs);
            self.create_dummies_for_missing(&new_refs);

            if merged.dirty() {
                self.dirty.insert(uuid.clone());
            } else {
                self.dirty.remove(&uuid);
            }

            mapped.push(merged);
        }

        tracing::debug!(count = mapped.len(), source = ?source, "mapped payloads");
        let observers = self.observers.clone();
        for (_, observer) in observers {
            observer.handle_mapped(&mapped, source);
        }
        mapped
    }

    fn remove_item(&mut self, uuid: &str) {
        if let Some(item) = self.items.remove(uuid) {
            let targets: Vec<String> =
                item.references().iter().map(|r| r.uuid.clone()).collect();
            for target in targets {
                if let Some(set) = self.inverse_refs.get_mut(&target) {
                    set.remove(uuid);
                }
            }
        }
        self.insertion.retain(|u| u != uuid);
        self.inverse_refs.remove(uuid);
        self.dirty.remove(uuid);
    }

    fn reference_targets(&self, uuid: &str) -> BTreeSet<String> {
        self.items
            .get(uuid)
            .map(|item| item.references().iter().map(|r| r.uuid.clone()).collect())
            .unwrap_or_default()
    }

    fn reindex(&mut self, uuid: &str, old: &BTreeSet<String>, new: &BTreeSet<String>) {
        for removed in old.difference(new) {
            if let Some(set) = self.inverse_refs.get_mut(removed) {
                set.remove(uuid);
            }
        }
        for added in new.difference(old) {
            self.inverse_refs
                .entry(added.clone())
                .or_default()
                .insert(uuid.to_string());
        }
    }

    fn create_dummies_for_missing(&mut self, targets: &BTreeSet<String>) {
        for target in targets {
            if !self.items.contains_key(target) {
                self.items.insert(
                    target.clone(),
                    Item::dummy(target.clone(), ContentType::Unknown(String::new())),
                );
                self.insertion.push(target.clone());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Import
    // -----------------------------------------------------------------------

    /// Imports a batch of external payloads per the standalone-import rules:
    /// unknown uuid creates, equal content no-ops, diverging content becomes
    /// a new-uuid duplicate. All comparisons run against the local-content
    /// snapshot taken before any payload in the batch is mapped, so earlier
    /// mappings cannot cascade into false duplicates. Returns the payloads
    /// that became new items.
    pub fn import_payloads(&mut self, incoming: Vec<Payload>) -> Vec<Payload> {
        let snapshot: Vec<(String, Option<ItemContent>)> = self
            .insertion
            .iter()
            .filter_map(|uuid| self.items.get(uuid))
            .filter(|item| !item.is_dummy())
            .map(|item| (item.uuid().to_string(), item.content().cloned()))
            .collect();
        let local_by_uuid: HashMap<&str, &Option<ItemContent>> = snapshot
            .iter()
            .map(|(uuid, content)| (uuid.as_str(), content))
            .collect();

        let now = Utc::now();
        let mut to_map: Vec<Payload> = Vec::new();
        let mut created: Vec<Payload> = Vec::new();
        let mut batch_duplicates: Vec<(String, ItemContent)> = Vec::new();

        for payload in incoming {
            let incoming_content = payload.decrypted_content().cloned();
            match local_by_uuid.get(payload.uuid()) {
                None => {
                    let fresh = payload.copy_with(PayloadOverride {
                        dirty: Some(true),
                        dirtied_at: Some(Some(now)),
                        source: Some(PayloadSource::FileImport),
                        ..Default::default()
                    });
                    created.push(fresh.clone());
                    to_map.push(fresh);
                }
                Some(local_content) => {
                    let equal = match (local_content, &incoming_content) {
                        (Some(local), Some(inc)) => local.structurally_equals(inc),
                        (None, None) => true,
                        _ => false,
                    };
                    if equal {
                        continue;
                    }
                    if self.duplicate_already_exists(
                        &snapshot,
                        &batch_duplicates,
                        payload.uuid(),
                        incoming_content.as_ref(),
                    ) {
                        continue;
                    }
                    let duplicate = import_duplicate(&payload, now);
                    if let Some(content) = &incoming_content {
                        batch_duplicates.push((payload.uuid().to_string(), content.clone()));
                    }
                    created.push(duplicate.clone());
                    to_map.push(duplicate);
                }
            }
        }

        self.map_payloads_to_local_items(to_map, PayloadSource::FileImport);
        created
    }

    /// An earlier import of this exact divergence leaves behind a duplicate
    /// whose `conflict_of` points at the original uuid; re-importing the
    /// same batch must not stack another copy.
    fn duplicate_already_exists(
        &self,
        snapshot: &[(String, Option<ItemContent>)],
        batch_duplicates: &[(String, ItemContent)],
        original_uuid: &str,
        incoming: Option<&ItemContent>,
    ) -> bool {
        let Some(incoming) = incoming else {
            return false;
        };
        let existing = snapshot.iter().any(|(_, content)| {
            content.as_ref().is_some_and(|c| {
                c.extra.get("conflict_of").and_then(|v| v.as_str()) == Some(original_uuid)
                    && equals_ignoring_conflict_of(c, incoming)
            })
        });
        existing
            || batch_duplicates.iter().any(|(uuid, content)| {
                uuid == original_uuid && equals_ignoring_conflict_of(content, incoming)
            })
    }

    // -----------------------------------------------------------------------
    // Uuid alternation
    // -----------------------------------------------------------------------

    /// Moves an item to a fresh uuid: every referrer is rewritten to point
    /// at the new uuid and the old item becomes a pending-delete tombstone.
    /// Used when local data must be re-uploaded without overwriting server
    /// state. Returns the new uuid.
    pub fn alternate_uuid_for_item(&mut self, uuid: &str) -> Result<String, ModelError> {
        let old_payload = self
            .items
            .get(uuid)
            .map(|item| item.payload().clone())
            .ok_or_else(|| ModelError::ItemNotFound(uuid.to_string()))?;
        let new_uuid = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        let mut to_map = vec![old_payload.copy_with(PayloadOverride {
            uuid: Some(new_uuid.clone()),
            dirty: Some(true),
            dirtied_at: Some(Some(now)),
            updated_at: Some(None),
            last_sync_began: Some(None),
            last_sync_end: Some(None),
            ..Default::default()
        })];

        let referrers: Vec<String> = self
            .inverse_refs
            .get(uuid)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for referrer_uuid in referrers {
            let Some(referrer) = self.items.get(&referrer_uuid) else {
                continue;
            };
            let Some(content) = referrer.content() else {
                continue;
            };
            to_map.push(referrer.payload().copy_with(PayloadOverride {
                content: Some(Some(PayloadContent::Decrypted(
                    content.with_reference_retargeted(uuid, &new_uuid),
                ))),
                dirty: Some(true),
                dirtied_at: Some(Some(now)),
                ..Default::default()
            }));
        }

        to_map.push(old_payload.copy_with(PayloadOverride {
            deleted: Some(true),
            content: Some(None),
            dirty: Some(true),
            dirtied_at: Some(Some(now)),
            ..Default::default()
        }));

        self.map_payloads_to_local_items(to_map, PayloadSource::LocalDirtied);
        Ok(new_uuid)
    }

    // -----------------------------------------------------------------------
    // Dirty state
    // -----------------------------------------------------------------------

    /// Stamps the given items dirty and returns the mapped payloads.
    pub fn set_items_dirty(&mut self, uuids: &[String]) -> Vec<Payload> {
        let now = Utc::now();
        let to_map: Vec<Payload> = uuids
            .iter()
            .filter_map(|uuid| self.items.get(uuid))
            .map(|item| {
                item.payload().copy_with(PayloadOverride {
                    dirty: Some(true),
                    dirtied_at: Some(Some(now)),
                    ..Default::default()
                })
            })
            .collect();
        self.map_payloads_to_local_items(to_map, PayloadSource::LocalDirtied)
    }

    /// Stamps every live item dirty (used when credentials change and all
    /// data must re-upload).
    pub fn mark_all_items_dirty(&mut self) -> Vec<Payload> {
        let uuids: Vec<String> = self
            .insertion
            .iter()
            .filter(|uuid| self.items.get(*uuid).is_some_and(|i| !i.is_dummy()))
            .cloned()
            .collect();
        self.set_items_dirty(&uuids)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn item(&self, uuid: &str) -> Option<&Item> {
        self.items.get(uuid)
    }

    /// Live items in insertion order.
    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.insertion.iter().filter_map(|uuid| self.items.get(uuid))
    }

    pub fn items_of_type(&self, content_type: ContentType) -> impl Iterator<Item = &Item> {
        self.items()
            .filter(move |item| item.content_type() == &content_type)
    }

    pub fn non_deleted_items(&self) -> impl Iterator<Item = &Item> {
        self.items().filter(|item| !item.deleted() && !item.is_dummy())
    }

    /// Count of items whose referencing set includes anything.
    pub fn referencing_count(&self, uuid: &str) -> usize {
        self.inverse_refs.get(uuid).map(|s| s.len()).unwrap_or(0)
    }

    pub fn referencing_items(&self, uuid: &str) -> Vec<&Item> {
        self.inverse_refs
            .get(uuid)
            .map(|set| set.iter().filter_map(|u| self.items.get(u)).collect())
            .unwrap_or_default()
    }

    pub fn dirty_payloads(&self) -> Vec<Payload> {
        self.dirty
            .iter()
            .filter_map(|uuid| self.items.get(uuid))
            .map(|item| item.payload().clone())
            .collect()
    }

    /// Items that failed decryption.
    pub fn invalid_item_count(&self) -> usize {
        self.items().filter(|i| i.error_decrypting()).count()
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// A snapshot collection of every live, non-dummy item's payload.
    /// This is the base collection every delta resolves against.
    pub fn master_collection(&self, source: PayloadSource) -> PayloadCollection {
        let payloads = self
            .items()
            .filter(|item| !item.is_dummy())
            .map(|item| item.payload().clone())
            .collect();
        PayloadCollection::from_payloads(payloads, source)
    }

    /// Payloads currently marked `waiting_for_key`, for re-decryption when
    /// the missing items-key arrives.
    pub fn payloads_waiting_for_key(&self) -> Vec<Payload> {
        self.items()
            .filter(|item| item.waiting_for_key())
            .map(|item| item.payload().clone())
            .collect()
    }

    /// Drops all local state (sign-out).
    pub fn clear_all(&mut self) {
        self.items.clear();
        self.insertion.clear();
        self.inverse_refs.clear();
        self.dirty.clear();
    }
}

impl Default for ModelManager {
    fn default() -> Self {
        Self::new()
    }
}

fn equals_ignoring_conflict_of(a: &ItemContent, b: &ItemContent) -> bool {
    let strip = |c: &ItemContent| {
        let mut copy = c.clone();
        copy.extra.remove("conflict_of");
        copy
    };
    strip(a).structurally_equals(&strip(b))
}

fn import_duplicate(payload: &Payload, now: chrono::DateTime<Utc>) -> Payload {
    let content = payload.decrypted_content().map(|c| {
        let mut copy = c.clone();
        copy.extra.insert(
            "conflict_of".into(),
            serde_json::Value::String(payload.uuid().to_string()),
        );
        PayloadContent::Decrypted(copy)
    });
    payload.copy_with(PayloadOverride {
        uuid: Some(uuid::Uuid::new_v4().to_string()),
        content: content.map(Some),
        dirty: Some(true),
        dirtied_at: Some(Some(now)),
        updated_at: Some(None),
        source: Some(PayloadSource::FileImport),
        ..Default::default()
    })
}
