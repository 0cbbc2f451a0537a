//! Singleton enforcement for content types that must have exactly one
//! non-deleted instance.

use crate::content_type::ContentType;
use crate::item::Item;
use crate::manager::ModelManager;
use crate::payload::source::PayloadSource;
use crate::payload::{Payload, PayloadOverride};
use chrono::{DateTime, Utc};

/// Defines the singleton set.
#[derive(Clone, Debug)]
pub struct SingletonPredicate {
    pub content_type: ContentType,
}

impl SingletonPredicate {
    pub fn for_content_type(content_type: ContentType) -> Self {
        Self { content_type }
    }

    pub fn matches(&self, item: &Item) -> bool {
        item.content_type() == &self.content_type
    }
}

/// Collapses the matching set down to its earliest-created member. Every
/// other candidate is marked `deleted, dirty` so the next sync removes it
/// everywhere. Returns the surviving uuid, or `None` when no valid
/// (decryptable, non-deleted) candidate exists.
pub fn resolve(manager: &mut ModelManager, predicate: &SingletonPredicate) -> Option<String> {
    let mut valid: Vec<(Option<DateTime<Utc>>, String)> = manager
        .items()
        .filter(|item| !item.is_dummy() && !item.deleted() && !item.error_decrypting())
        .filter(|item| predicate.matches(item))
        .map(|item| (item.created_at(), item.uuid().to_string()))
        .collect();
    if valid.is_empty() {
        return None;
    }
    // Earliest created_at wins; never-stamped candidates sort last.
    valid.sort_by_key(|(created_at, _)| created_at.unwrap_or(DateTime::<Utc>::MAX_UTC));
    let survivor = valid[0].1.clone();

    let extras: Vec<Payload> = valid[1..]
        .iter()
        .filter_map(|(_, uuid)| manager.item(uuid))
        .map(|item| {
            item.payload().copy_with(PayloadOverride {
                deleted: Some(true),
                dirty: Some(true),
                dirtied_at: Some(Some(Utc::now())),
                content: Some(None),
                ..Default::default()
            })
        })
        .collect();
    if !extras.is_empty() {
        tracing::info!(
            content_type = %predicate.content_type,
            removed = extras.len(),
            "singleton resolution"
        );
        manager.map_payloads_to_local_items(extras, PayloadSource::LocalDirtied);
    }

    Some(survivor)
}

/// Returns the unique valid candidate's uuid, creating one from
/// `create_payload` when none exists (including when only error-marked
/// candidates remain).
pub fn find_or_create(
    manager: &mut ModelManager,
    predicate: &SingletonPredicate,
    create_payload: impl FnOnce() -> Payload,
) -> String {
    if let Some(uuid) = resolve(manager, predicate) {
        return uuid;
    }
    let payload = create_payload().copy_with(PayloadOverride {
        dirty: Some(true),
        dirtied_at: Some(Some(Utc::now())),
        ..Default::default()
    });
    let uuid = payload.uuid().to_string();
    manager.map_payloads_to_local_items(vec![payload], PayloadSource::Constructor);
    uuid
}
