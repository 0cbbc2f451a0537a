//! Category merge rules: how a server response folds into local state.
//!
//! Each delta takes a base collection (the local snapshot taken before the
//! response was processed) and an apply collection (one response category)
//! and produces the collection of payloads to be mapped. Conflicts never
//! lose data; the losing side becomes a duplicate item under a fresh uuid.

use crate::collection::PayloadCollection;
use crate::content::{ContentReference, ItemContent};
use crate::payload::source::PayloadSource;
use crate::payload::{Payload, PayloadContent, PayloadOverride};
use chrono::Utc;
use std::collections::HashSet;

/// Key recorded in a conflict duplicate's content, pointing back at the
/// uuid it diverged from.
const CONFLICT_OF_KEY: &str = "conflict_of";

// ---------------------------------------------------------------------------
// Duplication
// ---------------------------------------------------------------------------

/// Duplicates `target` under a fresh uuid.
///
/// Returns the duplicate followed by a re-written copy of every payload in
/// `base` that references `target`, each gaining a reference to the duplicate
/// so the new item keeps the original's place in the graph.
pub fn payloads_by_duplicating(
    target: &Payload,
    base: &PayloadCollection,
    is_conflict: bool,
) -> Vec<Payload> {
    let new_uuid = uuid::Uuid::new_v4().to_string();
    let now = Utc::now();

    let content = target.decrypted_content().map(|c| {
        let mut copy = c.clone();
        if is_conflict {
            copy.extra.insert(
                CONFLICT_OF_KEY.into(),
                serde_json::Value::String(target.uuid().to_string()),
            );
        }
        PayloadContent::Decrypted(copy)
    });

    let duplicate = target.copy_with(PayloadOverride {
        uuid: Some(new_uuid.clone()),
        content: content.map(Some),
        dirty: Some(true),
        dirtied_at: Some(Some(now)),
        created_at: Some(now),
        updated_at: Some(None),
        last_sync_began: Some(None),
        last_sync_end: Some(None),
        ..Default::default()
    });

    let mut results = vec![duplicate];

    for referrer in base.all() {
        if referrer.uuid() == target.uuid() {
            continue;
        }
        let Some(content) = referrer.decrypted_content() else {
            continue;
        };
        if !content.references_uuid(target.uuid()) {
            continue;
        }
        let rewritten = content.with_reference(ContentReference {
            uuid: new_uuid.clone(),
            content_type: target.content_type().clone(),
        });
        results.push(referrer.copy_with(PayloadOverride {
            content: Some(Some(PayloadContent::Decrypted(rewritten))),
            dirty: Some(true),
            dirtied_at: Some(Some(now)),
            ..Default::default()
        }));
    }

    results
}

// ---------------------------------------------------------------------------
// Content comparison
// ---------------------------------------------------------------------------

/// Whether two payloads' decrypted contents diverge.
///
/// Matching tombstones are equal. Anything that cannot be compared (an
/// encrypted or error-marked side against a decrypted one) counts as
/// differing, so unreadable local edits are preserved as duplicates rather
/// than silently dropped.
pub fn contents_differ(a: &Payload, b: &Payload) -> bool {
    if a.deleted() && b.deleted() {
        return false;
    }
    match (comparable_content(a), comparable_content(b)) {
        (Some(ca), Some(cb)) => !ca.structurally_equals(cb),
        _ => true,
    }
}

fn comparable_content(p: &Payload) -> Option<&ItemContent> {
    if p.error_decrypting() {
        return None;
    }
    p.decrypted_content()
}

// ---------------------------------------------------------------------------
// remoteRetrieved
// ---------------------------------------------------------------------------

/// Merge rule for `retrieved_items`.
pub struct DeltaRemoteRetrieved<'a> {
    pub base: &'a PayloadCollection,
    pub apply: &'a PayloadCollection,
    /// Uuids currently in flight to the server; retrieved copies of these
    /// are stale and ignored.
    pub saved_or_saving: &'a [Payload],
}

impl DeltaRemoteRetrieved<'_> {
    pub fn resulting_collection(&self) -> PayloadCollection {
        let in_flight: HashSet<&str> =
            self.saved_or_saving.iter().map(|p| p.uuid()).collect();
        let mut results = Vec::new();

        for incoming in self.apply.all() {
            if in_flight.contains(incoming.uuid()) {
                continue;
            }
            let incoming = incoming.copy_with(PayloadOverride {
                source: Some(PayloadSource::RemoteRetrieved),
                ..Default::default()
            });
            match self.base.find(incoming.uuid()) {
                Some(local) if local.dirty() => {
                    if contents_differ(local, &incoming) {
                        results.push(incoming);
                        results.extend(payloads_by_duplicating(local, self.base, true));
                    } else {
                        results.push(incoming);
                    }
                }
                _ => results.push(incoming),
            }
        }

        PayloadCollection::from_payloads(results, PayloadSource::RemoteRetrieved)
    }
}

// ---------------------------------------------------------------------------
// remoteSaved
// ---------------------------------------------------------------------------

/// Merge rule for `saved_items`: acknowledgements carrying no content.
pub struct DeltaRemoteSaved<'a> {
    pub base: &'a PayloadCollection,
    pub apply: &'a PayloadCollection,
}

impl DeltaRemoteSaved<'_> {
    pub fn resulting_collection(&self) -> PayloadCollection {
        let now = Utc::now();
        let mut results = Vec::new();

        for saved in self.apply.all() {
            let merged = match self.base.find(saved.uuid()) {
                Some(local) => local.merged_with(saved),
                None => saved.clone(),
            };
            results.push(merged.copy_with(PayloadOverride {
                dirty: Some(false),
                last_sync_end: Some(Some(now)),
                source: Some(PayloadSource::RemoteSaved),
                ..Default::default()
            }));
        }

        PayloadCollection::from_payloads(results, PayloadSource::RemoteSaved)
    }
}

// ---------------------------------------------------------------------------
// remoteConflict
// ---------------------------------------------------------------------------

/// Merge rule for `conflicts`: the server holds a differing record under a
/// uuid we tried to write. The local version moves to a fresh uuid; the
/// server version takes the original.
pub struct DeltaRemoteConflict<'a> {
    pub base: &'a PayloadCollection,
    pub apply: &'a PayloadCollection,
}

impl DeltaRemoteConflict<'_> {
    pub fn resulting_collection(&self) -> PayloadCollection {
        let mut results = Vec::new();

        for server_version in self.apply.all() {
            if let Some(local) = self.base.find(server_version.uuid()) {
                results.extend(payloads_by_duplicating(local, self.base, true));
            }
            results.push(server_version.copy_with(PayloadOverride {
                dirty: Some(false),
                source: Some(PayloadSource::RemoteConflict),
                ..Default::default()
            }));
        }

        PayloadCollection::from_payloads(results, PayloadSource::RemoteConflict)
    }
}

// ---------------------------------------------------------------------------
// outOfSync
// ---------------------------------------------------------------------------

/// Merge rule for out-of-sync reconciliation against a full server download.
/// Divergent local copies are duplicated, then remote state overwrites local.
pub struct DeltaOutOfSync<'a> {
    pub base: &'a PayloadCollection,
    pub apply: &'a PayloadCollection,
}

impl DeltaOutOfSync<'_> {
    pub fn resulting_collection(&self) -> PayloadCollection {
        let mut results = Vec::new();

        for remote in self.apply.all() {
            if let Some(local) = self.base.find(remote.uuid()) {
                if contents_differ(local, remote) {
                    results.extend(payloads_by_duplicating(local, self.base, true));
                }
            }
            results.push(remote.copy_with(PayloadOverride {
                source: Some(PayloadSource::RemoteRetrieved),
                ..Default::default()
            }));
        }

        PayloadCollection::from_payloads(results, PayloadSource::RemoteRetrieved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::RawPayload;
    use serde_json::json;

    fn note(uuid: &str, text: &str) -> Payload {
        Payload::max_from_raw(
            &RawPayload {
                uuid: uuid.into(),
                content_type: "Note".into(),
                content: Some(json!({"text": text})),
                ..Default::default()
            },
            PayloadSource::Constructor,
        )
        .unwrap()
    }

    fn tag_referencing(uuid: &str, note_uuid: &str) -> Payload {
        Payload::max_from_raw(
            &RawPayload {
                uuid: uuid.into(),
                content_type: "Tag".into(),
                content: Some(json!({
                    "title": "t",
                    "references": [{"uuid": note_uuid, "content_type": "Note"}]
                })),
                ..Default::default()
            },
            PayloadSource::Constructor,
        )
        .unwrap()
    }

    fn dirty(p: Payload) -> Payload {
        p.copy_with(PayloadOverride {
            dirty: Some(true),
            dirtied_at: Some(Some(Utc::now())),
            ..Default::default()
        })
    }

    fn collection(payloads: Vec<Payload>, source: PayloadSource) -> PayloadCollection {
        PayloadCollection::from_payloads(payloads, source)
    }

    #[test]
    fn retrieved_replaces_clean_local() {
        let base = collection(vec![note("a", "old")], PayloadSource::LocalRetrieved);
        let apply = collection(vec![note("a", "new")], PayloadSource::RemoteRetrieved);
        let delta = DeltaRemoteRetrieved {
            base: &base,
            apply: &apply,
            saved_or_saving: &[],
        };
        let result = delta.resulting_collection();
        assert_eq!(result.len(), 1);
        assert_eq!(
            result.find("a").unwrap().decrypted_content().unwrap().extra["text"],
            json!("new")
        );
    }

    #[test]
    fn retrieved_conflicts_duplicate_dirty_local() {
        let base = collection(vec![dirty(note("a", "mine"))], PayloadSource::LocalRetrieved);
        let apply = collection(vec![note("a", "theirs")], PayloadSource::RemoteRetrieved);
        let delta = DeltaRemoteRetrieved {
            base: &base,
            apply: &apply,
            saved_or_saving: &[],
        };
        let result = delta.resulting_collection();
        assert_eq!(result.len(), 2);

        let incoming = result.find("a").unwrap();
        assert_eq!(incoming.decrypted_content().unwrap().extra["text"], json!("theirs"));

        let duplicate = result.all().iter().find(|p| p.uuid() != "a").unwrap();
        assert!(duplicate.dirty());
        let content = duplicate.decrypted_content().unwrap();
        assert_eq!(content.extra["text"], json!("mine"));
        assert_eq!(content.extra[CONFLICT_OF_KEY], json!("a"));
    }

    #[test]
    fn retrieved_equal_dirty_local_is_not_duplicated() {
        let base = collection(vec![dirty(note("a", "same"))], PayloadSource::LocalRetrieved);
        let apply = collection(vec![note("a", "same")], PayloadSource::RemoteRetrieved);
        let delta = DeltaRemoteRetrieved {
            base: &base,
            apply: &apply,
            saved_or_saving: &[],
        };
        assert_eq!(delta.resulting_collection().len(), 1);
    }

    #[test]
    fn retrieved_skips_in_flight_uuids() {
        let saving = vec![dirty(note("a", "mine"))];
        let base = collection(saving.clone(), PayloadSource::LocalRetrieved);
        let apply = collection(vec![note("a", "stale")], PayloadSource::RemoteRetrieved);
        let delta = DeltaRemoteRetrieved {
            base: &base,
            apply: &apply,
            saved_or_saving: &saving,
        };
        assert!(delta.resulting_collection().is_empty());
    }

    #[test]
    fn duplication_rewrites_referrers() {
        let target = dirty(note("n1", "mine"));
        let base = collection(
            vec![target.clone(), tag_referencing("t1", "n1")],
            PayloadSource::LocalRetrieved,
        );
        let results = payloads_by_duplicating(&target, &base, true);
        assert_eq!(results.len(), 2);

        let duplicate = &results[0];
        let tag = &results[1];
        assert_eq!(tag.uuid(), "t1");
        assert!(tag.dirty());
        let refs = &tag.decrypted_content().unwrap().references;
        assert!(refs.iter().any(|r| r.uuid == "n1"));
        assert!(refs.iter().any(|r| r.uuid == duplicate.uuid()));
    }

    #[test]
    fn saved_ack_clears_dirty_and_keeps_content() {
        let base = collection(vec![dirty(note("a", "text"))], PayloadSource::LocalRetrieved);
        let ack = Payload::server_saved_from_raw(&RawPayload {
            uuid: "a".into(),
            content_type: "Note".into(),
            updated_at: Some(Utc::now()),
            ..Default::default()
        })
        .unwrap();
        let apply = collection(vec![ack], PayloadSource::RemoteSaved);
        let delta = DeltaRemoteSaved {
            base: &base,
            apply: &apply,
        };
        let result = delta.resulting_collection();
        let merged = result.find("a").unwrap();
        assert!(!merged.dirty());
        assert!(merged.last_sync_end().is_some());
        assert_eq!(merged.decrypted_content().unwrap().extra["text"], json!("text"));
    }

    #[test]
    fn conflict_moves_local_aside_and_adopts_server() {
        let base = collection(vec![dirty(note("a", "mine"))], PayloadSource::LocalRetrieved);
        let apply = collection(vec![note("a", "server")], PayloadSource::RemoteConflict);
        let delta = DeltaRemoteConflict {
            base: &base,
            apply: &apply,
        };
        let result = delta.resulting_collection();
        assert_eq!(result.len(), 2);
        assert_eq!(
            result.find("a").unwrap().decrypted_content().unwrap().extra["text"],
            json!("server")
        );
        let duplicate = result.all().iter().find(|p| p.uuid() != "a").unwrap();
        assert_eq!(duplicate.decrypted_content().unwrap().extra["text"], json!("mine"));
        assert!(duplicate.dirty());
    }

    #[test]
    fn out_of_sync_duplicates_divergent_and_adopts_remote() {
        let base = collection(vec![note("a", "local"), note("b", "same")], PayloadSource::LocalRetrieved);
        let apply = collection(vec![note("a", "remote"), note("b", "same")], PayloadSource::RemoteRetrieved);
        let delta = DeltaOutOfSync {
            base: &base,
            apply: &apply,
        };
        let result = delta.resulting_collection();
        // a diverges: duplicate + remote. b equal: remote only.
        assert_eq!(result.len(), 3);
        assert_eq!(
            result.find("a").unwrap().decrypted_content().unwrap().extra["text"],
            json!("remote")
        );
    }

    #[test]
    fn tombstone_against_dirty_content_differs() {
        let local = dirty(note("a", "mine"));
        let tombstone = local.copy_with(PayloadOverride {
            content: Some(None),
            deleted: Some(true),
            dirty: Some(false),
            ..Default::default()
        });
        assert!(contents_differ(&local, &tombstone));
    }
}
