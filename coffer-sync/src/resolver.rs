//! The response resolver: turns one sync response into per-category
//! collections via the model deltas, resolved against a snapshot of local
//! state taken at response time.

use crate::response::SyncResponse;
use coffer_model::{
    DeltaRemoteConflict, DeltaRemoteRetrieved, DeltaRemoteSaved, Payload, PayloadCollection,
    PayloadSource,
};

/// Resolves `(response, decrypted payloads, in-flight set, base snapshot)`
/// into the ordered collections to map. Categories are applied whole, one
/// after another, so inverse indexes stay internally consistent between
/// them.
pub struct ResponseResolver<'a> {
    response: &'a SyncResponse,
    decrypted_retrieved: Vec<Payload>,
    decrypted_conflicts: Vec<Payload>,
    payloads_saved_or_saving: &'a [Payload],
    base: &'a PayloadCollection,
}

impl<'a> ResponseResolver<'a> {
    pub fn new(
        response: &'a SyncResponse,
        decrypted_retrieved: Vec<Payload>,
        decrypted_conflicts: Vec<Payload>,
        payloads_saved_or_saving: &'a [Payload],
        base: &'a PayloadCollection,
    ) -> Self {
        Self {
            response,
            decrypted_retrieved,
            decrypted_conflicts,
            payloads_saved_or_saving,
            base,
        }
    }

    /// One collection per response category, in application order:
    /// retrieved, saved, conflicts.
    pub fn collections(&self) -> Result<Vec<PayloadCollection>, crate::error::SyncError> {
        let mut out = Vec::with_capacity(3);

        let retrieved_apply = PayloadCollection::from_payloads(
            self.decrypted_retrieved.clone(),
            PayloadSource::RemoteRetrieved,
        );
        out.push(
            DeltaRemoteRetrieved {
                base: self.base,
                apply: &retrieved_apply,
                saved_or_saving: self.payloads_saved_or_saving,
            }
            .resulting_collection(),
        );

        let saved_apply = PayloadCollection::from_payloads(
            self.response.saved_payloads()?,
            PayloadSource::RemoteSaved,
        );
        out.push(
            DeltaRemoteSaved {
                base: self.base,
                apply: &saved_apply,
            }
            .resulting_collection(),
        );

        let conflict_apply = PayloadCollection::from_payloads(
            self.decrypted_conflicts.clone(),
            PayloadSource::RemoteConflict,
        );
        out.push(
            DeltaRemoteConflict {
                base: self.base,
                apply: &conflict_apply,
            }
            .resulting_collection(),
        );

        Ok(out)
    }
}
