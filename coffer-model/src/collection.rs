//! Source-tagged payload collections with O(1) uuid lookup.

use crate::payload::source::PayloadSource;
use crate::payload::Payload;
use std::collections::HashMap;

/// An immutable set of payloads sharing one provenance tag. Derivations
/// return a new collection; insertion order is preserved.
#[derive(Clone, Debug)]
pub struct PayloadCollection {
    source: PayloadSource,
    payloads: Vec<Payload>,
    index: HashMap<String, usize>,
}

impl PayloadCollection {
    pub fn new(source: PayloadSource) -> Self {
        Self {
            source,
            payloads: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Builds a collection; later payloads for the same uuid replace earlier
    /// ones in place, keeping the original position.
    pub fn from_payloads(payloads: Vec<Payload>, source: PayloadSource) -> Self {
        let mut collection = Self::new(source);
        for p in payloads {
            collection.insert(p);
        }
        collection
    }

    fn insert(&mut self, payload: Payload) {
        match self.index.get(payload.uuid()) {
            Some(&i) => self.payloads[i] = payload,
            None => {
                self.index.insert(payload.uuid().to_string(), self.payloads.len());
                self.payloads.push(payload);
            }
        }
    }

    /// A new collection with `payloads` applied on top of this one.
    pub fn with_payloads(&self, payloads: Vec<Payload>) -> Self {
        let mut copy = self.clone();
        for p in payloads {
            copy.insert(p);
        }
        copy
    }

    pub fn source(&self) -> PayloadSource {
        self.source
    }

    pub fn find(&self, uuid: &str) -> Option<&Payload> {
        self.index.get(uuid).map(|&i| &self.payloads[i])
    }

    pub fn all(&self) -> &[Payload] {
        &self.payloads
    }

    pub fn uuids(&self) -> impl Iterator<Item = &str> {
        self.payloads.iter().map(|p| p.uuid())
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{PayloadOverride, RawPayload};
    use serde_json::json;

    fn payload(uuid: &str) -> Payload {
        Payload::max_from_raw(
            &RawPayload {
                uuid: uuid.into(),
                content_type: "Note".into(),
                content: Some(json!({"title": uuid})),
                ..Default::default()
            },
            PayloadSource::Constructor,
        )
        .unwrap()
    }

    #[test]
    fn lookup_by_uuid() {
        let c = PayloadCollection::from_payloads(
            vec![payload("a"), payload("b")],
            PayloadSource::Constructor,
        );
        assert_eq!(c.len(), 2);
        assert_eq!(c.find("a").unwrap().uuid(), "a");
        assert!(c.find("missing").is_none());
    }

    #[test]
    fn later_payloads_replace_in_place() {
        let updated = payload("a").copy_with(PayloadOverride {
            dirty: Some(true),
            ..Default::default()
        });
        let c = PayloadCollection::from_payloads(
            vec![payload("a"), payload("b"), updated],
            PayloadSource::Constructor,
        );
        assert_eq!(c.len(), 2);
        assert!(c.find("a").unwrap().dirty());
        assert_eq!(c.all()[0].uuid(), "a");
    }

    #[test]
    fn derivation_leaves_base_untouched() {
        let base = PayloadCollection::from_payloads(vec![payload("a")], PayloadSource::Constructor);
        let derived = base.with_payloads(vec![payload("b")]);
        assert_eq!(base.len(), 1);
        assert_eq!(derived.len(), 2);
    }
}
