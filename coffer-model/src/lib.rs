//! # coffer-model
//!
//! The data model of the coffer sync client: immutable payload records with
//! field-presence masks, source-tagged collections, category merge deltas,
//! and the live item graph with its inverse-reference index.
//!
//! Payload immutability is structural: fields are private and every "change"
//! derives a new payload, so a collection snapshot can never be mutated
//! behind a consumer's back.

pub mod collection;
pub mod content;
pub mod content_type;
pub mod delta;
pub mod error;
pub mod item;
pub mod manager;
pub mod payload;
pub mod singleton;

pub use collection::PayloadCollection;
pub use content::{ContentReference, ItemContent};
pub use content_type::ContentType;
pub use delta::{
    contents_differ, payloads_by_duplicating, DeltaOutOfSync, DeltaRemoteConflict,
    DeltaRemoteRetrieved, DeltaRemoteSaved,
};
pub use error::ModelError;
pub use item::Item;
pub use manager::{MappingObserver, ModelManager};
pub use payload::fields::{FieldSet, PayloadField};
pub use payload::format::{PayloadFormat, ProtocolVersion, BASE64_PREFIX};
pub use payload::source::PayloadSource;
pub use payload::{Payload, PayloadContent, PayloadOverride, RawPayload};
pub use singleton::{find_or_create, SingletonPredicate};
