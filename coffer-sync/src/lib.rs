//! # coffer-sync
//!
//! The sync engine of the coffer client: a multi-round incremental sync
//! operation against an untrusted server, three-way conflict resolution,
//! integrity-hash divergence detection, and two-queue serialization of
//! concurrent sync requests.
//!
//! The engine talks to the outside world through two ports: [`SyncApi`]
//! (HTTP collaborator) and [`StoragePort`] (persistent blob store). Both
//! ship with in-memory implementations used by the test suites.

#![deny(unsafe_code)]

pub mod api;
pub mod error;
pub mod events;
pub mod operation;
pub mod resolver;
pub mod response;
pub mod service;
pub mod state;
pub mod storage;
pub mod testing;

pub use api::{RawConflict, RawSyncResponse, SyncApi, SyncRequest, DEFAULT_LIMIT, SYNC_API_VERSION};
pub use error::{ApiError, StorageError, SyncError};
pub use events::{CollectingSink, EventRegistry, SyncEvent, SyncEventSink};
pub use operation::{OperationKind, SyncOperation};
pub use resolver::ResponseResolver;
pub use response::SyncResponse;
pub use service::{SyncOptions, SyncService, SyncTimingStrategy, MAJOR_CHANGE_THRESHOLD};
pub use state::{IntegrityOutcome, SyncState, MAX_DISCORDANCE};
pub use storage::{keys as storage_keys, InMemoryStorage, StoragePort};
pub use testing::{FailureMode, MockSyncServer};
