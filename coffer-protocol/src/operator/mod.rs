//! Protocol operators: one per on-wire version.
//!
//! An operator realizes root-key derivation, item encryption/decryption, and
//! items-key creation for its version. 004 is the write target; 001–003
//! exist to faithfully read historical data (their write paths survive for
//! round-trip coverage). The operator set is a closed sum; the protocol
//! manager memoizes one instance per version.

mod legacy;
mod v004;

pub use legacy::{OperatorV001, OperatorV002, OperatorV003};
pub use v004::OperatorV004;

use crate::crypto::CryptoProvider;
use crate::error::ProtocolError;
use crate::keys::{EncryptionKey, ItemsKey, KeyParams, RootKey};
use coffer_model::{ItemContent, Payload, ProtocolVersion};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Operator results
// ---------------------------------------------------------------------------

/// The encrypted projection of a payload. Produced without mutating the
/// source payload; the protocol manager folds it back into a derived payload.
#[derive(Clone, Debug)]
pub struct EncryptionParameters {
    pub content: String,
    pub enc_item_key: String,
    pub items_key_id: Option<String>,
    /// Legacy content authentication tag (001/002 payload field).
    pub auth_hash: Option<String>,
}

/// The decrypted projection of a payload. Failures never escape as errors;
/// they are encoded in the flags so a single corrupt record cannot stall
/// the pipeline.
#[derive(Clone, Debug)]
pub struct DecryptedParameters {
    pub content: Option<ItemContent>,
    pub error_decrypting: bool,
    pub error_decrypting_changed: bool,
    pub waiting_for_key: bool,
}

impl DecryptedParameters {
    /// A successful decrypt. `previously_errored` drives the changed flag so
    /// listeners refresh items that just became readable.
    pub fn success(content: ItemContent, previously_errored: bool) -> Self {
        Self {
            content: Some(content),
            error_decrypting: false,
            error_decrypting_changed: previously_errored,
            waiting_for_key: false,
        }
    }

    pub fn error(previously_errored: bool) -> Self {
        Self {
            content: None,
            error_decrypting: true,
            error_decrypting_changed: !previously_errored,
            waiting_for_key: false,
        }
    }

    /// The required items-key has not arrived yet; retry later.
    pub fn waiting_for_key() -> Self {
        Self {
            content: None,
            error_decrypting: false,
            error_decrypting_changed: false,
            waiting_for_key: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Cost floors
// ---------------------------------------------------------------------------

/// The minimum KDF cost a client will accept for a version. For 004 the
/// figure is the Argon2id iteration count; for the legacy versions it is
/// PBKDF2 rounds.
pub fn cost_minimum_for_version(version: ProtocolVersion) -> u32 {
    match version {
        ProtocolVersion::V001 => 3000,
        ProtocolVersion::V002 => 3000,
        ProtocolVersion::V003 => 110_000,
        ProtocolVersion::V004 => 5,
    }
}

// ---------------------------------------------------------------------------
// The operator sum
// ---------------------------------------------------------------------------

/// A version-dispatched protocol operator.
pub enum ProtocolOperator {
    V001(OperatorV001),
    V002(OperatorV002),
    V003(OperatorV003),
    V004(OperatorV004),
}

impl ProtocolOperator {
    pub fn for_version(version: ProtocolVersion, crypto: Arc<dyn CryptoProvider>) -> Self {
        match version {
            ProtocolVersion::V001 => Self::V001(OperatorV001::new(crypto)),
            ProtocolVersion::V002 => Self::V002(OperatorV002::new(crypto)),
            ProtocolVersion::V003 => Self::V003(OperatorV003::new(crypto)),
            ProtocolVersion::V004 => Self::V004(OperatorV004::new(crypto)),
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        match self {
            Self::V001(_) => ProtocolVersion::V001,
            Self::V002(_) => ProtocolVersion::V002,
            Self::V003(_) => ProtocolVersion::V003,
            Self::V004(_) => ProtocolVersion::V004,
        }
    }

    /// Static cost floor for this operator's version.
    pub fn kdf_iterations(&self) -> u32 {
        cost_minimum_for_version(self.version())
    }

    /// Generates a fresh nonce/seed, derives key material, and returns both
    /// the key and the public params needed to re-derive it.
    pub fn create_root_key(
        &self,
        identifier: &str,
        password: &str,
    ) -> Result<(RootKey, KeyParams), ProtocolError> {
        match self {
            Self::V001(op) => op.create_root_key(identifier, password),
            Self::V002(op) => op.create_root_key(identifier, password),
            Self::V003(op) => op.create_root_key(identifier, password),
            Self::V004(op) => op.create_root_key(identifier, password),
        }
    }

    /// Deterministic re-derivation from public params.
    pub fn compute_root_key(
        &self,
        password: &str,
        key_params: &KeyParams,
    ) -> Result<RootKey, ProtocolError> {
        match self {
            Self::V001(op) => op.compute_root_key(password, key_params),
            Self::V002(op) => op.compute_root_key(password, key_params),
            Self::V003(op) => op.compute_root_key(password, key_params),
            Self::V004(op) => op.compute_root_key(password, key_params),
        }
    }

    /// Creates a fresh items-key. Only the current version supports this;
    /// legacy data is wrapped directly by the root key.
    pub fn create_items_key(&self) -> Result<ItemsKey, ProtocolError> {
        match self {
            Self::V004(op) => Ok(op.create_items_key()),
            _ => Err(ProtocolError::UnsupportedOperation("create_items_key")),
        }
    }

    /// Encrypts a payload's decrypted content under `key`, returning the
    /// encrypted projection.
    pub fn generate_encryption_parameters(
        &self,
        payload: &Payload,
        key: &EncryptionKey,
    ) -> Result<EncryptionParameters, ProtocolError> {
        match self {
            Self::V001(op) => op.generate_encryption_parameters(payload, key),
            Self::V002(op) => op.generate_encryption_parameters(payload, key),
            Self::V003(op) => op.generate_encryption_parameters(payload, key),
            Self::V004(op) => op.generate_encryption_parameters(payload, key),
        }
    }

    /// Decrypts a payload's encrypted content. Never fails outward: AEAD or
    /// composition failures come back as error-marked parameters.
    pub fn generate_decrypted_parameters(
        &self,
        payload: &Payload,
        key: &EncryptionKey,
    ) -> DecryptedParameters {
        match self {
            Self::V001(op) => op.generate_decrypted_parameters(payload, key),
            Self::V002(op) => op.generate_decrypted_parameters(payload, key),
            Self::V003(op) => op.generate_decrypted_parameters(payload, key),
            Self::V004(op) => op.generate_decrypted_parameters(payload, key),
        }
    }
}
