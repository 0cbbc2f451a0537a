//! # coffer-protocol
//!
//! Versioned cryptographic operations for the coffer sync client.
//!
//! ## Layout
//!
//! - [`crypto`] — the primitive provider consumed by every operator
//! - [`operator`] — versioned operators 001–004 (004 writes, all read)
//! - [`keys`] — root key, key params, items-keys
//! - [`key_manager`] — key ownership, selection, and passcode wrapping
//! - [`manager`] — the facade routing payloads by version and intent
//!
//! ## Security properties
//!
//! - **Identity-bound AEAD**: 004 AAD commits to the item uuid, so
//!   ciphertexts cannot be swapped between items
//! - **Uniform decrypt failures**: every authentication failure produces the
//!   same error-marked result
//! - **Containment**: a corrupt record never stops the pipeline; it comes
//!   back flagged instead

#![deny(unsafe_code)]

pub mod crypto;
pub mod error;
pub mod intent;
pub mod key_manager;
pub mod keys;
pub mod manager;
pub mod operator;
pub mod wire;

pub use crypto::{CryptoProvider, PlatformCrypto};
pub use error::{AeadError, CryptoError, ProtocolError};
pub use intent::EncryptionIntent;
pub use key_manager::{KeyManager, KeyMode, KeyObserver};
pub use keys::{EncryptionKey, ItemsKey, KeyParams, RootKey};
pub use manager::{items_key_payload, ProtocolManager};
pub use operator::{
    cost_minimum_for_version, DecryptedParameters, EncryptionParameters, ProtocolOperator,
};
