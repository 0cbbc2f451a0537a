//! Error types for the protocol crate.
//!
//! AEAD and composition failures are uniform: one opaque error regardless of
//! which check failed, so error shape leaks nothing about the ciphertext.

use coffer_model::ModelError;
use std::fmt;

/// Uniform authenticated-decryption failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AeadError;

impl fmt::Display for AeadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "decryption failed")
    }
}

impl std::error::Error for AeadError {}

/// Failures inside the crypto provider other than authentication.
#[derive(Debug)]
pub enum CryptoError {
    InvalidKeyLength,
    InvalidNonceLength,
    Kdf(String),
    Encoding(String),
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidKeyLength => write!(f, "invalid key length"),
            Self::InvalidNonceLength => write!(f, "invalid nonce length"),
            Self::Kdf(msg) => write!(f, "kdf failure: {}", msg),
            Self::Encoding(msg) => write!(f, "encoding failure: {}", msg),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Top-level protocol error.
#[derive(Debug)]
pub enum ProtocolError {
    /// An encrypting intent was requested without a usable key.
    MissingKey,
    /// The payload carries no content to operate on.
    MissingContent,
    /// The wire string's version tag is unknown.
    UnsupportedVersion(String),
    /// The operator for this version does not support the operation.
    UnsupportedOperation(&'static str),
    /// The wire string's structure is invalid.
    MalformedWire(String),
    /// Decryption failed on the caller-driven (throwing) path.
    DecryptionFailed,
    Crypto(CryptoError),
    Model(ModelError),
    Serialization(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingKey => write!(f, "no key available for encrypting intent"),
            Self::MissingContent => write!(f, "payload has no content"),
            Self::UnsupportedVersion(tag) => write!(f, "unsupported protocol version: {}", tag),
            Self::UnsupportedOperation(op) => {
                write!(f, "operation not supported by this version: {}", op)
            }
            Self::MalformedWire(msg) => write!(f, "malformed wire string: {}", msg),
            Self::DecryptionFailed => write!(f, "decryption failed"),
            Self::Crypto(e) => write!(f, "crypto: {}", e),
            Self::Model(e) => write!(f, "model: {}", e),
            Self::Serialization(msg) => write!(f, "serialization: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<CryptoError> for ProtocolError {
    fn from(e: CryptoError) -> Self {
        Self::Crypto(e)
    }
}

impl From<ModelError> for ProtocolError {
    fn from(e: ModelError) -> Self {
        Self::Model(e)
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
