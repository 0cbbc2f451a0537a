//! The crypto provider: every primitive the protocol operators consume.
//!
//! Operators never touch a crypto crate directly; they go through this trait
//! so the primitive set stays auditable and swappable (tests, HSM-backed
//! builds). All functions are pure and synchronous; suspension happens at
//! the sync-engine layer, never here.

mod platform;

pub use platform::PlatformCrypto;

use crate::error::{AeadError, CryptoError};

pub trait CryptoProvider: Send + Sync {
    /// Cryptographically secure random bytes.
    fn random_bytes(&self, len: usize) -> Vec<u8>;

    /// A fresh v4 uuid string.
    fn generate_uuid(&self) -> String;

    /// Lowercase hex SHA-256 digest.
    fn sha256_hex(&self, data: &[u8]) -> String;

    /// HKDF-SHA256 expand-and-extract.
    fn hkdf_sha256(
        &self,
        ikm: &[u8],
        salt: &[u8],
        info: &[u8],
        len: usize,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Argon2id with explicit cost parameters.
    fn argon2id(
        &self,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        memory_kib: u32,
        len: usize,
    ) -> Result<Vec<u8>, CryptoError>;

    /// PBKDF2-HMAC-SHA512, the legacy KDF.
    fn pbkdf2_sha512(
        &self,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        len: usize,
    ) -> Result<Vec<u8>, CryptoError>;

    /// AES-256-GCM seal with a 128-bit tag. Nonce may be 12 or 24 bytes.
    fn aes_gcm_encrypt(
        &self,
        key: &[u8],
        nonce: &[u8],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// AES-256-GCM open. Any failure is the uniform [`AeadError`].
    fn aes_gcm_decrypt(
        &self,
        key: &[u8],
        nonce: &[u8],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, AeadError>;

    /// AES-256-CBC with PKCS7 padding (legacy composition only).
    fn aes_cbc_encrypt(
        &self,
        key: &[u8],
        iv: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    fn aes_cbc_decrypt(&self, key: &[u8], iv: &[u8], ciphertext: &[u8])
        -> Result<Vec<u8>, AeadError>;

    /// Lowercase hex HMAC-SHA256 tag (legacy composition only).
    fn hmac_sha256_hex(&self, key: &[u8], message: &[u8]) -> String;
}
