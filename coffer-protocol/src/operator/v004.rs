//! The 004 operator: Argon2id root keys, AES-256-GCM item encryption with
//! identity-bound AAD, and items-key wrapping of per-item content keys.

use super::{DecryptedParameters, EncryptionParameters};
use crate::crypto::CryptoProvider;
use crate::error::ProtocolError;
use crate::keys::{EncryptionKey, ItemsKey, KeyParams, RootKey};
use crate::wire;
use coffer_model::{ItemContent, Payload, ProtocolVersion};
use serde_json::json;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Argon2id memory cost: 64 MiB.
const ARGON2_MEMORY_KIB: u32 = 65_536;

/// Argon2id iteration count; also the version's advertised cost floor.
const ARGON2_ITERATIONS: u32 = 5;

/// Derived salt length fed to Argon2id.
const SALT_BYTES: usize = 16;

/// Derived key material: 32 bytes master, 32 bytes server password.
const DERIVED_BYTES: usize = 64;

pub struct OperatorV004 {
    crypto: Arc<dyn CryptoProvider>,
}

impl OperatorV004 {
    pub fn new(crypto: Arc<dyn CryptoProvider>) -> Self {
        Self { crypto }
    }

    pub fn create_root_key(
        &self,
        identifier: &str,
        password: &str,
    ) -> Result<(RootKey, KeyParams), ProtocolError> {
        let seed = hex::encode(self.crypto.random_bytes(32));
        let key = self.derive_root_key(password, identifier, &seed)?;
        let params = KeyParams::V004 {
            identifier: identifier.to_string(),
            pw_nonce: seed,
        };
        Ok((key, params))
    }

    pub fn compute_root_key(
        &self,
        password: &str,
        key_params: &KeyParams,
    ) -> Result<RootKey, ProtocolError> {
        match key_params {
            KeyParams::V004 {
                identifier,
                pw_nonce,
            } => self.derive_root_key(password, identifier, pw_nonce),
            other => Err(ProtocolError::UnsupportedVersion(
                other.version().as_str().to_string(),
            )),
        }
    }

    /// salt = first 16 bytes of SHA-256(identifier ":" seed); the derived
    /// 64 bytes split into master key and server password.
    fn derive_root_key(
        &self,
        password: &str,
        identifier: &str,
        seed: &str,
    ) -> Result<RootKey, ProtocolError> {
        let salt_hex = self
            .crypto
            .sha256_hex(format!("{}:{}", identifier, seed).as_bytes());
        let salt = hex::decode(&salt_hex[..SALT_BYTES * 2])
            .map_err(|_| ProtocolError::Serialization("salt derivation".into()))?;
        let derived = Zeroizing::new(self.crypto.argon2id(
            password.as_bytes(),
            &salt,
            ARGON2_ITERATIONS,
            ARGON2_MEMORY_KIB,
            DERIVED_BYTES,
        )?);
        Ok(RootKey::new(
            derived[..wire::KEY_BYTES].to_vec(),
            derived[wire::KEY_BYTES..].to_vec(),
            None,
            ProtocolVersion::V004,
        ))
    }

    /// A fresh random items-key with its authentication companion. The
    /// caller decides defaultness and maps the payload.
    pub fn create_items_key(&self) -> ItemsKey {
        ItemsKey {
            uuid: self.crypto.generate_uuid(),
            items_key: self.crypto.random_bytes(wire::KEY_BYTES),
            data_authentication_key: Some(self.crypto.random_bytes(wire::KEY_BYTES)),
            is_default: false,
            version: ProtocolVersion::V004,
        }
    }

    /// AAD binds ciphertext to item identity; swapping ciphertexts across
    /// items fails authentication.
    fn aad_bytes(uuid: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({"u": uuid, "v": "004"})).unwrap_or_default()
    }

    pub fn generate_encryption_parameters(
        &self,
        payload: &Payload,
        key: &EncryptionKey,
    ) -> Result<EncryptionParameters, ProtocolError> {
        let content = payload
            .decrypted_content()
            .ok_or(ProtocolError::MissingContent)?;
        let plaintext = serde_json::to_vec(&content.to_value())?;
        let aad = Self::aad_bytes(payload.uuid());

        let content_key = Zeroizing::new(self.crypto.random_bytes(wire::KEY_BYTES));
        let nonce = self.crypto.random_bytes(wire::NONCE_BYTES);
        let ciphertext = self
            .crypto
            .aes_gcm_encrypt(&content_key, &nonce, &plaintext, &aad)?;
        let content_string = wire::encode_004(&nonce, &ciphertext, &aad);

        let key_plaintext = Zeroizing::new(hex::encode(content_key.as_slice()).into_bytes());
        let key_nonce = self.crypto.random_bytes(wire::NONCE_BYTES);
        let key_ciphertext = self
            .crypto
            .aes_gcm_encrypt(&key.key, &key_nonce, &key_plaintext, &aad)?;
        let enc_item_key = wire::encode_004(&key_nonce, &key_ciphertext, &aad);

        Ok(EncryptionParameters {
            content: content_string,
            enc_item_key,
            items_key_id: key.items_key_id.clone(),
            auth_hash: None,
        })
    }

    pub fn generate_decrypted_parameters(
        &self,
        payload: &Payload,
        key: &EncryptionKey,
    ) -> DecryptedParameters {
        let previously = payload.error_decrypting();
        match self.try_decrypt(payload, key) {
            Ok(content) => DecryptedParameters::success(content, previously),
            Err(_) => DecryptedParameters::error(previously),
        }
    }

    fn try_decrypt(
        &self,
        payload: &Payload,
        key: &EncryptionKey,
    ) -> Result<ItemContent, ProtocolError> {
        let content_string = match payload.content() {
            Some(coffer_model::PayloadContent::Encrypted(s)) => s,
            _ => return Err(ProtocolError::MissingContent),
        };
        let enc_item_key = payload
            .enc_item_key()
            .ok_or(ProtocolError::MissingContent)?;

        // The AAD is always recomputed locally; the embedded copy is not
        // trusted for authentication.
        let aad = Self::aad_bytes(payload.uuid());

        let key_wire = wire::decode_004(enc_item_key)?;
        let content_key_hex = Zeroizing::new(
            self.crypto
                .aes_gcm_decrypt(&key.key, &key_wire.nonce, &key_wire.ciphertext, &aad)
                .map_err(|_| ProtocolError::DecryptionFailed)?,
        );
        let content_key = Zeroizing::new(
            hex::decode(content_key_hex.as_slice())
                .map_err(|_| ProtocolError::DecryptionFailed)?,
        );
        if content_key.len() != wire::KEY_BYTES {
            return Err(ProtocolError::DecryptionFailed);
        }

        let content_wire = wire::decode_004(content_string)?;
        let plaintext = self
            .crypto
            .aes_gcm_decrypt(
                &content_key,
                &content_wire.nonce,
                &content_wire.ciphertext,
                &aad,
            )
            .map_err(|_| ProtocolError::DecryptionFailed)?;
        let value: serde_json::Value = serde_json::from_slice(&plaintext)?;
        Ok(ItemContent::from_value(&value)?)
    }
}
