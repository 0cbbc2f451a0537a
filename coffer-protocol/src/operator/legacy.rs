//! Legacy operators (001–003): PBKDF2-HMAC-SHA512 key derivation and the
//! AES-256-CBC + HMAC-SHA256 composition.
//!
//! These are read paths for historical data. The write paths remain so the
//! round-trip contract stays testable, but new data is never written below
//! version 004.

use super::{DecryptedParameters, EncryptionParameters};
use crate::crypto::CryptoProvider;
use crate::error::ProtocolError;
use crate::keys::{EncryptionKey, KeyParams, RootKey};
use crate::wire;
use coffer_model::{ItemContent, Payload, ProtocolVersion};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// Per-item random key material: 32 bytes encryption + 32 bytes auth.
const ITEM_KEY_BYTES: usize = 64;

/// PBKDF2 output: master + server password (+ data auth key on 003).
const DERIVED_BYTES_2KEY: usize = 64;
const DERIVED_BYTES_3KEY: usize = 96;

// ---------------------------------------------------------------------------
// Shared machinery
// ---------------------------------------------------------------------------

struct LegacyOperator {
    crypto: Arc<dyn CryptoProvider>,
    version: ProtocolVersion,
}

impl LegacyOperator {
    fn new(crypto: Arc<dyn CryptoProvider>, version: ProtocolVersion) -> Self {
        Self { crypto, version }
    }

    fn cost_floor(&self) -> u32 {
        super::cost_minimum_for_version(self.version)
    }

    /// The PBKDF2 salt string: hex SHA-256 of the identity material,
    /// truncated to 32 chars. 003 additionally commits to the cost.
    fn salt(&self, identifier: &str, pw_nonce: &str, cost: u32) -> String {
        let preimage = match self.version {
            ProtocolVersion::V003 => format!("{}:003:{}:{}", identifier, cost, pw_nonce),
            _ => format!("{}:{}", identifier, pw_nonce),
        };
        let mut hash = self.crypto.sha256_hex(preimage.as_bytes());
        hash.truncate(32);
        hash
    }

    fn derive(
        &self,
        password: &str,
        identifier: &str,
        pw_nonce: &str,
        cost: u32,
    ) -> Result<RootKey, ProtocolError> {
        let salt = self.salt(identifier, pw_nonce, cost);
        let (len, has_auth_key) = match self.version {
            ProtocolVersion::V003 => (DERIVED_BYTES_3KEY, true),
            _ => (DERIVED_BYTES_2KEY, false),
        };
        let derived = Zeroizing::new(self.crypto.pbkdf2_sha512(
            password.as_bytes(),
            salt.as_bytes(),
            cost,
            len,
        )?);
        let master_key = derived[..wire::KEY_BYTES].to_vec();
        let server_password = derived[wire::KEY_BYTES..wire::KEY_BYTES * 2].to_vec();
        let data_authentication_key =
            has_auth_key.then(|| derived[wire::KEY_BYTES * 2..].to_vec());
        Ok(RootKey::new(
            master_key,
            server_password,
            data_authentication_key,
            self.version,
        ))
    }

    fn create_root_key(
        &self,
        identifier: &str,
        password: &str,
    ) -> Result<(RootKey, KeyParams), ProtocolError> {
        let pw_nonce = hex::encode(self.crypto.random_bytes(32));
        let cost = self.cost_floor();
        let key = self.derive(password, identifier, &pw_nonce, cost)?;
        let params = match self.version {
            ProtocolVersion::V001 => KeyParams::V001 {
                identifier: identifier.to_string(),
                pw_cost: cost,
                pw_nonce,
            },
            ProtocolVersion::V002 => KeyParams::V002 {
                identifier: identifier.to_string(),
                pw_cost: cost,
                pw_nonce,
            },
            _ => KeyParams::V003 {
                identifier: identifier.to_string(),
                pw_cost: cost,
                pw_nonce,
            },
        };
        Ok((key, params))
    }

    fn compute_root_key(
        &self,
        password: &str,
        key_params: &KeyParams,
    ) -> Result<RootKey, ProtocolError> {
        if key_params.version() != self.version {
            return Err(ProtocolError::UnsupportedVersion(
                key_params.version().as_str().to_string(),
            ));
        }
        let cost = key_params
            .pw_cost()
            .ok_or_else(|| ProtocolError::Serialization("missing pw_cost".into()))?;
        self.derive(password, key_params.identifier(), key_params.pw_nonce(), cost)
    }

    /// Seals one component: CBC encrypt, then HMAC over the colon-joined
    /// auth string. A `None` auth key embeds an empty tag (the enc_item_key
    /// wrap on 001/002, whose integrity rides on the content HMAC).
    fn seal_component(
        &self,
        uuid: &str,
        encryption_key: &[u8],
        auth_key: Option<&[u8]>,
        plaintext: &[u8],
    ) -> Result<(String, String), ProtocolError> {
        let iv = self.crypto.random_bytes(wire::LEGACY_IV_BYTES);
        let ciphertext = self.crypto.aes_cbc_encrypt(encryption_key, &iv, plaintext)?;
        let iv_hex = hex::encode(&iv);
        let ciphertext_b64 = {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD.encode(&ciphertext)
        };
        let string_to_auth =
            wire::legacy_string_to_auth(self.version, uuid, &iv_hex, &ciphertext_b64);
        let auth_hash = match auth_key {
            Some(key) => self.crypto.hmac_sha256_hex(key, string_to_auth.as_bytes()),
            None => String::new(),
        };
        let encoded = wire::encode_legacy(self.version, &auth_hash, uuid, &iv, &ciphertext);
        Ok((encoded, auth_hash))
    }

    /// Opens one component: identity check, constant-time HMAC check, CBC
    /// decrypt. Every failure is uniform.
    fn open_component(
        &self,
        expected_uuid: &str,
        encryption_key: &[u8],
        auth_key: Option<&[u8]>,
        encoded: &str,
    ) -> Result<Vec<u8>, ProtocolError> {
        let parsed = wire::decode_legacy(encoded)?;
        if parsed.version != self.version || parsed.uuid != expected_uuid {
            return Err(ProtocolError::DecryptionFailed);
        }
        if let Some(key) = auth_key {
            let iv_hex = hex::encode(&parsed.iv);
            let ciphertext_b64 = {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD.encode(&parsed.ciphertext)
            };
            let string_to_auth =
                wire::legacy_string_to_auth(self.version, &parsed.uuid, &iv_hex, &ciphertext_b64);
            let expected = self.crypto.hmac_sha256_hex(key, string_to_auth.as_bytes());
            let matches: bool = expected
                .as_bytes()
                .ct_eq(parsed.auth_hash.as_bytes())
                .into();
            if !matches {
                return Err(ProtocolError::DecryptionFailed);
            }
        }
        self.crypto
            .aes_cbc_decrypt(encryption_key, &parsed.iv, &parsed.ciphertext)
            .map_err(|_| ProtocolError::DecryptionFailed)
    }

    fn generate_encryption_parameters(
        &self,
        payload: &Payload,
        key: &EncryptionKey,
    ) -> Result<EncryptionParameters, ProtocolError> {
        let content = payload
            .decrypted_content()
            .ok_or(ProtocolError::MissingContent)?;
        let plaintext = serde_json::to_vec(&content.to_value())?;

        let item_key = Zeroizing::new(self.crypto.random_bytes(ITEM_KEY_BYTES));
        let (ek, ak) = item_key.split_at(wire::KEY_BYTES);

        let (content_string, content_auth) =
            self.seal_component(payload.uuid(), ek, Some(ak), &plaintext)?;

        // 003 authenticates the key wrap with the root's data auth key;
        // 001/002 wrap without a tag of their own.
        let wrap_auth_key = match self.version {
            ProtocolVersion::V003 => Some(
                key.auth_key
                    .as_deref()
                    .ok_or(ProtocolError::MissingKey)?,
            ),
            _ => None,
        };
        let item_key_hex = Zeroizing::new(hex::encode(item_key.as_slice()).into_bytes());
        let (enc_item_key, _) =
            self.seal_component(payload.uuid(), &key.key, wrap_auth_key, &item_key_hex)?;

        let auth_hash = match self.version {
            ProtocolVersion::V003 => None,
            _ => Some(content_auth),
        };
        Ok(EncryptionParameters {
            content: content_string,
            enc_item_key,
            items_key_id: None,
            auth_hash,
        })
    }

    fn generate_decrypted_parameters(
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

        let wrap_auth_key = match self.version {
            ProtocolVersion::V003 => {
                Some(key.auth_key.as_deref().ok_or(ProtocolError::MissingKey)?)
            }
            _ => None,
        };
        let item_key_hex = Zeroizing::new(self.open_component(
            payload.uuid(),
            &key.key,
            wrap_auth_key,
            enc_item_key,
        )?);
        let item_key = Zeroizing::new(
            hex::decode(item_key_hex.as_slice()).map_err(|_| ProtocolError::DecryptionFailed)?,
        );
        if item_key.len() != ITEM_KEY_BYTES {
            return Err(ProtocolError::DecryptionFailed);
        }
        let (ek, ak) = item_key.split_at(wire::KEY_BYTES);

        let plaintext = self.open_component(payload.uuid(), ek, Some(ak), content_string)?;
        let value: serde_json::Value = serde_json::from_slice(&plaintext)?;
        Ok(ItemContent::from_value(&value)?)
    }
}

// ---------------------------------------------------------------------------
// Versioned fronts
// ---------------------------------------------------------------------------

macro_rules! legacy_front {
    ($name:ident, $version:expr) => {
        pub struct $name {
            inner: LegacyOperator,
        }

        impl $name {
            pub fn new(crypto: Arc<dyn CryptoProvider>) -> Self {
                Self {
                    inner: LegacyOperator::new(crypto, $version),
                }
            }

            pub fn create_root_key(
                &self,
                identifier: &str,
                password: &str,
            ) -> Result<(RootKey, KeyParams), ProtocolError> {
                self.inner.create_root_key(identifier, password)
            }

            pub fn compute_root_key(
                &self,
                password: &str,
                key_params: &KeyParams,
            ) -> Result<RootKey, ProtocolError> {
                self.inner.compute_root_key(password, key_params)
            }

            pub fn generate_encryption_parameters(
                &self,
                payload: &Payload,
                key: &EncryptionKey,
            ) -> Result<EncryptionParameters, ProtocolError> {
                self.inner.generate_encryption_parameters(payload, key)
            }

            pub fn generate_decrypted_parameters(
                &self,
                payload: &Payload,
                key: &EncryptionKey,
            ) -> DecryptedParameters {
                self.inner.generate_decrypted_parameters(payload, key)
            }
        }
    };
}

legacy_front!(OperatorV001, ProtocolVersion::V001);
legacy_front!(OperatorV002, ProtocolVersion::V002);
legacy_front!(OperatorV003, ProtocolVersion::V003);
