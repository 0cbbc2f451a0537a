//! The protocol manager: routes payloads by version and intent to the right
//! operator, memoizing one operator per version.

use crate::crypto::CryptoProvider;
use crate::error::ProtocolError;
use crate::intent::EncryptionIntent;
use crate::key_manager::KeyManager;
use crate::keys::{EncryptionKey, ItemsKey, KeyParams, RootKey};
use crate::operator::{DecryptedParameters, ProtocolOperator};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use coffer_model::{
    ContentType, ItemContent, Payload, PayloadContent, PayloadOverride, ProtocolVersion,
    BASE64_PREFIX,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub struct ProtocolManager {
    crypto: Arc<dyn CryptoProvider>,
    keys: Arc<KeyManager>,
    operators: Mutex<HashMap<ProtocolVersion, Arc<ProtocolOperator>>>,
}

impl ProtocolManager {
    pub fn new(crypto: Arc<dyn CryptoProvider>, keys: Arc<KeyManager>) -> Self {
        Self {
            crypto,
            keys,
            operators: Mutex::new(HashMap::new()),
        }
    }

    pub fn key_manager(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub fn crypto(&self) -> &Arc<dyn CryptoProvider> {
        &self.crypto
    }

    /// One operator per version, created on first use.
    pub fn operator_for_version(&self, version: ProtocolVersion) -> Arc<ProtocolOperator> {
        self.operators
            .lock()
            .unwrap()
            .entry(version)
            .or_insert_with(|| {
                Arc::new(ProtocolOperator::for_version(version, self.crypto.clone()))
            })
            .clone()
    }

    fn default_operator(&self) -> Arc<ProtocolOperator> {
        self.operator_for_version(ProtocolVersion::LATEST)
    }

    /// The version tag at the head of the payload's encrypted content.
    pub fn version_for_payload(payload: &Payload) -> Option<ProtocolVersion> {
        payload.version()
    }

    // -----------------------------------------------------------------------
    // Credentials
    // -----------------------------------------------------------------------

    /// Registration path: fresh nonce, latest version.
    pub fn create_root_key(
        &self,
        identifier: &str,
        password: &str,
    ) -> Result<(RootKey, KeyParams), ProtocolError> {
        self.default_operator().create_root_key(identifier, password)
    }

    /// Sign-in path: re-derive from stored params, whichever version they
    /// were written under.
    pub fn compute_root_key(
        &self,
        password: &str,
        key_params: &KeyParams,
    ) -> Result<RootKey, ProtocolError> {
        self.operator_for_version(key_params.version())
            .compute_root_key(password, key_params)
    }

    /// Creates a fresh items-key, installs it as the default, and returns
    /// its dirty payload for mapping and upload.
    pub fn create_new_default_items_key(&self) -> Result<Payload, ProtocolError> {
        let mut items_key = self.default_operator().create_items_key()?;
        items_key.is_default = true;
        let payload = items_key_payload(&items_key);
        self.keys.add_items_key(items_key.clone());
        self.keys.set_default_items_key(&items_key.uuid);
        tracing::info!(uuid = %items_key.uuid, "created default items-key");
        Ok(payload)
    }

    // -----------------------------------------------------------------------
    // Encryption
    // -----------------------------------------------------------------------

    /// Projects a payload for `intent`, selecting the key via the key
    /// manager. See [`Self::payload_by_encrypting_with_key`].
    pub fn payload_by_encrypting(
        &self,
        payload: &Payload,
        intent: EncryptionIntent,
    ) -> Result<Payload, ProtocolError> {
        let key = self.keys.key_to_use_for_encryption(payload);
        self.payload_by_encrypting_with_key(payload, intent, key.as_ref())
    }

    /// Projects a payload for `intent` under an explicit key. The intent
    /// and key presence jointly decide the output format:
    /// encrypting intents with a key produce an encrypted string; `Sync`
    /// without a key produces base64 armor; prefer-encrypted and the
    /// decrypted intents pass the bare object through; anything else
    /// without a key fails with `MissingKey`.
    pub fn payload_by_encrypting_with_key(
        &self,
        payload: &Payload,
        intent: EncryptionIntent,
        key: Option<&EncryptionKey>,
    ) -> Result<Payload, ProtocolError> {
        // Tombstones carry nothing to encrypt; content already in wire form
        // (an error-marked record awaiting its key) travels unchanged.
        if payload.deleted()
            || payload.content().is_none()
            || matches!(payload.content(), Some(PayloadContent::Encrypted(_)))
        {
            return Ok(payload.clone());
        }

        if intent.requires_encryption() {
            match key {
                Some(key) => {
                    let operator = self.operator_for_version(key.version);
                    let params = operator.generate_encryption_parameters(payload, key)?;
                    return Ok(payload.copy_with(PayloadOverride {
                        content: Some(Some(PayloadContent::Encrypted(params.content))),
                        enc_item_key: Some(Some(params.enc_item_key)),
                        items_key_id: Some(params.items_key_id),
                        auth_hash: Some(params.auth_hash),
                        ..Default::default()
                    }));
                }
                None => match intent {
                    EncryptionIntent::Sync => {
                        let content = payload
                            .decrypted_content()
                            .ok_or(ProtocolError::MissingContent)?;
                        let armored = format!(
                            "{}{}",
                            BASE64_PREFIX,
                            BASE64.encode(serde_json::to_vec(&content.to_value())?)
                        );
                        return Ok(payload.copy_with(PayloadOverride {
                            content: Some(Some(PayloadContent::Base64(armored))),
                            ..Default::default()
                        }));
                    }
                    EncryptionIntent::LocalStoragePreferEncrypted => {
                        return Ok(payload.clone());
                    }
                    _ => return Err(ProtocolError::MissingKey),
                },
            }
        }

        // Decrypted intents pass the bare object through.
        Ok(payload.clone())
    }

    // -----------------------------------------------------------------------
    // Decryption
    // -----------------------------------------------------------------------

    /// Decrypts one payload, containing every failure as error- or
    /// waiting-marked derivations.
    pub fn payload_by_decrypting(&self, payload: &Payload) -> Payload {
        match self.decrypt_inner(payload) {
            Ok(decrypted) => decrypted,
            Err(outcome) => outcome,
        }
    }

    /// Caller-driven recovery path: failures surface as errors instead of
    /// error-marked payloads.
    pub fn payload_by_decrypting_throws(&self, payload: &Payload) -> Result<Payload, ProtocolError> {
        let decrypted = self.payload_by_decrypting(payload);
        if decrypted.error_decrypting() {
            return Err(ProtocolError::DecryptionFailed);
        }
        if decrypted.waiting_for_key() {
            return Err(ProtocolError::MissingKey);
        }
        Ok(decrypted)
    }

    /// Bulk decrypt: output order and length mirror the input; per-item
    /// failures are contained unless `throws` is set.
    pub fn payloads_by_decrypting(
        &self,
        payloads: &[Payload],
        throws: bool,
    ) -> Result<Vec<Payload>, ProtocolError> {
        let mut out = Vec::with_capacity(payloads.len());
        for payload in payloads {
            if throws {
                out.push(self.payload_by_decrypting_throws(payload)?);
            } else {
                out.push(self.payload_by_decrypting(payload));
            }
        }
        Ok(out)
    }

    fn decrypt_inner(&self, payload: &Payload) -> Result<Payload, Payload> {
        let content = match payload.content() {
            // Nothing to decrypt: tombstones and already-decrypted payloads
            // pass through untouched.
            None | Some(PayloadContent::Decrypted(_)) => return Ok(payload.clone()),
            Some(content) => content,
        };

        match content {
            PayloadContent::Base64(armored) => {
                let decoded = armored
                    .strip_prefix(BASE64_PREFIX)
                    .and_then(|b64| BASE64.decode(b64).ok())
                    .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok())
                    .and_then(|value| ItemContent::from_value(&value).ok());
                match decoded {
                    Some(content) => Ok(payload.copy_with(PayloadOverride {
                        content: Some(Some(PayloadContent::Decrypted(content))),
                        error_decrypting: Some(false),
                        error_decrypting_changed: Some(payload.error_decrypting()),
                        waiting_for_key: Some(false),
                        ..Default::default()
                    })),
                    None => Err(self.error_marked(payload)),
                }
            }
            PayloadContent::Encrypted(s) => {
                let Some(version) = ProtocolVersion::from_encrypted_string(s) else {
                    return Err(self.error_marked(payload));
                };
                let Some(key) = self.keys.key_to_use_for_decryption(payload) else {
                    tracing::debug!(uuid = %payload.uuid(), "payload waiting for key");
                    return Err(payload.copy_with(PayloadOverride {
                        waiting_for_key: Some(true),
                        ..Default::default()
                    }));
                };
                let operator = self.operator_for_version(version);
                let params = operator.generate_decrypted_parameters(payload, &key);
                Ok(self.apply_decrypted_parameters(payload, params))
            }
            PayloadContent::Decrypted(_) => unreachable!("filtered out above"),
        }
    }

    fn apply_decrypted_parameters(
        &self,
        payload: &Payload,
        params: DecryptedParameters,
    ) -> Payload {
        // On failure the encrypted content is kept so the decrypt can be
        // retried (e.g. after the right key arrives).
        let content_override = params
            .content
            .map(|c| Some(Some(PayloadContent::Decrypted(c))))
            .unwrap_or(None);
        payload.copy_with(PayloadOverride {
            content: content_override,
            error_decrypting: Some(params.error_decrypting),
            error_decrypting_changed: Some(params.error_decrypting_changed),
            waiting_for_key: Some(params.waiting_for_key),
            ..Default::default()
        })
    }

    fn error_marked(&self, payload: &Payload) -> Payload {
        payload.copy_with(PayloadOverride {
            error_decrypting: Some(true),
            error_decrypting_changed: Some(!payload.error_decrypting()),
            ..Default::default()
        })
    }
}

/// The dirty payload representing a freshly created items-key.
pub fn items_key_payload(items_key: &ItemsKey) -> Payload {
    Payload::from_content(
        items_key.uuid.clone(),
        ContentType::ItemsKey,
        items_key.to_content(),
    )
    .copy_with(PayloadOverride {
        dirty: Some(true),
        dirtied_at: Some(Some(chrono::Utc::now())),
        ..Default::default()
    })
}
