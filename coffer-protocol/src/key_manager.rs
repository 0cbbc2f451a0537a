//! The key manager: owns the root key and the items-key set, selects the
//! key for any encrypt/decrypt call, and wraps the root key at rest under
//! an optional app-level passcode.

use crate::crypto::CryptoProvider;
use crate::error::ProtocolError;
use crate::keys::{EncryptionKey, ItemsKey, RootKey};
use coffer_model::{ContentType, Payload};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Which key material is currently resident.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyMode {
    /// No account and no passcode.
    RootKeyNone,
    /// Account root key, unwrapped at rest.
    RootKeyOnly,
    /// Passcode wrapper without an account root key.
    WrapperOnly,
    /// Account root key, wrapped at rest by the passcode.
    RootKeyPlusWrapper,
}

impl fmt::Display for KeyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyMode::RootKeyNone => write!(f, "ROOT_KEY_NONE"),
            KeyMode::RootKeyOnly => write!(f, "ROOT_KEY_ONLY"),
            KeyMode::WrapperOnly => write!(f, "WRAPPER_ONLY"),
            KeyMode::RootKeyPlusWrapper => write!(f, "ROOT_KEY_PLUS_WRAPPER"),
        }
    }
}

/// Notified when key material changes.
pub trait KeyObserver: Send + Sync {
    fn items_key_added(&self, key: &ItemsKey);
    fn root_key_changed(&self) {}
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct PasscodeWrapper {
    wrapping_key: Vec<u8>,
    salt: Vec<u8>,
}

/// Passcode stretching parameters mirror the 004 root-key costs.
const WRAPPER_ITERATIONS: u32 = 5;
const WRAPPER_MEMORY_KIB: u32 = 65_536;
const WRAPPER_SALT_BYTES: usize = 16;
const WRAPPER_NONCE_BYTES: usize = 12;

pub struct KeyManager {
    crypto: Arc<dyn CryptoProvider>,
    root_key: RwLock<Option<RootKey>>,
    wrapper: RwLock<Option<PasscodeWrapper>>,
    items_keys: RwLock<HashMap<String, ItemsKey>>,
    default_items_key_id: RwLock<Option<String>>,
    observers: Mutex<Vec<(String, Arc<dyn KeyObserver>)>>,
}

impl KeyManager {
    pub fn new(crypto: Arc<dyn CryptoProvider>) -> Self {
        Self {
            crypto,
            root_key: RwLock::new(None),
            wrapper: RwLock::new(None),
            items_keys: RwLock::new(HashMap::new()),
            default_items_key_id: RwLock::new(None),
            observers: Mutex::new(Vec::new()),
        }
    }

    // -----------------------------------------------------------------------
    // Observers
    // -----------------------------------------------------------------------

    pub fn add_key_observer(&self, name: &str, observer: Arc<dyn KeyObserver>) {
        let mut observers = self.observers.lock().unwrap();
        observers.retain(|(n, _)| n != name);
        observers.push((name.to_string(), observer));
    }

    pub fn remove_key_observer(&self, name: &str) {
        self.observers.lock().unwrap().retain(|(n, _)| n != name);
    }

    fn observers_snapshot(&self) -> Vec<Arc<dyn KeyObserver>> {
        self.observers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, o)| o.clone())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Root key
    // -----------------------------------------------------------------------

    pub fn set_root_key(&self, key: RootKey) {
        *self.root_key.write().unwrap() = Some(key);
        for observer in self.observers_snapshot() {
            observer.root_key_changed();
        }
    }

    pub fn root_key(&self) -> Option<RootKey> {
        self.root_key.read().unwrap().clone()
    }

    pub fn has_root_key(&self) -> bool {
        self.root_key.read().unwrap().is_some()
    }

    pub fn key_mode(&self) -> KeyMode {
        let has_root = self.has_root_key();
        let has_wrapper = self.wrapper.read().unwrap().is_some();
        match (has_root, has_wrapper) {
            (false, false) => KeyMode::RootKeyNone,
            (true, false) => KeyMode::RootKeyOnly,
            (false, true) => KeyMode::WrapperOnly,
            (true, true) => KeyMode::RootKeyPlusWrapper,
        }
    }

    /// Drops every secret (sign-out).
    pub fn clear(&self) {
        *self.root_key.write().unwrap() = None;
        *self.wrapper.write().unwrap() = None;
        self.items_keys.write().unwrap().clear();
        *self.default_items_key_id.write().unwrap() = None;
        tracing::info!("key manager cleared");
    }

    // -----------------------------------------------------------------------
    // Passcode wrapper
    // -----------------------------------------------------------------------

    /// Installs an app-level passcode. The wrapping key is stretched with
    /// the same costs as a 004 root key.
    pub fn set_passcode(&self, passcode: &str) -> Result<(), ProtocolError> {
        let salt = self.crypto.random_bytes(WRAPPER_SALT_BYTES);
        let wrapping_key = self.crypto.argon2id(
            passcode.as_bytes(),
            &salt,
            WRAPPER_ITERATIONS,
            WRAPPER_MEMORY_KIB,
            32,
        )?;
        *self.wrapper.write().unwrap() = Some(PasscodeWrapper { wrapping_key, salt });
        Ok(())
    }

    pub fn remove_passcode(&self) {
        *self.wrapper.write().unwrap() = None;
    }

    /// The root key encrypted under the passcode wrapper, as a storage blob.
    pub fn wrapped_root_key(&self) -> Result<Value, ProtocolError> {
        let root = self.root_key().ok_or(ProtocolError::MissingKey)?;
        let wrapper_guard = self.wrapper.read().unwrap();
        let wrapper = wrapper_guard.as_ref().ok_or(ProtocolError::MissingKey)?;

        let plaintext = serde_json::to_vec(&root.to_portable_value())?;
        let nonce = self.crypto.random_bytes(WRAPPER_NONCE_BYTES);
        let ciphertext =
            self.crypto
                .aes_gcm_encrypt(&wrapper.wrapping_key, &nonce, &plaintext, b"root-key")?;

        use base64::Engine;
        Ok(serde_json::json!({
            "salt": hex::encode(&wrapper.salt),
            "nonce": hex::encode(&nonce),
            "ciphertext": base64::engine::general_purpose::STANDARD.encode(&ciphertext),
        }))
    }

    /// Re-derives the wrapping key from `passcode` and the blob's salt,
    /// unwraps the root key, and installs both.
    pub fn unwrap_root_key(&self, passcode: &str, blob: &Value) -> Result<(), ProtocolError> {
        let get = |key: &str| {
            blob.get(key)
                .and_then(|v| v.as_str())
                .ok_or_else(|| ProtocolError::Serialization(format!("missing {}", key)))
        };
        let salt = hex::decode(get("salt")?)
            .map_err(|_| ProtocolError::Serialization("bad salt".into()))?;
        let nonce = hex::decode(get("nonce")?)
            .map_err(|_| ProtocolError::Serialization("bad nonce".into()))?;
        use base64::Engine;
        let ciphertext = base64::engine::general_purpose::STANDARD
            .decode(get("ciphertext")?)
            .map_err(|_| ProtocolError::Serialization("bad ciphertext".into()))?;

        let wrapping_key = self.crypto.argon2id(
            passcode.as_bytes(),
            &salt,
            WRAPPER_ITERATIONS,
            WRAPPER_MEMORY_KIB,
            32,
        )?;
        let plaintext = self
            .crypto
            .aes_gcm_decrypt(&wrapping_key, &nonce, &ciphertext, b"root-key")
            .map_err(|_| ProtocolError::DecryptionFailed)?;
        let value: Value = serde_json::from_slice(&plaintext)?;
        let root = RootKey::from_portable_value(&value)?;

        *self.wrapper.write().unwrap() = Some(PasscodeWrapper { wrapping_key, salt });
        self.set_root_key(root);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Items keys
    // -----------------------------------------------------------------------

    /// Registers an items-key (newly created or decrypted from sync) and
    /// fires observers so waiting payloads get another decryption pass.
    pub fn add_items_key(&self, key: ItemsKey) {
        if key.is_default {
            *self.default_items_key_id.write().unwrap() = Some(key.uuid.clone());
        }
        let notify = key.clone();
        self.items_keys
            .write()
            .unwrap()
            .insert(key.uuid.clone(), key);
        tracing::debug!(uuid = %notify.uuid, is_default = notify.is_default, "items-key added");
        for observer in self.observers_snapshot() {
            observer.items_key_added(&notify);
        }
    }

    pub fn set_default_items_key(&self, uuid: &str) {
        let mut keys = self.items_keys.write().unwrap();
        for key in keys.values_mut() {
            key.is_default = key.uuid == uuid;
        }
        *self.default_items_key_id.write().unwrap() = Some(uuid.to_string());
    }

    pub fn items_key(&self, uuid: &str) -> Option<ItemsKey> {
        self.items_keys.read().unwrap().get(uuid).cloned()
    }

    pub fn default_items_key(&self) -> Option<ItemsKey> {
        let id = self.default_items_key_id.read().unwrap().clone()?;
        self.items_key(&id)
    }

    pub fn items_keys(&self) -> Vec<ItemsKey> {
        self.items_keys.read().unwrap().values().cloned().collect()
    }

    pub fn items_key_count(&self) -> usize {
        self.items_keys.read().unwrap().len()
    }

    // -----------------------------------------------------------------------
    // Key selection
    // -----------------------------------------------------------------------

    /// The key to encrypt `payload` under. Items-key content always goes
    /// under the root key; regular items go under the default items-key,
    /// falling back to the root key for legacy data or the window before
    /// the first items-key exists.
    pub fn key_to_use_for_encryption(&self, payload: &Payload) -> Option<EncryptionKey> {
        if payload.content_type() == &ContentType::ItemsKey {
            return self.root_key().map(|k| k.to_encryption_key());
        }
        if let Some(items_key) = self.default_items_key() {
            return Some(items_key.to_encryption_key());
        }
        self.root_key().map(|k| k.to_encryption_key())
    }

    /// The key to decrypt `payload` with. `None` means the payload must
    /// wait: its items-key has not been downloaded (or no root key is
    /// resident yet).
    pub fn key_to_use_for_decryption(&self, payload: &Payload) -> Option<EncryptionKey> {
        if payload.content_type() == &ContentType::ItemsKey {
            return self.root_key().map(|k| k.to_encryption_key());
        }
        if let Some(items_key_id) = payload.items_key_id() {
            return self.items_key(items_key_id).map(|k| k.to_encryption_key());
        }
        self.root_key().map(|k| k.to_encryption_key())
    }
}
