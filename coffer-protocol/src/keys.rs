//! Key material types: the root key, its public derivation parameters,
//! items-keys, and the resolved key handed to operators.

use crate::error::ProtocolError;
use coffer_model::{ContentType, ItemContent, Payload, ProtocolVersion};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

// ---------------------------------------------------------------------------
// Resolved encryption key
// ---------------------------------------------------------------------------

/// A symmetric key resolved for one encrypt/decrypt call: either the root
/// key's master key or an items-key. Operators only ever see this shape.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    pub key: Vec<u8>,
    /// Legacy data-authentication key (003) when the source key carries one.
    pub auth_key: Option<Vec<u8>>,
    /// Set when this key is an items-key; recorded on encrypted payloads.
    #[zeroize(skip)]
    pub items_key_id: Option<String>,
    #[zeroize(skip)]
    pub version: ProtocolVersion,
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("items_key_id", &self.items_key_id)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Root key
// ---------------------------------------------------------------------------

/// The password-derived key pair: 32 bytes of encryption material and
/// 32 bytes of server authentication material. Never leaves the client;
/// compared in constant time; zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RootKey {
    master_key: Vec<u8>,
    server_password: Vec<u8>,
    data_authentication_key: Option<Vec<u8>>,
    #[zeroize(skip)]
    version: ProtocolVersion,
}

impl RootKey {
    pub fn new(
        master_key: Vec<u8>,
        server_password: Vec<u8>,
        data_authentication_key: Option<Vec<u8>>,
        version: ProtocolVersion,
    ) -> Self {
        Self {
            master_key,
            server_password,
            data_authentication_key,
            version,
        }
    }

    pub fn master_key(&self) -> &[u8] {
        &self.master_key
    }

    /// Hex form sent to the server in place of the raw password.
    pub fn server_password_hex(&self) -> String {
        hex::encode(&self.server_password)
    }

    pub fn data_authentication_key(&self) -> Option<&[u8]> {
        self.data_authentication_key.as_deref()
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn to_encryption_key(&self) -> EncryptionKey {
        EncryptionKey {
            key: self.master_key.clone(),
            auth_key: self.data_authentication_key.clone(),
            items_key_id: None,
            version: self.version,
        }
    }

    /// Portable JSON form used only for at-rest wrapping under a passcode.
    pub fn to_portable_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("master_key".into(), Value::String(hex::encode(&self.master_key)));
        map.insert(
            "server_password".into(),
            Value::String(hex::encode(&self.server_password)),
        );
        if let Some(dak) = &self.data_authentication_key {
            map.insert(
                "data_authentication_key".into(),
                Value::String(hex::encode(dak)),
            );
        }
        map.insert(
            "version".into(),
            Value::String(self.version.as_str().to_string()),
        );
        Value::Object(map)
    }

    pub fn from_portable_value(value: &Value) -> Result<Self, ProtocolError> {
        let get_hex = |key: &str| -> Result<Option<Vec<u8>>, ProtocolError> {
            match value.get(key).and_then(|v| v.as_str()) {
                Some(s) => hex::decode(s)
                    .map(Some)
                    .map_err(|_| ProtocolError::Serialization(format!("bad hex in {}", key))),
                None => Ok(None),
            }
        };
        let master_key = get_hex("master_key")?
            .ok_or_else(|| ProtocolError::Serialization("missing master_key".into()))?;
        let server_password = get_hex("server_password")?
            .ok_or_else(|| ProtocolError::Serialization("missing server_password".into()))?;
        let data_authentication_key = get_hex("data_authentication_key")?;
        let version = value
            .get("version")
            .and_then(|v| v.as_str())
            .and_then(ProtocolVersion::from_tag)
            .ok_or_else(|| ProtocolError::Serialization("missing version".into()))?;
        Ok(Self {
            master_key,
            server_password,
            data_authentication_key,
            version,
        })
    }
}

impl PartialEq for RootKey {
    fn eq(&self, other: &Self) -> bool {
        let dak_eq = match (&self.data_authentication_key, &other.data_authentication_key) {
            (Some(a), Some(b)) => a.ct_eq(b).into(),
            (None, None) => true,
            _ => false,
        };
        bool::from(self.master_key.ct_eq(&other.master_key))
            & bool::from(self.server_password.ct_eq(&other.server_password))
            & dak_eq
            & (self.version == other.version)
    }
}

impl Eq for RootKey {}

impl fmt::Debug for RootKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootKey")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Key params
// ---------------------------------------------------------------------------

/// Public parameters needed to re-derive the root key from a password.
/// Version-specialized so that field misuse (a 004 cost, a missing legacy
/// cost) cannot be represented.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyParams {
    V001 {
        identifier: String,
        pw_cost: u32,
        pw_nonce: String,
    },
    V002 {
        identifier: String,
        pw_cost: u32,
        pw_nonce: String,
    },
    V003 {
        identifier: String,
        pw_cost: u32,
        pw_nonce: String,
    },
    V004 {
        identifier: String,
        /// The seed mixed into the deterministic salt.
        pw_nonce: String,
    },
}

/// The flat wire shape of key params.
#[derive(Serialize, Deserialize)]
struct RawKeyParams {
    identifier: String,
    pw_nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pw_cost: Option<u32>,
    version: String,
}

impl KeyParams {
    pub fn version(&self) -> ProtocolVersion {
        match self {
            KeyParams::V001 { .. } => ProtocolVersion::V001,
            KeyParams::V002 { .. } => ProtocolVersion::V002,
            KeyParams::V003 { .. } => ProtocolVersion::V003,
            KeyParams::V004 { .. } => ProtocolVersion::V004,
        }
    }

    pub fn identifier(&self) -> &str {
        match self {
            KeyParams::V001 { identifier, .. }
            | KeyParams::V002 { identifier, .. }
            | KeyParams::V003 { identifier, .. }
            | KeyParams::V004 { identifier, .. } => identifier,
        }
    }

    pub fn pw_nonce(&self) -> &str {
        match self {
            KeyParams::V001 { pw_nonce, .. }
            | KeyParams::V002 { pw_nonce, .. }
            | KeyParams::V003 { pw_nonce, .. }
            | KeyParams::V004 { pw_nonce, .. } => pw_nonce,
        }
    }

    pub fn pw_cost(&self) -> Option<u32> {
        match self {
            KeyParams::V001 { pw_cost, .. }
            | KeyParams::V002 { pw_cost, .. }
            | KeyParams::V003 { pw_cost, .. } => Some(*pw_cost),
            KeyParams::V004 { .. } => None,
        }
    }

    pub fn to_value(&self) -> Value {
        let raw = RawKeyParams {
            identifier: self.identifier().to_string(),
            pw_nonce: self.pw_nonce().to_string(),
            pw_cost: self.pw_cost(),
            version: self.version().as_str().to_string(),
        };
        serde_json::to_value(raw).unwrap_or(Value::Null)
    }

    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let raw: RawKeyParams = serde_json::from_value(value.clone())?;
        let version = ProtocolVersion::from_tag(&raw.version)
            .ok_or_else(|| ProtocolError::UnsupportedVersion(raw.version.clone()))?;
        let cost = || {
            raw.pw_cost
                .ok_or_else(|| ProtocolError::Serialization("missing pw_cost".into()))
        };
        Ok(match version {
            ProtocolVersion::V001 => KeyParams::V001 {
                identifier: raw.identifier,
                pw_cost: cost()?,
                pw_nonce: raw.pw_nonce,
            },
            ProtocolVersion::V002 => KeyParams::V002 {
                identifier: raw.identifier,
                pw_cost: cost()?,
                pw_nonce: raw.pw_nonce,
            },
            ProtocolVersion::V003 => KeyParams::V003 {
                identifier: raw.identifier,
                pw_cost: cost()?,
                pw_nonce: raw.pw_nonce,
            },
            ProtocolVersion::V004 => KeyParams::V004 {
                identifier: raw.identifier,
                pw_nonce: raw.pw_nonce,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Items-key
// ---------------------------------------------------------------------------

/// A symmetric key stored as a regular item of type `SN|ItemsKey`. Its own
/// payload is always encrypted under the root key; it in turn wraps per-item
/// content keys.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ItemsKey {
    #[zeroize(skip)]
    pub uuid: String,
    pub items_key: Vec<u8>,
    pub data_authentication_key: Option<Vec<u8>>,
    #[zeroize(skip)]
    pub is_default: bool,
    #[zeroize(skip)]
    pub version: ProtocolVersion,
}

impl ItemsKey {
    /// Reads an items-key out of a decrypted payload.
    pub fn from_payload(payload: &Payload) -> Result<Self, ProtocolError> {
        if payload.content_type() != &ContentType::ItemsKey {
            return Err(ProtocolError::Serialization(
                "payload is not an items-key".into(),
            ));
        }
        let content = payload
            .decrypted_content()
            .ok_or(ProtocolError::MissingContent)?;
        let get_str = |key: &str| content.extra.get(key).and_then(|v| v.as_str());

        let items_key = get_str("items_key")
            .and_then(|s| hex::decode(s).ok())
            .ok_or_else(|| ProtocolError::Serialization("missing items_key".into()))?;
        let data_authentication_key = get_str("data_authentication_key")
            .map(|s| {
                hex::decode(s)
                    .map_err(|_| ProtocolError::Serialization("bad data_authentication_key".into()))
            })
            .transpose()?;
        let version = get_str("version")
            .and_then(ProtocolVersion::from_tag)
            .unwrap_or(ProtocolVersion::LATEST);
        let is_default = content
            .extra
            .get("is_default")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Ok(Self {
            uuid: payload.uuid().to_string(),
            items_key,
            data_authentication_key,
            is_default,
            version,
        })
    }

    /// The decrypted content this key serializes to.
    pub fn to_content(&self) -> ItemContent {
        let mut content = ItemContent::new();
        content
            .extra
            .insert("items_key".into(), Value::String(hex::encode(&self.items_key)));
        if let Some(dak) = &self.data_authentication_key {
            content
                .extra
                .insert("data_authentication_key".into(), Value::String(hex::encode(dak)));
        }
        content.extra.insert(
            "version".into(),
            Value::String(self.version.as_str().to_string()),
        );
        content
            .extra
            .insert("is_default".into(), Value::Bool(self.is_default));
        content
    }

    pub fn to_encryption_key(&self) -> EncryptionKey {
        EncryptionKey {
            key: self.items_key.clone(),
            auth_key: self.data_authentication_key.clone(),
            items_key_id: Some(self.uuid.clone()),
            version: self.version,
        }
    }
}

impl fmt::Debug for ItemsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemsKey")
            .field("uuid", &self.uuid)
            .field("is_default", &self.is_default)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_key_equality_is_structural() {
        let a = RootKey::new(vec![1; 32], vec![2; 32], None, ProtocolVersion::V004);
        let b = RootKey::new(vec![1; 32], vec![2; 32], None, ProtocolVersion::V004);
        let c = RootKey::new(vec![9; 32], vec![2; 32], None, ProtocolVersion::V004);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn root_key_version_participates_in_equality() {
        let a = RootKey::new(vec![1; 32], vec![2; 32], None, ProtocolVersion::V003);
        let b = RootKey::new(vec![1; 32], vec![2; 32], None, ProtocolVersion::V004);
        assert_ne!(a, b);
    }

    #[test]
    fn root_key_portable_roundtrip() {
        let key = RootKey::new(
            vec![1; 32],
            vec![2; 32],
            Some(vec![3; 32]),
            ProtocolVersion::V003,
        );
        let restored = RootKey::from_portable_value(&key.to_portable_value()).unwrap();
        assert_eq!(key, restored);
    }

    #[test]
    fn key_params_wire_roundtrip() {
        let params = KeyParams::V003 {
            identifier: "hello@test.com".into(),
            pw_cost: 110000,
            pw_nonce: "abc".into(),
        };
        let restored = KeyParams::from_value(&params.to_value()).unwrap();
        assert_eq!(params, restored);

        let v4 = KeyParams::V004 {
            identifier: "hello@test.com".into(),
            pw_nonce: "seed".into(),
        };
        let value = v4.to_value();
        assert!(value.get("pw_cost").is_none());
        assert_eq!(KeyParams::from_value(&value).unwrap(), v4);
    }

    #[test]
    fn legacy_params_require_cost() {
        let value = serde_json::json!({
            "identifier": "a@b.c",
            "pw_nonce": "n",
            "version": "002"
        });
        assert!(KeyParams::from_value(&value).is_err());
    }

    #[test]
    fn items_key_content_roundtrip() {
        let key = ItemsKey {
            uuid: "ik-1".into(),
            items_key: vec![7; 32],
            data_authentication_key: None,
            is_default: true,
            version: ProtocolVersion::V004,
        };
        let payload = Payload::from_content("ik-1".into(), ContentType::ItemsKey, key.to_content());
        let restored = ItemsKey::from_payload(&payload).unwrap();
        assert_eq!(restored.items_key, key.items_key);
        assert!(restored.is_default);
        assert_eq!(restored.version, ProtocolVersion::V004);
    }

    #[test]
    fn debug_output_redacts_material() {
        let key = RootKey::new(vec![0xAA; 32], vec![0xBB; 32], None, ProtocolVersion::V004);
        let rendered = format!("{:?}", key);
        assert!(!rendered.contains("aa"));
        assert!(!rendered.contains("AA"));
    }
}
