//! Wire formats for encrypted content strings.
//!
//! 004:  `"004:" || b64(nonce24) || ":" || b64(ciphertext||tag16) || ":" || b64(aad_json)`
//! ≤003: `"<ver>:" || auth_hash_hex || ":" || uuid || ":" || iv_hex || ":" || b64(ciphertext)`
//!
//! Decoding is strict: wrong component counts, bad encodings, or undersized
//! components all fail before any key material is touched.

use crate::error::ProtocolError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use coffer_model::ProtocolVersion;

/// 004 item nonce size (AES-GCM with long nonce).
pub const NONCE_BYTES: usize = 24;

/// AEAD tag size appended to every GCM ciphertext.
pub const TAG_BYTES: usize = 16;

/// Legacy CBC initialization vector size.
pub const LEGACY_IV_BYTES: usize = 16;

/// Symmetric key size across all versions.
pub const KEY_BYTES: usize = 32;

// ---------------------------------------------------------------------------
// 004
// ---------------------------------------------------------------------------

/// Parsed components of a 004 wire string.
#[derive(Clone, Debug, PartialEq)]
pub struct Wire004 {
    pub nonce: Vec<u8>,
    /// Ciphertext with the 16-byte tag appended.
    pub ciphertext: Vec<u8>,
    /// The AAD bytes the encryptor bound (embedded for transparency; the
    /// decryptor authenticates against locally recomputed AAD).
    pub aad: Vec<u8>,
}

pub fn encode_004(nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> String {
    format!(
        "{}:{}:{}:{}",
        ProtocolVersion::V004.as_str(),
        BASE64.encode(nonce),
        BASE64.encode(ciphertext),
        BASE64.encode(aad)
    )
}

pub fn decode_004(s: &str) -> Result<Wire004, ProtocolError> {
    let components: Vec<&str> = s.split(':').collect();
    if components.len() != 4 {
        return Err(ProtocolError::MalformedWire(format!(
            "expected 4 components, got {}",
            components.len()
        )));
    }
    if components[0] != ProtocolVersion::V004.as_str() {
        return Err(ProtocolError::UnsupportedVersion(components[0].to_string()));
    }
    let decode = |part: &str, what: &str| {
        BASE64
            .decode(part)
            .map_err(|_| ProtocolError::MalformedWire(format!("bad base64 in {}", what)))
    };
    let nonce = decode(components[1], "nonce")?;
    if nonce.len() != NONCE_BYTES {
        return Err(ProtocolError::MalformedWire("bad nonce length".into()));
    }
    let ciphertext = decode(components[2], "ciphertext")?;
    if ciphertext.len() < TAG_BYTES {
        return Err(ProtocolError::MalformedWire("ciphertext too short".into()));
    }
    let aad = decode(components[3], "aad")?;
    Ok(Wire004 {
        nonce,
        ciphertext,
        aad,
    })
}

// ---------------------------------------------------------------------------
// Legacy (001–003)
// ---------------------------------------------------------------------------

/// Parsed components of a legacy wire string.
#[derive(Clone, Debug, PartialEq)]
pub struct LegacyWire {
    pub version: ProtocolVersion,
    /// HMAC-SHA256 hex tag over [`legacy_string_to_auth`]. Empty when the
    /// component carries its authentication elsewhere.
    pub auth_hash: String,
    pub uuid: String,
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// The exact string the legacy HMAC authenticates.
pub fn legacy_string_to_auth(
    version: ProtocolVersion,
    uuid: &str,
    iv_hex: &str,
    ciphertext_b64: &str,
) -> String {
    format!("{}:{}:{}:{}", version.as_str(), uuid, iv_hex, ciphertext_b64)
}

pub fn encode_legacy(
    version: ProtocolVersion,
    auth_hash: &str,
    uuid: &str,
    iv: &[u8],
    ciphertext: &[u8],
) -> String {
    format!(
        "{}:{}:{}:{}:{}",
        version.as_str(),
        auth_hash,
        uuid,
        hex::encode(iv),
        BASE64.encode(ciphertext)
    )
}

pub fn decode_legacy(s: &str) -> Result<LegacyWire, ProtocolError> {
    let components: Vec<&str> = s.split(':').collect();
    if components.len() != 5 {
        return Err(ProtocolError::MalformedWire(format!(
            "expected 5 components, got {}",
            components.len()
        )));
    }
    let version = ProtocolVersion::from_tag(components[0])
        .filter(|v| *v != ProtocolVersion::V004)
        .ok_or_else(|| ProtocolError::UnsupportedVersion(components[0].to_string()))?;
    let iv = hex::decode(components[3])
        .map_err(|_| ProtocolError::MalformedWire("bad iv hex".into()))?;
    if iv.len() != LEGACY_IV_BYTES {
        return Err(ProtocolError::MalformedWire("bad iv length".into()));
    }
    let ciphertext = BASE64
        .decode(components[4])
        .map_err(|_| ProtocolError::MalformedWire("bad base64 ciphertext".into()))?;
    Ok(LegacyWire {
        version,
        auth_hash: components[1].to_string(),
        uuid: components[2].to_string(),
        iv,
        ciphertext,
    })
}
