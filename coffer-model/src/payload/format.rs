//! Protocol version tags and payload formats, derived from content shape.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved prefix for decrypted-but-base64-armored content strings.
pub const BASE64_PREFIX: &str = "000";

/// The 3-character protocol tag at the head of every encrypted string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProtocolVersion {
    V001,
    V002,
    V003,
    V004,
}

impl ProtocolVersion {
    /// The current write target. Older versions are read-only paths.
    pub const LATEST: ProtocolVersion = ProtocolVersion::V004;

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolVersion::V001 => "001",
            ProtocolVersion::V002 => "002",
            ProtocolVersion::V003 => "003",
            ProtocolVersion::V004 => "004",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "001" => Some(ProtocolVersion::V001),
            "002" => Some(ProtocolVersion::V002),
            "003" => Some(ProtocolVersion::V003),
            "004" => Some(ProtocolVersion::V004),
            _ => None,
        }
    }

    /// Reads the version tag off the first 3 bytes of an encrypted string.
    /// The base64 prefix `000` is reserved and never a version.
    pub fn from_encrypted_string(s: &str) -> Option<Self> {
        if s.len() < 3 || s.starts_with(BASE64_PREFIX) {
            return None;
        }
        Self::from_tag(&s[..3])
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The shape of a payload's `content`, derived at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadFormat {
    /// Content is a version-prefixed encrypted string.
    EncryptedString,
    /// Content is a decoded object with well-formed references.
    DecryptedBareObject,
    /// Content is a `000`-prefixed base64 string (unencrypted armor).
    DecryptedBase64String,
    /// Tombstone; content is absent.
    Deleted,
}
