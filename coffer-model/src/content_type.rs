//! Content type tags: the discriminator carried by every payload and item.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// What kind of data an item holds.
///
/// Reserved types use the `SN|` wire prefix; user-visible types are bare.
/// Unrecognized tags round-trip through [`ContentType::Unknown`] so that
/// items written by a newer client are preserved verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContentType {
    Note,
    Tag,
    /// A symmetric key stored as a regular encrypted item (`SN|ItemsKey`).
    ItemsKey,
    Privileges,
    UserPreferences,
    Component,
    Unknown(String),
}

impl ContentType {
    pub fn as_str(&self) -> &str {
        match self {
            ContentType::Note => "Note",
            ContentType::Tag => "Tag",
            ContentType::ItemsKey => "SN|ItemsKey",
            ContentType::Privileges => "SN|Privileges",
            ContentType::UserPreferences => "SN|UserPreferences",
            ContentType::Component => "SN|Component",
            ContentType::Unknown(tag) => tag,
        }
    }

    pub fn from_wire(tag: &str) -> Self {
        match tag {
            "Note" => ContentType::Note,
            "Tag" => ContentType::Tag,
            "SN|ItemsKey" => ContentType::ItemsKey,
            "SN|Privileges" => ContentType::Privileges,
            "SN|UserPreferences" => ContentType::UserPreferences,
            "SN|Component" => ContentType::Component,
            other => ContentType::Unknown(other.to_string()),
        }
    }

    /// Whether exactly one non-deleted instance of this type may exist.
    pub fn is_singleton(&self) -> bool {
        matches!(self, ContentType::Privileges | ContentType::UserPreferences)
    }

    /// Database-load ordering. Items-keys load before everything else so
    /// subsequent payloads can be decrypted in a single pass.
    pub fn load_priority(&self) -> u8 {
        match self {
            ContentType::ItemsKey => 0,
            _ => 1,
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for ContentType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ContentType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;
        impl de::Visitor<'_> for Visitor {
            type Value = ContentType;
            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a content type tag")
            }
            fn visit_str<E: de::Error>(self, v: &str) -> Result<ContentType, E> {
                Ok(ContentType::from_wire(v))
            }
        }
        deserializer.deserialize_str(Visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        for tag in ["Note", "Tag", "SN|ItemsKey", "SN|Privileges", "SN|UserPreferences"] {
            assert_eq!(ContentType::from_wire(tag).as_str(), tag);
        }
    }

    #[test]
    fn unknown_tags_are_preserved() {
        let ct = ContentType::from_wire("SN|FutureThing");
        assert_eq!(ct, ContentType::Unknown("SN|FutureThing".into()));
        assert_eq!(ct.as_str(), "SN|FutureThing");
    }

    #[test]
    fn singleton_flags() {
        assert!(ContentType::Privileges.is_singleton());
        assert!(ContentType::UserPreferences.is_singleton());
        assert!(!ContentType::Note.is_singleton());
        assert!(!ContentType::ItemsKey.is_singleton());
    }

    #[test]
    fn items_keys_load_first() {
        assert!(ContentType::ItemsKey.load_priority() < ContentType::Note.load_priority());
    }
}
