//! Field-presence masks.
//!
//! A payload's `fields` set records which fields this payload class carries,
//! so consumers can distinguish "unset" from "omitted by this payload class".
//! The named sets below replace the legacy subclass hierarchy: one record
//! type, several masks.

use std::collections::BTreeSet;

/// Every field a payload can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PayloadField {
    Uuid,
    ContentType,
    Content,
    EncItemKey,
    ItemsKeyId,
    AuthHash,
    Deleted,
    CreatedAt,
    UpdatedAt,
    Dirty,
    DirtiedAt,
    ErrorDecrypting,
    ErrorDecryptingChanged,
    WaitingForKey,
    LastSyncBegan,
    LastSyncEnd,
}

impl PayloadField {
    /// Fields never written to the persistent store or the wire.
    pub fn is_non_persistable(&self) -> bool {
        matches!(
            self,
            PayloadField::DirtiedAt
                | PayloadField::ErrorDecrypting
                | PayloadField::ErrorDecryptingChanged
                | PayloadField::WaitingForKey
                | PayloadField::LastSyncBegan
                | PayloadField::LastSyncEnd
        )
    }
}

pub type FieldSet = BTreeSet<PayloadField>;

fn set(fields: &[PayloadField]) -> FieldSet {
    fields.iter().copied().collect()
}

/// All fields. Used for in-session working copies.
pub fn max_fields() -> FieldSet {
    set(&[
        PayloadField::Uuid,
        PayloadField::ContentType,
        PayloadField::Content,
        PayloadField::EncItemKey,
        PayloadField::ItemsKeyId,
        PayloadField::AuthHash,
        PayloadField::Deleted,
        PayloadField::CreatedAt,
        PayloadField::UpdatedAt,
        PayloadField::Dirty,
        PayloadField::DirtiedAt,
        PayloadField::ErrorDecrypting,
        PayloadField::ErrorDecryptingChanged,
        PayloadField::WaitingForKey,
        PayloadField::LastSyncBegan,
        PayloadField::LastSyncEnd,
    ])
}

/// What the server returns in `retrieved_items` and `conflicts`.
pub fn server_fields() -> FieldSet {
    set(&[
        PayloadField::Uuid,
        PayloadField::ContentType,
        PayloadField::Content,
        PayloadField::EncItemKey,
        PayloadField::ItemsKeyId,
        PayloadField::AuthHash,
        PayloadField::Deleted,
        PayloadField::CreatedAt,
        PayloadField::UpdatedAt,
    ])
}

/// What the server returns in `saved_items`: acknowledgements without content.
pub fn server_saved_fields() -> FieldSet {
    set(&[
        PayloadField::Uuid,
        PayloadField::ContentType,
        PayloadField::Deleted,
        PayloadField::CreatedAt,
        PayloadField::UpdatedAt,
        PayloadField::Dirty,
        PayloadField::LastSyncEnd,
    ])
}

/// What round-trips through the local persistent store.
pub fn storage_fields() -> FieldSet {
    let mut fields = server_fields();
    fields.insert(PayloadField::Dirty);
    fields.insert(PayloadField::DirtiedAt);
    fields
}

/// The encrypted (or decrypted) projection produced by a protocol operator.
pub fn encryption_parameters_fields() -> FieldSet {
    set(&[
        PayloadField::Uuid,
        PayloadField::Content,
        PayloadField::EncItemKey,
        PayloadField::ItemsKeyId,
        PayloadField::AuthHash,
        PayloadField::ErrorDecrypting,
        PayloadField::ErrorDecryptingChanged,
        PayloadField::WaitingForKey,
    ])
}

/// What a backup file contributes on import.
pub fn file_import_fields() -> FieldSet {
    set(&[
        PayloadField::Uuid,
        PayloadField::ContentType,
        PayloadField::Content,
        PayloadField::EncItemKey,
        PayloadField::ItemsKeyId,
        PayloadField::AuthHash,
        PayloadField::CreatedAt,
        PayloadField::UpdatedAt,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_contains_every_other_set() {
        let max = max_fields();
        for other in [
            server_fields(),
            server_saved_fields(),
            storage_fields(),
            encryption_parameters_fields(),
            file_import_fields(),
        ] {
            assert!(other.is_subset(&max));
        }
    }

    #[test]
    fn saved_items_carry_no_content() {
        assert!(!server_saved_fields().contains(&PayloadField::Content));
    }

    #[test]
    fn non_persistable_classification() {
        assert!(PayloadField::DirtiedAt.is_non_persistable());
        assert!(PayloadField::ErrorDecrypting.is_non_persistable());
        assert!(PayloadField::WaitingForKey.is_non_persistable());
        assert!(PayloadField::LastSyncBegan.is_non_persistable());
        assert!(!PayloadField::Uuid.is_non_persistable());
        assert!(!PayloadField::Dirty.is_non_persistable());
        assert!(!PayloadField::Deleted.is_non_persistable());
    }
}
