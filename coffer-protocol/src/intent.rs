//! Encryption intents: the purpose of an (en|de)cryption call governs the
//! output format.

/// Why a payload is being projected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EncryptionIntent {
    /// Upload to the sync server.
    Sync,
    /// Local persistence, always encrypted.
    LocalStorageEncrypted,
    /// Local persistence, never encrypted.
    LocalStorageDecrypted,
    /// Local persistence, encrypted when a key is available.
    LocalStoragePreferEncrypted,
    /// Backup file export, encrypted.
    FileEncrypted,
    /// Backup file export, plaintext.
    FileDecrypted,
}

impl EncryptionIntent {
    /// Whether this intent's output must be an encrypted string when a key
    /// is supplied.
    pub fn requires_encryption(&self) -> bool {
        matches!(
            self,
            EncryptionIntent::Sync
                | EncryptionIntent::LocalStorageEncrypted
                | EncryptionIntent::FileEncrypted
                | EncryptionIntent::LocalStoragePreferEncrypted
        )
    }

    /// Whether a missing key is tolerable, falling back to a decrypted
    /// output format instead of failing.
    pub fn allows_decrypted_fallback(&self) -> bool {
        matches!(
            self,
            EncryptionIntent::Sync
                | EncryptionIntent::LocalStoragePreferEncrypted
                | EncryptionIntent::LocalStorageDecrypted
                | EncryptionIntent::FileDecrypted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypting_intents() {
        assert!(EncryptionIntent::Sync.requires_encryption());
        assert!(EncryptionIntent::LocalStorageEncrypted.requires_encryption());
        assert!(EncryptionIntent::FileEncrypted.requires_encryption());
        assert!(EncryptionIntent::LocalStoragePreferEncrypted.requires_encryption());
        assert!(!EncryptionIntent::LocalStorageDecrypted.requires_encryption());
        assert!(!EncryptionIntent::FileDecrypted.requires_encryption());
    }

    #[test]
    fn keyless_fallbacks() {
        assert!(EncryptionIntent::Sync.allows_decrypted_fallback());
        assert!(EncryptionIntent::LocalStoragePreferEncrypted.allows_decrypted_fallback());
        assert!(!EncryptionIntent::LocalStorageEncrypted.allows_decrypted_fallback());
        assert!(!EncryptionIntent::FileEncrypted.allows_decrypted_fallback());
    }
}
