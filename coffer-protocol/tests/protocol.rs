use coffer_model::{
    Payload, PayloadContent, PayloadFormat, PayloadSource, ProtocolVersion, RawPayload,
};
use coffer_protocol::{
    cost_minimum_for_version, CryptoProvider, EncryptionIntent, KeyManager, PlatformCrypto,
    ProtocolManager, ProtocolOperator,
};
use serde_json::json;
use std::sync::Arc;

fn manager() -> ProtocolManager {
    let crypto: Arc<dyn CryptoProvider> = Arc::new(PlatformCrypto::new());
    let keys = Arc::new(KeyManager::new(crypto.clone()));
    ProtocolManager::new(crypto, keys)
}

fn note(uuid: &str, text: &str) -> Payload {
    Payload::max_from_raw(
        &RawPayload {
            uuid: uuid.into(),
            content_type: "Note".into(),
            content: Some(json!({"text": text})),
            ..Default::default()
        },
        PayloadSource::Constructor,
    )
    .unwrap()
}

#[test]
fn cost_minimums() {
    assert_eq!(cost_minimum_for_version(ProtocolVersion::V004), 5);
    assert_eq!(cost_minimum_for_version(ProtocolVersion::V003), 110_000);
    assert_eq!(cost_minimum_for_version(ProtocolVersion::V002), 3000);
    assert_eq!(cost_minimum_for_version(ProtocolVersion::V001), 3000);
}

#[test]
fn raw_encrypt_decrypt_roundtrip() {
    let crypto = PlatformCrypto::new();
    let key = crypto.random_bytes(32);
    let nonce = crypto.random_bytes(24);
    let aad = serde_json::to_vec(&json!({"foo": "bar"})).unwrap();

    let ciphertext = crypto
        .aes_gcm_encrypt(&key, &nonce, b"hello world", &aad)
        .unwrap();
    let plaintext = crypto.aes_gcm_decrypt(&key, &nonce, &ciphertext, &aad).unwrap();
    assert_eq!(plaintext, b"hello world");
}

#[test]
fn raw_decrypt_with_mutated_aad_fails() {
    let crypto = PlatformCrypto::new();
    let key = crypto.random_bytes(32);
    let nonce = crypto.random_bytes(24);
    let aad = serde_json::to_vec(&json!({"foo": "bar"})).unwrap();
    let mutated = serde_json::to_vec(&json!({"foo": "rab"})).unwrap();

    let ciphertext = crypto
        .aes_gcm_encrypt(&key, &nonce, b"hello world", &aad)
        .unwrap();
    assert!(crypto
        .aes_gcm_decrypt(&key, &nonce, &ciphertext, &mutated)
        .is_err());
}

#[test]
fn key_params_rederivation_matches_all_fields() {
    let pm = manager();
    let (key, key_params) = pm.create_root_key("hello@test.com", "password").unwrap();
    let recomputed = pm.compute_root_key("password", &key_params).unwrap();
    assert_eq!(key, recomputed);
    assert_eq!(recomputed.version(), ProtocolVersion::V004);
    assert_eq!(
        key.server_password_hex(),
        recomputed.server_password_hex()
    );
}

#[test]
fn full_intent_roundtrip_through_manager() {
    let pm = manager();
    let (root, _) = pm.create_root_key("a@b.c", "password").unwrap();
    pm.key_manager().set_root_key(root);
    let items_key_payload = pm.create_new_default_items_key().unwrap();

    let payload = note("n1", "sync me");
    let encrypted = pm
        .payload_by_encrypting(&payload, EncryptionIntent::Sync)
        .unwrap();
    assert_eq!(encrypted.format(), PayloadFormat::EncryptedString);
    assert_eq!(encrypted.version(), Some(ProtocolVersion::V004));
    assert_eq!(
        encrypted.items_key_id(),
        Some(items_key_payload.uuid())
    );

    let decrypted = pm.payload_by_decrypting(&encrypted);
    assert!(!decrypted.error_decrypting());
    assert!(decrypted
        .decrypted_content()
        .unwrap()
        .structurally_equals(payload.decrypted_content().unwrap()));
}

#[test]
fn items_key_payload_is_encrypted_under_root_key() {
    let pm = manager();
    let (root, _) = pm.create_root_key("a@b.c", "password").unwrap();
    pm.key_manager().set_root_key(root);
    let ik_payload = pm.create_new_default_items_key().unwrap();

    let encrypted = pm
        .payload_by_encrypting(&ik_payload, EncryptionIntent::Sync)
        .unwrap();
    // The items-key payload never records an items_key_id; its wrap is the
    // root key itself.
    assert!(encrypted.items_key_id().is_none());

    let decrypted = pm.payload_by_decrypting(&encrypted);
    assert!(!decrypted.error_decrypting());
}

#[test]
fn sync_intent_without_any_key_produces_base64_armor() {
    let pm = manager();
    let payload = note("n1", "offline");
    let projected = pm
        .payload_by_encrypting(&payload, EncryptionIntent::Sync)
        .unwrap();
    assert_eq!(projected.format(), PayloadFormat::DecryptedBase64String);

    // And the armor decodes back.
    let decrypted = pm.payload_by_decrypting(&projected);
    assert!(decrypted
        .decrypted_content()
        .unwrap()
        .structurally_equals(payload.decrypted_content().unwrap()));
}

#[test]
fn storage_encrypted_intent_without_key_is_missing_key() {
    let pm = manager();
    let payload = note("n1", "x");
    assert!(pm
        .payload_by_encrypting(&payload, EncryptionIntent::LocalStorageEncrypted)
        .is_err());
    assert!(pm
        .payload_by_encrypting(&payload, EncryptionIntent::FileEncrypted)
        .is_err());
}

#[test]
fn prefer_encrypted_intent_without_key_passes_bare_object() {
    let pm = manager();
    let payload = note("n1", "x");
    let projected = pm
        .payload_by_encrypting(&payload, EncryptionIntent::LocalStoragePreferEncrypted)
        .unwrap();
    assert_eq!(projected.format(), PayloadFormat::DecryptedBareObject);
}

#[test]
fn missing_items_key_marks_waiting() {
    let pm = manager();
    let (root, _) = pm.create_root_key("a@b.c", "password").unwrap();
    pm.key_manager().set_root_key(root);
    pm.create_new_default_items_key().unwrap();

    let encrypted = pm
        .payload_by_encrypting(&note("n1", "hi"), EncryptionIntent::Sync)
        .unwrap();

    // A second client that has the root key but not the items-key yet.
    let other = manager();
    let (other_root, _) = other.create_root_key("a@b.c", "password").unwrap();
    other.key_manager().set_root_key(other_root);
    let result = other.payload_by_decrypting(&encrypted);
    assert!(result.waiting_for_key());
    assert!(!result.error_decrypting());
    // The encrypted content is retained for the retry.
    assert_eq!(result.format(), PayloadFormat::EncryptedString);
}

#[test]
fn bulk_decrypt_preserves_order_and_contains_errors() {
    let pm = manager();
    let (root, _) = pm.create_root_key("a@b.c", "password").unwrap();
    pm.key_manager().set_root_key(root);
    pm.create_new_default_items_key().unwrap();

    let good = pm
        .payload_by_encrypting(&note("good", "fine"), EncryptionIntent::Sync)
        .unwrap();
    let bad = {
        let encrypted = pm
            .payload_by_encrypting(&note("bad", "broken"), EncryptionIntent::Sync)
            .unwrap();
        // Corrupt the ciphertext body.
        let corrupted = match encrypted.content().unwrap() {
            PayloadContent::Encrypted(s) => {
                let mut parts: Vec<String> = s.split(':').map(String::from).collect();
                parts[2] = {
                    let mut chars: Vec<char> = parts[2].chars().collect();
                    chars[0] = if chars[0] == 'A' { 'B' } else { 'A' };
                    chars.into_iter().collect()
                };
                parts.join(":")
            }
            _ => unreachable!(),
        };
        encrypted.copy_with(coffer_model::PayloadOverride {
            content: Some(Some(PayloadContent::Encrypted(corrupted))),
            ..Default::default()
        })
    };
    let tombstone = note("gone", "x").copy_with(coffer_model::PayloadOverride {
        content: Some(None),
        deleted: Some(true),
        ..Default::default()
    });

    let results = pm
        .payloads_by_decrypting(&[good.clone(), bad, tombstone], false)
        .unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].uuid(), "good");
    assert!(!results[0].error_decrypting());
    assert_eq!(results[1].uuid(), "bad");
    assert!(results[1].error_decrypting());
    assert_eq!(results[2].uuid(), "gone");
    assert!(results[2].deleted());

    // The throwing variant surfaces the same failure as an error.
    assert!(pm
        .payloads_by_decrypting(&[results[1].clone()], true)
        .is_err());
}

#[test]
fn operator_roundtrip_across_all_versions() {
    let crypto: Arc<dyn CryptoProvider> = Arc::new(PlatformCrypto::new());
    for version in [
        ProtocolVersion::V001,
        ProtocolVersion::V002,
        ProtocolVersion::V003,
        ProtocolVersion::V004,
    ] {
        let operator = ProtocolOperator::for_version(version, crypto.clone());
        let key = match version {
            ProtocolVersion::V004 => operator.create_items_key().unwrap().to_encryption_key(),
            _ => {
                let (root, _) = operator.create_root_key("user@test.com", "password").unwrap();
                root.to_encryption_key()
            }
        };
        let payload = note("roundtrip", "versioned");
        let params = operator.generate_encryption_parameters(&payload, &key).unwrap();
        assert!(params.content.starts_with(version.as_str()));

        let encrypted = payload.copy_with(coffer_model::PayloadOverride {
            content: Some(Some(PayloadContent::Encrypted(params.content))),
            enc_item_key: Some(Some(params.enc_item_key)),
            items_key_id: Some(params.items_key_id),
            auth_hash: Some(params.auth_hash),
            ..Default::default()
        });
        let decrypted = operator.generate_decrypted_parameters(&encrypted, &key);
        assert!(!decrypted.error_decrypting, "version {}", version);
        assert!(decrypted
            .content
            .unwrap()
            .structurally_equals(payload.decrypted_content().unwrap()));
    }
}
