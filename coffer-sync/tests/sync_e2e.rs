//! End-to-end sync scenarios against the in-memory server.

use chrono::{Duration as ChronoDuration, Utc};
use coffer_model::{
    ContentType, ItemContent, Payload, PayloadOverride, PayloadSource, RawPayload,
};
use coffer_protocol::{CryptoProvider, KeyManager, KeyParams, PlatformCrypto, ProtocolManager};
use coffer_sync::{
    CollectingSink, FailureMode, InMemoryStorage, MockSyncServer, SyncError, SyncEvent,
    SyncOptions, SyncService, SyncTimingStrategy,
};
use serde_json::json;
use std::sync::Arc;

struct Client {
    storage: Arc<InMemoryStorage>,
    server: Arc<MockSyncServer>,
    service: Arc<SyncService>,
    events: Arc<CollectingSink>,
}

fn client(server: Arc<MockSyncServer>) -> Client {
    let crypto: Arc<dyn CryptoProvider> = Arc::new(PlatformCrypto::new());
    let keys = Arc::new(KeyManager::new(crypto.clone()));
    let protocol = Arc::new(ProtocolManager::new(crypto, keys));
    let storage = Arc::new(InMemoryStorage::new());
    let service = Arc::new(SyncService::new(
        storage.clone(),
        server.clone(),
        protocol,
    ));
    let events = Arc::new(CollectingSink::new());
    service.add_event_observer("test", events.clone());
    Client {
        storage,
        server,
        service,
        events,
    }
}

async fn register(client: &Client, email: &str, password: &str) {
    let protocol = client.service.protocol();
    let (root, params) = protocol.create_root_key(email, password).unwrap();
    protocol.key_manager().set_root_key(root);
    client.server.set_key_params(params.to_value());
    let items_key = protocol.create_new_default_items_key().unwrap();
    client
        .service
        .models()
        .lock()
        .await
        .map_payloads_to_local_items(vec![items_key], PayloadSource::Constructor);
    client.service.load_database().await.unwrap();
}

async fn sign_in(client: &Client, password: &str) {
    let protocol = client.service.protocol();
    let params = KeyParams::from_value(&client.server.key_params().unwrap()).unwrap();
    let root = protocol.compute_root_key(password, &params).unwrap();
    protocol.key_manager().set_root_key(root);
    client.service.load_database().await.unwrap();
    client.service.sync(SyncOptions::default()).await.unwrap();
}

async fn create_item(client: &Client, uuid: &str, content_type: ContentType, content: serde_json::Value) {
    let content = ItemContent::from_value(&content).unwrap();
    let payload = Payload::from_content(uuid.to_string(), content_type, content).copy_with(
        PayloadOverride {
            dirty: Some(true),
            dirtied_at: Some(Some(Utc::now())),
            ..Default::default()
        },
    );
    client
        .service
        .models()
        .lock()
        .await
        .map_payloads_to_local_items(vec![payload], PayloadSource::LocalDirtied);
}

async fn create_note(client: &Client, uuid: &str, text: &str) {
    create_item(client, uuid, ContentType::Note, json!({"text": text})).await;
}

async fn edit_note(client: &Client, uuid: &str, text: &str) {
    let payload = {
        let models = client.service.models().lock().await;
        let item = models.item(uuid).unwrap();
        let mut content = item.content().unwrap().clone();
        content
            .extra
            .insert("text".into(), serde_json::Value::String(text.into()));
        item.payload().copy_with(PayloadOverride {
            content: Some(Some(coffer_model::PayloadContent::Decrypted(content))),
            dirty: Some(true),
            dirtied_at: Some(Some(Utc::now())),
            ..Default::default()
        })
    };
    client
        .service
        .models()
        .lock()
        .await
        .map_payloads_to_local_items(vec![payload], PayloadSource::LocalDirtied);
}

async fn sync(client: &Client) {
    client.service.sync(SyncOptions::default()).await.unwrap();
}

// ---------------------------------------------------------------------------
// Round trips between clients
// ---------------------------------------------------------------------------

#[tokio::test]
async fn notes_sync_between_two_clients() {
    let server = Arc::new(MockSyncServer::new());
    let alice = client(server.clone());
    register(&alice, "alice@test.com", "password").await;
    for i in 0..20 {
        create_note(&alice, &format!("note-{}", i), &format!("text {}", i)).await;
    }
    sync(&alice).await;
    // 20 notes + 1 items-key
    assert_eq!(server.item_count(), 21);

    let bob = client(server.clone());
    sign_in(&bob, "password").await;
    {
        let models = bob.service.models().lock().await;
        assert_eq!(models.invalid_item_count(), 0);
        let notes: Vec<_> = models.items_of_type(ContentType::Note).collect();
        assert_eq!(notes.len(), 20);
        assert!(notes.iter().all(|n| n.content().is_some()));
    }
    // 21 downloaded items crosses the major-change threshold.
    assert!(bob.events.contains(&SyncEvent::MajorDataChange));
}

#[tokio::test]
async fn upload_batches_across_rounds() {
    let server = Arc::new(MockSyncServer::new());
    let alice = client(server.clone());
    register(&alice, "alice@test.com", "password").await;
    for i in 0..160 {
        create_note(&alice, &format!("note-{}", i), "x").await;
    }
    sync(&alice).await;
    assert_eq!(server.item_count(), 161);
    assert!(alice
        .service
        .models()
        .lock()
        .await
        .dirty_payloads()
        .is_empty());
}

#[tokio::test]
async fn offline_sync_persists_and_clears_dirty() {
    let server = Arc::new(MockSyncServer::new());
    let solo = client(server.clone());
    solo.service.load_database().await.unwrap();
    create_note(&solo, "n1", "offline text").await;
    sync(&solo).await;

    assert_eq!(server.item_count(), 0);
    assert_eq!(solo.storage.payload_count(), 1);
    assert!(solo.service.models().lock().await.dirty_payloads().is_empty());
    assert!(solo
        .events
        .contains(&SyncEvent::FullSyncCompleted { items_involved: 1 }));
}

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_edits_become_a_duplicate() {
    let server = Arc::new(MockSyncServer::new());
    let alice = client(server.clone());
    register(&alice, "alice@test.com", "password").await;
    create_note(&alice, "shared", "original").await;
    sync(&alice).await;

    let bob = client(server.clone());
    sign_in(&bob, "password").await;

    // Alice wins the race; Bob uploads from a stale base.
    edit_note(&alice, "shared", "alice's edit").await;
    sync(&alice).await;
    edit_note(&bob, "shared", "bob's edit").await;
    sync(&bob).await;

    {
        let models = bob.service.models().lock().await;
        let notes: Vec<_> = models.items_of_type(ContentType::Note).collect();
        assert_eq!(notes.len(), 2);
        let shared = models.item("shared").unwrap();
        assert_eq!(
            shared.content().unwrap().extra["text"],
            json!("alice's edit")
        );
        let duplicate = notes.iter().find(|n| n.uuid() != "shared").unwrap();
        assert_eq!(duplicate.content().unwrap().extra["text"], json!("bob's edit"));
        assert!(duplicate.dirty());
    }

    // Bob uploads the duplicate; Alice converges to two notes.
    sync(&bob).await;
    sync(&alice).await;
    let models = alice.service.models().lock().await;
    assert_eq!(models.items_of_type(ContentType::Note).count(), 2);
}

// ---------------------------------------------------------------------------
// Password changes (items-key rotation)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn change_password_five_times_rotates_items_keys() {
    let server = Arc::new(MockSyncServer::new());
    let alice = client(server.clone());
    register(&alice, "alice@test.com", "password-0").await;
    create_note(&alice, "n1", "precious").await;
    sync(&alice).await;

    let protocol = alice.service.protocol();
    assert_eq!(protocol.key_manager().items_key_count(), 1);

    for i in 1..=5 {
        let new_password = format!("password-{}", i);
        let (root, params) = protocol
            .create_root_key("alice@test.com", &new_password)
            .unwrap();
        protocol.key_manager().set_root_key(root);
        alice.server.set_key_params(params.to_value());

        let items_key = protocol.create_new_default_items_key().unwrap();
        alice
            .service
            .models()
            .lock()
            .await
            .map_payloads_to_local_items(vec![items_key], PayloadSource::Constructor);
        alice.service.mark_all_items_as_needing_sync().await;
        sync(&alice).await;

        // Each change adds exactly one new items-key.
        assert_eq!(protocol.key_manager().items_key_count(), 1 + i);
    }

    alice.service.sign_out().await.unwrap();
    assert_eq!(alice.storage.payload_count(), 0);

    let fresh = client(server.clone());
    sign_in(&fresh, "password-5").await;
    let models = fresh.service.models().lock().await;
    assert_eq!(models.invalid_item_count(), 0);
    let note = models.item("n1").unwrap();
    assert_eq!(note.content().unwrap().extra["text"], json!("precious"));
}

// ---------------------------------------------------------------------------
// Singletons
// ---------------------------------------------------------------------------

#[tokio::test]
async fn singleton_across_sign_out_keeps_server_instance() {
    let server = Arc::new(MockSyncServer::new());

    // The account already has a privileges item on the server.
    let alice = client(server.clone());
    register(&alice, "alice@test.com", "password").await;
    create_item(&alice, "privs-server", ContentType::Privileges, json!({"origin": "server"}))
        .await;
    sync(&alice).await;

    // A signed-out client creates its own privileges item, later in time.
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let carol = client(server.clone());
    carol.service.load_database().await.unwrap();
    create_item(&carol, "privs-local", ContentType::Privileges, json!({"origin": "local"}))
        .await;
    sync(&carol).await;

    // Sign in: the server instance arrives and wins singleton resolution.
    let protocol = carol.service.protocol();
    let params = KeyParams::from_value(&server.key_params().unwrap()).unwrap();
    let root = protocol.compute_root_key("password", &params).unwrap();
    protocol.key_manager().set_root_key(root);
    carol.service.sync(SyncOptions::default()).await.unwrap();
    sync(&carol).await;

    let models = carol.service.models().lock().await;
    let alive: Vec<_> = models
        .non_deleted_items()
        .filter(|i| i.content_type() == &ContentType::Privileges)
        .collect();
    assert_eq!(alive.len(), 1);
    assert_eq!(alive[0].uuid(), "privs-server");
}

// ---------------------------------------------------------------------------
// Integrity & out-of-sync recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn integrity_drift_enters_and_exits_out_of_sync() {
    let server = Arc::new(MockSyncServer::new());
    let alice = client(server.clone());
    register(&alice, "alice@test.com", "password").await;
    create_note(&alice, "n1", "text").await;
    sync(&alice).await;

    // A record the incremental path can never deliver: stamped an hour
    // before any sync token this client holds.
    let armored = {
        use base64::Engine as _;
        let body = serde_json::to_vec(&json!({"text": "ghost"})).unwrap();
        format!(
            "000{}",
            base64::engine::general_purpose::STANDARD.encode(body)
        )
    };
    server.seed_item_with_stamp(
        RawPayload {
            uuid: "ghost".into(),
            content_type: "Note".into(),
            content: Some(json!(armored)),
            ..Default::default()
        },
        Utc::now() - ChronoDuration::hours(1),
    );

    let check = SyncOptions {
        check_integrity: true,
        timing: SyncTimingStrategy::ResolveOnNext,
    };
    for _ in 0..5 {
        alice.service.sync(check).await.unwrap();
    }
    assert!(alice.events.contains(&SyncEvent::EnterOutOfSync));
    assert!(alice.service.is_out_of_sync());

    alice.service.resolve_out_of_sync().await.unwrap();
    assert!(alice.events.contains(&SyncEvent::ExitOutOfSync));
    assert!(!alice.service.is_out_of_sync());

    let models = alice.service.models().lock().await;
    assert!(models.item("ghost").is_some());
}

// ---------------------------------------------------------------------------
// Errors and events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unauthorized_emits_invalid_session() {
    let server = Arc::new(MockSyncServer::new());
    let alice = client(server.clone());
    register(&alice, "alice@test.com", "password").await;

    server.fail_next(FailureMode::Unauthorized, 1);
    let result = alice.service.sync(SyncOptions::default()).await;
    assert!(matches!(result, Err(SyncError::AuthFailure)));
    assert!(alice.events.contains(&SyncEvent::InvalidSession));
}

#[tokio::test]
async fn transport_error_suspends_then_recovers() {
    let server = Arc::new(MockSyncServer::new());
    let alice = client(server.clone());
    register(&alice, "alice@test.com", "password").await;
    create_note(&alice, "n1", "x").await;

    server.fail_next(FailureMode::Transport, 1);
    let result = alice.service.sync(SyncOptions::default()).await;
    assert!(matches!(result, Err(SyncError::Api(_))));
    assert!(alice.service.last_error().is_some());
    assert_eq!(
        alice
            .events
            .count_of(|e| matches!(e, SyncEvent::SyncError { .. })),
        1
    );

    // Durability: the dirty edit was pre-sync saved despite the failure.
    assert!(alice.storage.payload_count() >= 1);

    // A fresh sync retries and succeeds.
    sync(&alice).await;
    assert!(server.item("n1").is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_sync_calls_serialize() {
    let server = Arc::new(MockSyncServer::new());
    let alice = client(server.clone());
    register(&alice, "alice@test.com", "password").await;
    create_note(&alice, "n1", "x").await;

    let a = {
        let service = alice.service.clone();
        tokio::spawn(async move { service.sync(SyncOptions::default()).await })
    };
    let b = {
        let service = alice.service.clone();
        tokio::spawn(async move {
            service
                .sync(SyncOptions {
                    timing: SyncTimingStrategy::ForceSpawnNew,
                    check_integrity: false,
                })
                .await
        })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();
    assert!(server.item("n1").is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_before_database_load_waits_for_load() {
    let server = Arc::new(MockSyncServer::new());
    let alice = client(server.clone());
    let protocol = alice.service.protocol();
    let (root, params) = protocol.create_root_key("alice@test.com", "password").unwrap();
    protocol.key_manager().set_root_key(root);
    server.set_key_params(params.to_value());

    let early = {
        let service = alice.service.clone();
        tokio::spawn(async move { service.sync(SyncOptions::default()).await })
    };
    // Give the early caller time to enqueue.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    alice.service.load_database().await.unwrap();
    early.await.unwrap().unwrap();
}
