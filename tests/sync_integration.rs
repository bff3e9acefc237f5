//! End-to-end tests for the sync transport: two in-process nodes
//! talking over localhost HTTP.

use std::net::SocketAddr;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use tempfile::TempDir;
use uuid::Uuid;

use pastesync::config::Config;
use pastesync::directory::{ConnectionState, PeerDirectory, TrustState};
use pastesync::discovery::DeviceInfo;
use pastesync::identity::DeviceIdentity;
use pastesync::paste::{BlobStore, Encryptor, FileRef, PasteContent, PasteStore};
use pastesync::secure::SecureStore;
use pastesync::sync::{Applied, PullJob, Reconciler};
use pastesync::transport::protocol::{
    ChangesRequest, Heartbeat, SyncBatch, SyncMessage, PROTOCOL_VERSION,
};
use pastesync::transport::{AppState, HandshakeOutcome, PasteServer, PeerClient};

struct TestNode {
    config: Arc<Config>,
    identity: Arc<DeviceIdentity>,
    directory: PeerDirectory,
    secure: SecureStore,
    store: Arc<PasteStore>,
    blobs: BlobStore,
    reconciler: Arc<Reconciler>,
    pull_rx: tokio::sync::mpsc::UnboundedReceiver<PullJob>,
    addr: SocketAddr,
    _temp: TempDir,
}

async fn spawn_node(name: &str) -> TestNode {
    let temp = TempDir::new().unwrap();

    let mut config = Config::default();
    config.device_name = name.to_string();
    config.network.listen_addr = "127.0.0.1:0".parse().unwrap();
    config.storage.database = temp.path().join("records.db");
    config.storage.blob_dir = temp.path().join("blobs");
    config.security.identity_key = temp.path().join("identity.p8");
    config.security.trust_db = temp.path().join("devices.json");
    config.security.store_key = temp.path().join("store.key");
    let config = Arc::new(config);

    let identity =
        Arc::new(DeviceIdentity::load_or_create(&config.security.identity_key).unwrap());
    let encryptor = Encryptor::new(&config.security.store_key).unwrap();
    let store = Arc::new(
        PasteStore::open(&config.storage.database, encryptor)
            .await
            .unwrap(),
    );
    let blobs = BlobStore::open(&config.storage.blob_dir).unwrap();
    let directory = PeerDirectory::load(config.security.trust_db.clone())
        .await
        .unwrap();
    let secure = SecureStore::new();
    let (reconciler, pull_rx) = Reconciler::new(config.device_id, store.clone(), blobs.clone());

    let state = Arc::new(AppState {
        config: config.clone(),
        identity: identity.clone(),
        directory: directory.clone(),
        secure: secure.clone(),
        store: store.clone(),
        blobs: blobs.clone(),
        reconciler: reconciler.clone(),
    });

    let listener = tokio::net::TcpListener::bind(config.network.listen_addr)
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(PasteServer::new(state).serve(listener));

    TestNode {
        config,
        identity,
        directory,
        secure,
        store,
        blobs,
        reconciler,
        pull_rx,
        addr,
        _temp: temp,
    }
}

fn client_for(from: &TestNode, to: &TestNode) -> PeerClient {
    PeerClient::new(
        from.config.device_id,
        to.config.device_id,
        true,
        to.addr,
        from.secure.clone(),
        from.config.sync.max_payload,
    )
    .unwrap()
}

/// Handshake until established: first attempt parks as unmatched, then
/// the responder's operator trusts the fingerprint.
async fn establish(from: &TestNode, to: &TestNode) -> PeerClient {
    let mut client = client_for(from, to);

    match client
        .handshake(&from.identity, &from.config.device_name, from.addr.port())
        .await
        .unwrap()
    {
        HandshakeOutcome::Established { .. } => return client,
        HandshakeOutcome::Unmatched { fingerprint } => {
            assert_eq!(fingerprint, from.identity.fingerprint());
            to.directory
                .set_trust(&fingerprint, TrustState::Trusted)
                .await
                .unwrap();
        }
        other => panic!("unexpected handshake outcome: {other:?}"),
    }

    match client
        .handshake(&from.identity, &from.config.device_name, from.addr.port())
        .await
        .unwrap()
    {
        HandshakeOutcome::Established { fingerprint, .. } => {
            assert_eq!(fingerprint, to.identity.fingerprint());
            client
        }
        other => panic!("expected established after trust, got {other:?}"),
    }
}

#[tokio::test]
async fn test_handshake_requires_trust() {
    let alice = spawn_node("alice").await;
    let bob = spawn_node("bob").await;

    let mut client = client_for(&alice, &bob);
    let outcome = client
        .handshake(&alice.identity, "alice", alice.addr.port())
        .await
        .unwrap();

    assert!(matches!(outcome, HandshakeOutcome::Unmatched { .. }));

    // Bob's directory now holds alice, parked in verifying.
    let record = bob.directory.get(&alice.config.device_id).await.unwrap();
    assert_eq!(record.state, ConnectionState::Verifying);
    assert_eq!(
        record.fingerprint.as_deref(),
        Some(alice.identity.fingerprint().as_str())
    );
    assert!(!alice.secure.has_session(&bob.config.device_id).await);
}

#[tokio::test]
async fn test_handshake_establishes_after_trust() {
    let alice = spawn_node("alice").await;
    let bob = spawn_node("bob").await;

    let _client = establish(&alice, &bob).await;
    assert!(alice.secure.has_session(&bob.config.device_id).await);
    assert!(bob.secure.has_session(&alice.config.device_id).await);
}

#[tokio::test]
async fn test_heartbeat_roundtrip() {
    let alice = spawn_node("alice").await;
    let bob = spawn_node("bob").await;
    let client = establish(&alice, &bob).await;

    bob.reconciler
        .create_local(PasteContent::Text("on bob".into()))
        .await
        .unwrap();

    let ack = client
        .heartbeat(&Heartbeat {
            sender: alice.config.device_id,
            latest_seq: 0,
            sent_at: chrono::Utc::now(),
        })
        .await
        .unwrap();

    assert_eq!(ack.latest_seq, bob.store.latest_seq().await.unwrap());
    assert!(ack.latest_seq > 0);
}

#[tokio::test]
async fn test_push_create_update_delete() {
    let alice = spawn_node("alice").await;
    let bob = spawn_node("bob").await;
    let client = establish(&alice, &bob).await;

    // Create on alice, push to bob.
    let record = alice
        .reconciler
        .create_local(PasteContent::Text("shared note".into()))
        .await
        .unwrap();
    client
        .send_batch(&SyncBatch {
            sender: alice.config.device_id,
            messages: vec![SyncMessage::Create {
                record: record.clone(),
            }],
        })
        .await
        .unwrap();

    let on_bob = bob.store.get(&record.id).await.unwrap().unwrap();
    assert_eq!(on_bob.content, PasteContent::Text("shared note".into()));

    // Update.
    let updated = alice
        .reconciler
        .set_favorite(&record.id, true)
        .await
        .unwrap();
    client
        .send_batch(&SyncBatch {
            sender: alice.config.device_id,
            messages: vec![SyncMessage::Update {
                record: updated.clone(),
            }],
        })
        .await
        .unwrap();
    assert!(bob.store.get(&record.id).await.unwrap().unwrap().favorite);

    // Delete.
    alice.reconciler.delete_local(&record.id).await.unwrap();
    let tombstone = alice.store.get(&record.id).await.unwrap().unwrap();
    client
        .send_batch(&SyncBatch {
            sender: alice.config.device_id,
            messages: vec![SyncMessage::Delete { record: tombstone }],
        })
        .await
        .unwrap();
    assert!(bob.store.get(&record.id).await.unwrap().unwrap().deleted);
}

#[tokio::test]
async fn test_catch_up_pulls_missed_changes() {
    let alice = spawn_node("alice").await;
    let bob = spawn_node("bob").await;
    let client = establish(&alice, &bob).await;

    // Alice needs a directory entry for bob to store the cursor.
    let mut bob_info = DeviceInfo::manual(bob.addr);
    bob_info.id = bob.config.device_id;
    alice.directory.observe(&bob_info, true).await.unwrap();

    for i in 0..5 {
        bob.reconciler
            .create_local(PasteContent::Text(format!("note {i}")))
            .await
            .unwrap();
    }

    let applied = alice
        .reconciler
        .catch_up(&client, &alice.directory)
        .await
        .unwrap();
    assert_eq!(applied, 5);
    assert_eq!(alice.store.live_count().await.unwrap(), 5);

    // Cursor advanced; a second catch-up applies nothing.
    let again = alice
        .reconciler
        .catch_up(&client, &alice.directory)
        .await
        .unwrap();
    assert_eq!(again, 0);
    assert_eq!(
        alice.directory.cursor(&bob.config.device_id).await,
        bob.store.latest_seq().await.unwrap()
    );
}

#[tokio::test]
async fn test_chunked_blob_pull() {
    let alice = spawn_node("alice").await;
    let mut bob = spawn_node("bob").await;
    let client = establish(&bob, &alice).await;

    // Alice shares a file record; its payload spans several chunks.
    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 241) as u8).collect();
    let hash = alice.blobs.put(&data).unwrap();
    let record = alice
        .reconciler
        .create_local(PasteContent::Files(vec![FileRef {
            name: "dataset.bin".into(),
            size: data.len() as u64,
            hash: hash.clone(),
        }]))
        .await
        .unwrap();

    // Bob applies the record; the blob is missing so a pull is queued.
    let applied = bob
        .reconciler
        .apply_remote(alice.config.device_id, record.clone())
        .await
        .unwrap();
    assert_eq!(applied, Applied::Inserted);
    assert!(!bob.store.get(&record.id).await.unwrap().unwrap().complete);

    let job = bob.pull_rx.recv().await.unwrap();
    assert_eq!(job.hashes, vec![hash.clone()]);

    let done = bob
        .reconciler
        .run_pull_job(&client, &job, bob.config.sync.chunk_retries)
        .await
        .unwrap();
    assert!(done);

    assert_eq!(bob.blobs.read(&hash).unwrap(), data);
    assert!(bob.store.get(&record.id).await.unwrap().unwrap().complete);
}

#[tokio::test]
async fn test_sealed_route_rejects_without_session() {
    let bob = spawn_node("bob").await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/sync/heartbeat", bob.addr))
        .header("x-pastesync-device", Uuid::new_v4().to_string())
        .body(vec![0u8; 32])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_incompatible_protocol_version() {
    let bob = spawn_node("bob").await;

    let body = serde_json::json!({
        "protocol_version": PROTOCOL_VERSION + 1,
        "device_id": Uuid::new_v4(),
        "device_name": "stranger",
        "platform": "linux",
        "port": 1,
        "identity_pub": "", "exchange_pub": "", "nonce": "", "signature": "",
    });

    let response = reqwest::Client::new()
        .post(format!("http://{}/session/handshake", bob.addr))
        .json(&body)
        .send()
        .await
        .unwrap();

    assert!(response.status().is_success());
    let parsed: serde_json::Value = response.json().await.unwrap();
    assert_eq!(parsed["status"], "incompatible");
    assert_eq!(parsed["protocol_version"], PROTOCOL_VERSION);
}

#[tokio::test]
async fn test_changes_pagination() {
    let alice = spawn_node("alice").await;
    let bob = spawn_node("bob").await;
    let client = establish(&alice, &bob).await;

    for i in 0..7 {
        bob.reconciler
            .create_local(PasteContent::Text(format!("page item {i}")))
            .await
            .unwrap();
    }

    let page = client
        .changes(&ChangesRequest { since: 0, limit: 3 })
        .await
        .unwrap();
    assert_eq!(page.records.len(), 3);
    assert!(page.more);

    let rest = client
        .changes(&ChangesRequest {
            since: page.cursor,
            limit: 100,
        })
        .await
        .unwrap();
    assert_eq!(rest.records.len(), 4);
    assert!(!rest.more);
}
