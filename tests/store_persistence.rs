//! Persistence tests: records must survive a process restart and stay
//! unreadable without the at-rest key.

use tempfile::TempDir;
use uuid::Uuid;

use pastesync::paste::{Encryptor, PasteContent, PasteRecord, PasteStore};

#[tokio::test]
async fn test_records_survive_reopen() {
    let temp = TempDir::new().unwrap();
    let db_path = temp.path().join("records.db");
    let key_path = temp.path().join("store.key");

    let id;
    {
        let store = PasteStore::open(&db_path, Encryptor::new(&key_path).unwrap())
            .await
            .unwrap();
        let record = PasteRecord::new(Uuid::new_v4(), PasteContent::Text("durable".into()));
        id = record.id;
        store.upsert(&record).await.unwrap();
    }

    let store = PasteStore::open(&db_path, Encryptor::new(&key_path).unwrap())
        .await
        .unwrap();
    let record = store.get(&id).await.unwrap().unwrap();
    assert_eq!(record.content, PasteContent::Text("durable".into()));
}

#[tokio::test]
async fn test_sequence_numbers_survive_reopen() {
    let temp = TempDir::new().unwrap();
    let db_path = temp.path().join("records.db");
    let key_path = temp.path().join("store.key");

    let last_seq;
    {
        let store = PasteStore::open(&db_path, Encryptor::new(&key_path).unwrap())
            .await
            .unwrap();
        for i in 0..3 {
            let record =
                PasteRecord::new(Uuid::new_v4(), PasteContent::Text(format!("item {i}")));
            store.upsert(&record).await.unwrap();
        }
        last_seq = store.latest_seq().await.unwrap();
    }

    let store = PasteStore::open(&db_path, Encryptor::new(&key_path).unwrap())
        .await
        .unwrap();
    assert_eq!(store.latest_seq().await.unwrap(), last_seq);

    // New writes continue past the old sequence.
    let record = PasteRecord::new(Uuid::new_v4(), PasteContent::Text("later".into()));
    let seq = store.upsert(&record).await.unwrap();
    assert!(seq > last_seq);

    let changes = store.changes_since(last_seq, 100).await.unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].id, record.id);
}

#[tokio::test]
async fn test_wrong_key_cannot_read_records() {
    let temp = TempDir::new().unwrap();
    let db_path = temp.path().join("records.db");

    let id;
    {
        let store = PasteStore::open(&db_path, Encryptor::new(&temp.path().join("a.key")).unwrap())
            .await
            .unwrap();
        let record = PasteRecord::new(Uuid::new_v4(), PasteContent::Text("secret".into()));
        id = record.id;
        store.upsert(&record).await.unwrap();
    }

    let store = PasteStore::open(&db_path, Encryptor::new(&temp.path().join("b.key")).unwrap())
        .await
        .unwrap();
    assert!(store.get(&id).await.is_err());
}
