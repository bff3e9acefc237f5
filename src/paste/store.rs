//! SQLite persistence for paste records
//!
//! Record content is encrypted at rest; the row keeps enough plaintext
//! metadata (hashes, timestamps, flags) for reconciliation queries
//! without decrypting anything.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::paste::{
    encryption::{EncryptedData, Encryptor},
    PasteContent, PasteRecord, StoreError,
};

const SCHEMA_VERSION: u32 = 1;

/// SQLite-backed paste record store
pub struct PasteStore {
    conn: Mutex<Connection>,
    encryptor: Encryptor,
}

impl PasteStore {
    /// Open (or create) the store at `path`
    pub async fn open(path: &Path, encryptor: Encryptor) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )?;

        let store = Self {
            conn: Mutex::new(conn),
            encryptor,
        };

        store.initialize().await?;
        Ok(store)
    }

    /// In-memory store for tests
    #[cfg(test)]
    pub async fn open_in_memory(encryptor: Encryptor) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            encryptor,
        };
        store.initialize().await?;
        Ok(store)
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;

        let version = Self::schema_version(&conn)?;
        if version == 0 {
            Self::create_schema(&conn)?;
        } else if version < SCHEMA_VERSION {
            Self::migrate_schema(&conn, version)?;
        }

        Ok(())
    }

    fn schema_version(conn: &Connection) -> Result<u32, StoreError> {
        let table_exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            [],
            |row| row.get(0),
        )?;

        if !table_exists {
            return Ok(0);
        }

        let version: Option<u32> = conn
            .query_row(
                "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        Ok(version.unwrap_or(0))
    }

    fn create_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER DEFAULT (strftime('%s', 'now'))
            );

            CREATE TABLE IF NOT EXISTS paste_records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                origin TEXT NOT NULL,
                hash TEXT NOT NULL,
                kind TEXT NOT NULL,
                content BLOB NOT NULL,
                nonce BLOB NOT NULL,
                compressed INTEGER NOT NULL DEFAULT 0,
                size INTEGER NOT NULL,
                favorite INTEGER NOT NULL DEFAULT 0,
                deleted INTEGER NOT NULL DEFAULT 0,
                complete INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX idx_records_hash ON paste_records(hash);
            CREATE INDEX idx_records_updated ON paste_records(updated_at DESC);
            ",
        )?;

        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?)",
            params![SCHEMA_VERSION],
        )?;

        Ok(())
    }

    fn migrate_schema(_conn: &Connection, _from_version: u32) -> Result<(), StoreError> {
        // Future migrations would go here
        Ok(())
    }

    /// Insert or replace a record, assigning it a fresh local sequence
    /// number. Returns the assigned sequence.
    pub async fn upsert(&self, record: &PasteRecord) -> Result<i64, StoreError> {
        let content_json = serde_json::to_vec(&record.content)?;
        let encrypted = self.encryptor.encrypt(&content_json)?;

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM paste_records WHERE id = ?",
            params![record.id.to_string()],
        )?;
        tx.execute(
            "INSERT INTO paste_records
             (id, origin, hash, kind, content, nonce, compressed, size,
              favorite, deleted, complete, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.id.to_string(),
                record.origin.to_string(),
                record.hash,
                record.content.kind(),
                &encrypted.ciphertext,
                &encrypted.nonce,
                encrypted.compressed as i32,
                record.content.size() as i64,
                record.favorite as i32,
                record.deleted as i32,
                record.complete as i32,
                record.created_at.timestamp_millis(),
                record.updated_at.timestamp_millis(),
            ],
        )?;

        let seq = tx.last_insert_rowid();
        tx.commit()?;
        Ok(seq)
    }

    /// Get a record by id, tombstones included
    pub async fn get(&self, id: &Uuid) -> Result<Option<PasteRecord>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("{SELECT_RECORD} WHERE id = ?"),
            params![id.to_string()],
            |row| Ok(self.row_to_record(row)),
        )
        .optional()?
        .transpose()
    }

    /// Find a live (non-tombstone) record with the given content hash
    pub async fn get_live_by_hash(&self, hash: &str) -> Result<Option<PasteRecord>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("{SELECT_RECORD} WHERE hash = ? AND deleted = 0 ORDER BY updated_at DESC LIMIT 1"),
            params![hash],
            |row| Ok(self.row_to_record(row)),
        )
        .optional()?
        .transpose()
    }

    /// Records with a sequence number past `since`, in sequence order
    pub async fn changes_since(
        &self,
        since: i64,
        limit: usize,
    ) -> Result<Vec<PasteRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare(&format!("{SELECT_RECORD} WHERE seq > ? ORDER BY seq ASC LIMIT ?"))?;

        let rows = stmt
            .query_map(params![since, limit as i64], |row| {
                Ok(self.row_to_record(row))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().collect()
    }

    /// Highest sequence number assigned so far
    pub async fn latest_seq(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        let seq: Option<i64> =
            conn.query_row("SELECT MAX(seq) FROM paste_records", [], |row| row.get(0))?;
        Ok(seq.unwrap_or(0))
    }

    /// Most recent live records
    pub async fn recent(&self, limit: usize) -> Result<Vec<PasteRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "{SELECT_RECORD} WHERE deleted = 0 ORDER BY updated_at DESC LIMIT ?"
        ))?;

        let rows = stmt
            .query_map(params![limit as i64], |row| Ok(self.row_to_record(row)))?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().collect()
    }

    /// Live records still waiting on blob pulls
    pub async fn incomplete(&self) -> Result<Vec<PasteRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "{SELECT_RECORD} WHERE complete = 0 AND deleted = 0 ORDER BY seq ASC"
        ))?;

        let rows = stmt
            .query_map([], |row| Ok(self.row_to_record(row)))?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().collect()
    }

    /// Mark a record's blobs as fully present
    pub async fn mark_complete(&self, id: &Uuid) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE paste_records SET complete = 1 WHERE id = ?",
            params![id.to_string()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(*id));
        }
        Ok(())
    }

    /// Number of live records
    pub async fn live_count(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM paste_records WHERE deleted = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Prune storage: drop the oldest non-favorite live records beyond
    /// `retention`, and tombstones older than `tombstone_before`.
    /// Returns the number of rows removed.
    pub async fn prune(
        &self,
        retention: usize,
        tombstone_before: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;

        let mut removed = conn.execute(
            "DELETE FROM paste_records
             WHERE deleted = 0 AND favorite = 0 AND seq IN (
                 SELECT seq FROM paste_records
                 WHERE deleted = 0 AND favorite = 0
                 ORDER BY updated_at DESC
                 LIMIT -1 OFFSET ?
             )",
            params![retention as i64],
        )?;

        removed += conn.execute(
            "DELETE FROM paste_records WHERE deleted = 1 AND updated_at < ?",
            params![tombstone_before.timestamp_millis()],
        )?;

        Ok(removed)
    }

    fn row_to_record(&self, row: &Row) -> Result<PasteRecord, StoreError> {
        let seq: i64 = row.get(0)?;
        let id: String = row.get(1)?;
        let origin: String = row.get(2)?;
        let hash: String = row.get(3)?;
        let ciphertext: Vec<u8> = row.get(4)?;
        let nonce: Vec<u8> = row.get(5)?;
        let compressed: i32 = row.get(6)?;
        let favorite: i32 = row.get(7)?;
        let deleted: i32 = row.get(8)?;
        let complete: i32 = row.get(9)?;
        let created_at: i64 = row.get(10)?;
        let updated_at: i64 = row.get(11)?;

        let id = Uuid::parse_str(&id).map_err(|_| StoreError::Corrupt(Uuid::nil()))?;

        let encrypted = EncryptedData {
            ciphertext,
            nonce,
            compressed: compressed != 0,
        };
        let content_json = self.encryptor.decrypt(&encrypted)?;
        let content: PasteContent = serde_json::from_slice(&content_json)?;

        let deleted = deleted != 0;
        // Tombstones carry cleared content, so only live rows can be
        // checked against their stored hash.
        if !deleted && content.content_hash() != hash {
            return Err(StoreError::Corrupt(id));
        }

        Ok(PasteRecord {
            id,
            origin: Uuid::parse_str(&origin).map_err(|_| StoreError::Corrupt(id))?,
            hash,
            content,
            favorite: favorite != 0,
            deleted,
            created_at: timestamp_millis(created_at),
            updated_at: timestamp_millis(updated_at),
            seq,
            complete: complete != 0,
        })
    }
}

const SELECT_RECORD: &str = "SELECT seq, id, origin, hash, content, nonce, compressed,
        favorite, deleted, complete, created_at, updated_at
 FROM paste_records";

fn timestamp_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paste::PasteContent;

    async fn test_store() -> PasteStore {
        let encryptor = Encryptor::from_key([3u8; 32]).unwrap();
        PasteStore::open_in_memory(encryptor).await.unwrap()
    }

    fn text_record(text: &str) -> PasteRecord {
        PasteRecord::new(Uuid::new_v4(), PasteContent::Text(text.to_string()))
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let store = test_store().await;
        let record = text_record("hello");

        let seq = store.upsert(&record).await.unwrap();
        assert!(seq > 0);

        let loaded = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded.content, record.content);
        assert_eq!(loaded.hash, record.hash);
        assert_eq!(loaded.seq, seq);
    }

    #[tokio::test]
    async fn test_upsert_bumps_seq() {
        let store = test_store().await;
        let mut record = text_record("v1");

        let first = store.upsert(&record).await.unwrap();
        record.content = PasteContent::Text("v2".into());
        record.hash = record.content.content_hash();
        record.updated_at = Utc::now();
        let second = store.upsert(&record).await.unwrap();

        assert!(second > first);
        assert_eq!(store.latest_seq().await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_changes_since() {
        let store = test_store().await;
        let a = text_record("a");
        let b = text_record("b");

        let seq_a = store.upsert(&a).await.unwrap();
        store.upsert(&b).await.unwrap();

        let changes = store.changes_since(seq_a, 100).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].id, b.id);

        let all = store.changes_since(0, 100).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_hash_lookup_skips_tombstones() {
        let store = test_store().await;
        let mut record = text_record("dedup me");
        let hash = record.hash.clone();

        store.upsert(&record).await.unwrap();
        assert!(store.get_live_by_hash(&hash).await.unwrap().is_some());

        record.tombstone();
        store.upsert(&record).await.unwrap();
        assert!(store.get_live_by_hash(&hash).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prune_retention_spares_favorites() {
        let store = test_store().await;

        let mut favorite = text_record("keep me");
        favorite.favorite = true;
        store.upsert(&favorite).await.unwrap();

        for i in 0..10 {
            store.upsert(&text_record(&format!("item {i}"))).await.unwrap();
        }

        let removed = store.prune(5, Utc::now() - chrono::Duration::days(30)).await.unwrap();
        assert_eq!(removed, 5);

        assert!(store.get(&favorite.id).await.unwrap().is_some());
        assert_eq!(store.live_count().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_prune_old_tombstones() {
        let store = test_store().await;

        let mut record = text_record("gone");
        record.tombstone();
        record.updated_at = Utc::now() - chrono::Duration::days(60);
        store.upsert(&record).await.unwrap();

        let removed = store
            .prune(100, Utc::now() - chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(&record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tombstone_roundtrip() {
        let store = test_store().await;
        let mut record = text_record("to delete");
        record.tombstone();

        store.upsert(&record).await.unwrap();
        let loaded = store.get(&record.id).await.unwrap().unwrap();
        assert!(loaded.deleted);
        // Hash survives the tombstone for dedup purposes.
        assert_eq!(loaded.hash, record.hash);
    }
}
